//! Single-shot, re-armable completion signal for in-flight deduplication.
//!
//! A [`Flight`] collapses duplicate concurrent operations (e.g. two callers
//! asking to load the same cache) onto one execution: the first caller
//! becomes the *leader* and performs the real work; every caller arriving
//! while the flight is pending becomes a *follower* and awaits the leader's
//! outcome instead of starting a second operation. Once the leader calls
//! [`finish`](Flight::finish), the flight returns to idle and the next
//! `begin` elects a new leader.
//!
//! ```text
//!   caller 1 ──begin()──► Leader ──work──► finish(result) ─┐
//!   caller 2 ──begin()──► Follower(rx) ──await─────────────┼──► same result
//!   caller 3 ──begin()──► Follower(rx) ──await─────────────┘
//! ```
//!
//! The result type only needs to be `Clone`; there is no cancellation — a
//! leader that is dropped without finishing surfaces to followers as a
//! closed flight ([`Flight::join`] returns `None`).

use parking_lot::Mutex;
use tokio::sync::watch;

type Outcome<E> = Option<Result<(), E>>;

/// Role handed out by [`Flight::begin`].
#[derive(Debug)]
pub enum FlightTicket<E> {
    /// This caller must perform the operation and call [`Flight::finish`].
    Leader,
    /// Another caller is already performing the operation; await its
    /// outcome with [`Flight::join`].
    Follower(watch::Receiver<Outcome<E>>),
}

/// Re-armable single-consumer-broadcast completion slot.
///
/// # Example
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use stashkit::ds::{Flight, FlightTicket};
///
/// let flight: Flight<String> = Flight::new();
///
/// let follower = match flight.begin() {
///     FlightTicket::Leader => {
///         // Second arrival while we are pending becomes a follower.
///         match flight.begin() {
///             FlightTicket::Follower(rx) => rx,
///             FlightTicket::Leader => unreachable!("flight already pending"),
///         }
///     }
///     FlightTicket::Follower(_) => unreachable!("flight starts idle"),
/// };
///
/// flight.finish(Ok(()));
/// assert_eq!(Flight::join(follower).await, Some(Ok(())));
/// assert!(!flight.is_pending());
/// # });
/// ```
#[derive(Debug)]
pub struct Flight<E> {
    slot: Mutex<Option<watch::Sender<Outcome<E>>>>,
}

impl<E: Clone> Flight<E> {
    /// Creates an idle flight.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Returns `true` while a leader is working and has not finished.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Elects this caller leader, or hands back a receiver for the
    /// already-pending operation.
    pub fn begin(&self) -> FlightTicket<E> {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(sender) => FlightTicket::Follower(sender.subscribe()),
            None => {
                let (sender, _) = watch::channel(None);
                *slot = Some(sender);
                FlightTicket::Leader
            }
        }
    }

    /// Publishes the leader's outcome to every follower and re-arms the
    /// flight for the next operation.
    ///
    /// Calling this without a pending flight is a no-op.
    pub fn finish(&self, result: Result<(), E>) {
        let sender = self.slot.lock().take();
        if let Some(sender) = sender {
            // Receivers may all have been dropped; that is fine.
            let _ = sender.send(Some(result));
        }
    }

    /// Awaits the outcome observed by a follower.
    ///
    /// Returns `None` if the leader was dropped without finishing.
    pub async fn join(mut rx: watch::Receiver<Outcome<E>>) -> Option<Result<(), E>> {
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return Some(result);
            }
            if rx.changed().await.is_err() {
                // Sender gone; pick up a final value if one was sent.
                return rx.borrow().clone();
            }
        }
    }
}

impl<E: Clone> Default for Flight<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_caller_leads_followers_share_outcome() {
        let flight: Flight<&'static str> = Flight::new();

        assert!(matches!(flight.begin(), FlightTicket::Leader));
        assert!(flight.is_pending());

        let rx_a = match flight.begin() {
            FlightTicket::Follower(rx) => rx,
            FlightTicket::Leader => panic!("second caller must follow"),
        };
        let rx_b = match flight.begin() {
            FlightTicket::Follower(rx) => rx,
            FlightTicket::Leader => panic!("third caller must follow"),
        };

        flight.finish(Ok(()));

        assert_eq!(Flight::join(rx_a).await, Some(Ok(())));
        assert_eq!(Flight::join(rx_b).await, Some(Ok(())));
        assert!(!flight.is_pending());
    }

    #[tokio::test]
    async fn failure_reaches_every_follower() {
        let flight: Flight<&'static str> = Flight::new();
        assert!(matches!(flight.begin(), FlightTicket::Leader));

        let rx = match flight.begin() {
            FlightTicket::Follower(rx) => rx,
            FlightTicket::Leader => panic!(),
        };

        flight.finish(Err("storage offline"));
        assert_eq!(Flight::join(rx).await, Some(Err("storage offline")));
    }

    #[tokio::test]
    async fn rearms_after_finish() {
        let flight: Flight<&'static str> = Flight::new();

        assert!(matches!(flight.begin(), FlightTicket::Leader));
        flight.finish(Ok(()));

        // A fresh operation elects a fresh leader.
        assert!(matches!(flight.begin(), FlightTicket::Leader));
        flight.finish(Ok(()));
    }

    #[tokio::test]
    async fn join_resolves_even_when_finished_before_await() {
        let flight: Flight<&'static str> = Flight::new();
        assert!(matches!(flight.begin(), FlightTicket::Leader));

        let rx = match flight.begin() {
            FlightTicket::Follower(rx) => rx,
            FlightTicket::Leader => panic!(),
        };

        // Finish before the follower ever polls.
        flight.finish(Ok(()));
        assert_eq!(Flight::join(rx).await, Some(Ok(())));
    }

    #[tokio::test]
    async fn finish_without_begin_is_noop() {
        let flight: Flight<&'static str> = Flight::new();
        flight.finish(Ok(()));
        assert!(!flight.is_pending());
    }
}
