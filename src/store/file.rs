//! File-backed storage using newline-delimited JSON.
//!
//! One record per line, in the flat `{key, expiry, value, state}` shape:
//!
//! ```text
//! {"key":"a","value":1}
//! {"key":"b","expiry":5000,"value":2,"state":{"last_time":1700000000000}}
//! ```
//!
//! The format is append-friendly to inspect and diff, and decode errors can
//! point at the exact offending line. Saves go through a sibling temp file
//! followed by a rename, so a crash mid-save leaves the previous file
//! intact rather than a truncated one.
//!
//! A missing file is an empty cache, not an error: the first load of a
//! fresh path yields no records, and the file appears on first save.

use std::io::{BufRead, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;

use crate::error::CacheError;
use crate::record::Record;
use crate::traits::Storage;

/// Newline-delimited JSON storage in a single file.
///
/// # Example
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use stashkit::record::Record;
/// use stashkit::store::FileStorage;
/// use stashkit::traits::Storage;
///
/// let dir = tempfile::tempdir().unwrap();
/// let storage: FileStorage<i32, u64, u64> = FileStorage::new(dir.path().join("cache.ndjson"));
///
/// // Fresh path: empty, not an error.
/// assert!(storage.load().await.unwrap().is_empty());
///
/// storage.save(vec![Record::new("a".into(), 1)]).await.unwrap();
/// let records = storage.load().await.unwrap();
/// assert_eq!(records.len(), 1);
/// assert_eq!(records[0].value, 1);
/// # });
/// ```
#[derive(Debug)]
pub struct FileStorage<T, E, X> {
    path: PathBuf,
    _marker: PhantomData<fn() -> (T, E, X)>,
}

impl<T, E, X> FileStorage<T, E, X> {
    /// Creates storage backed by the file at `path`.
    ///
    /// The file is not touched until the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn decode_line<R: DeserializeOwned>(line: &str, number: usize) -> Result<R, CacheError> {
    serde_json::from_str(line).map_err(|err| CacheError::Decode {
        line: number,
        cause: Arc::new(err),
    })
}

fn encode_records<T, E, X>(records: &[Record<T, E, X>]) -> Result<Vec<u8>, CacheError>
where
    T: Serialize,
    E: Serialize,
    X: Serialize,
{
    let mut buffer = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buffer, record)
            .map_err(|err| CacheError::Encode(Arc::new(err)))?;
        buffer.push(b'\n');
    }
    Ok(buffer)
}

#[async_trait]
impl<T, E, X> Storage<T, E, X> for FileStorage<T, E, X>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
    X: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Vec<Record<T, E, X>>, CacheError> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no cache file yet, loading empty");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut number = 0;
        while let Some(line) = lines.next_line().await? {
            number += 1;
            if line.trim().is_empty() {
                continue;
            }
            records.push(decode_line(&line, number)?);
        }
        tracing::debug!(path = %self.path.display(), count = records.len(), "loaded records");
        Ok(records)
    }

    fn load_sync(&self) -> Result<Vec<Record<T, E, X>>, CacheError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(decode_line(&line, index + 1)?);
        }
        Ok(records)
    }

    async fn save(&self, records: Vec<Record<T, E, X>>) -> Result<(), CacheError> {
        // Encode everything before touching the filesystem so an encode
        // failure leaves the previous file untouched.
        let buffer = encode_records(&records)?;

        // The engine serializes saves, so a fixed sibling temp name cannot
        // collide with another in-flight save of the same file.
        let temp = self.temp_path();
        tokio::fs::write(&temp, &buffer).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), count = records.len(), "saved records");
        Ok(())
    }

    fn save_sync(&self, records: Vec<Record<T, E, X>>) -> Result<(), CacheError> {
        let buffer = encode_records(&records)?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&buffer)?;
        temp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestStorage = FileStorage<String, u64, u64>;

    fn record(key: &str, value: &str) -> Record<String, u64, u64> {
        Record::new(key.into(), value.into())
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage: TestStorage = FileStorage::new(dir.path().join("absent.ndjson"));

        assert!(storage.load().await.unwrap().is_empty());
        assert!(storage.load_sync().unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let storage: TestStorage = FileStorage::new(dir.path().join("cache.ndjson"));

        let records = vec![record("a", "1"), record("b", "2")];
        storage.save(records.clone()).await.unwrap();

        assert_eq!(storage.load().await.unwrap(), records);
        assert_eq!(storage.load_sync().unwrap(), records);
    }

    #[test]
    fn sync_save_then_sync_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let storage: TestStorage = FileStorage::new(dir.path().join("cache.ndjson"));

        let records = vec![record("a", "1")];
        storage.save_sync(records.clone()).unwrap();
        assert_eq!(storage.load_sync().unwrap(), records);
    }

    #[tokio::test]
    async fn save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let storage: TestStorage = FileStorage::new(dir.path().join("cache.ndjson"));

        storage.save(vec![record("a", "1"), record("b", "2")]).await.unwrap();
        storage.save(vec![record("c", "3")]).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded, vec![record("c", "3")]);
    }

    #[tokio::test]
    async fn decode_error_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.ndjson");
        let good = serde_json::to_string(&record("a", "1")).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n")).unwrap();

        let storage: TestStorage = FileStorage::new(&path);
        match storage.load().await {
            Err(CacheError::Decode { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.ndjson");
        let good = serde_json::to_string(&record("a", "1")).unwrap();
        std::fs::write(&path, format!("\n{good}\n\n")).unwrap();

        let storage: TestStorage = FileStorage::new(&path);
        assert_eq!(storage.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn records_persist_one_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.ndjson");
        let storage: TestStorage = FileStorage::new(&path);

        storage.save(vec![record("a", "1"), record("b", "2")]).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
