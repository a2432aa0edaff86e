// * Metadata Store
// * Owns the image table and the hash table; the single source of truth for what is on disk

use crate::persistence::schema::{HashRecord, ImageRecord, NewImageRecord, SchemaError, SourceCount};
use crate::refinery::phash::PHash;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub const IMAGES_FILE: &str = "images.jsonl";
pub const HASHES_FILE: &str = "hashes.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rejected record: {0}")]
    Schema(#[from] SchemaError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Type alias for async store results
pub type AsyncResult<T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send>>;

/// Persistence seam for image metadata and perceptual hashes.
///
/// Every call is a single atomic operation; implementations serialize their own writes.
pub trait MetadataStore: Send + Sync {
    fn has_exact_hash(&self, phash: PHash) -> AsyncResult<bool>;

    /// Returns true if the hash was newly inserted
    fn insert_hash(&self, phash: PHash) -> AsyncResult<bool>;

    fn insert_image_record(&self, record: NewImageRecord) -> AsyncResult<ImageRecord>;

    /// Every persisted hash, used once at startup to rebuild the in-memory index
    fn iter_all_hashes(&self) -> AsyncResult<Vec<PHash>>;

    fn count_images(&self) -> AsyncResult<u64>;

    /// Image counts per source domain, largest first
    fn count_by_source(&self, limit: usize) -> AsyncResult<Vec<SourceCount>>;
}

/// Shared bookkeeping for both store implementations
#[derive(Debug, Default)]
struct Tables {
    hashes: HashSet<PHash>,
    images: u64,
    next_id: u64,
    by_source: HashMap<String, u64>,
}

impl Tables {
    fn add_image(&mut self, record: &ImageRecord) {
        self.images += 1;
        self.next_id = self.next_id.max(record.id + 1);
        *self.by_source.entry(record.source.clone()).or_insert(0) += 1;
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    fn top_sources(&self, limit: usize) -> Vec<SourceCount> {
        let mut counts: Vec<SourceCount> = self
            .by_source
            .iter()
            .map(|(source, &count)| SourceCount {
                source: source.clone(),
                count,
            })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source)));
        counts.truncate(limit);
        counts
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<Tables>,
    records: RwLock<Vec<ImageRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds the hash table, as if the hashes had been persisted by an earlier run
    pub fn with_hashes<I: IntoIterator<Item = PHash>>(hashes: I) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write().unwrap_or_else(|e| e.into_inner());
            tables.hashes.extend(hashes);
        }
        store
    }

    /// Snapshot of every stored record
    pub fn records(&self) -> Vec<ImageRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn has_exact_hash(&self, phash: PHash) -> AsyncResult<bool> {
        let found = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .hashes
            .contains(&phash);
        Box::pin(async move { Ok(found) })
    }

    fn insert_hash(&self, phash: PHash) -> AsyncResult<bool> {
        let inserted = self
            .tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .hashes
            .insert(phash);
        Box::pin(async move { Ok(inserted) })
    }

    fn insert_image_record(&self, record: NewImageRecord) -> AsyncResult<ImageRecord> {
        if let Err(e) = record.validate() {
            return Box::pin(async move { Err(StoreError::from(e)) });
        }

        let stored = {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let stored = record.into_record(tables.allocate_id());
            tables.add_image(&stored);
            stored
        };
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(stored.clone());

        Box::pin(async move { Ok(stored) })
    }

    fn iter_all_hashes(&self) -> AsyncResult<Vec<PHash>> {
        let hashes: Vec<PHash> = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .hashes
            .iter()
            .copied()
            .collect();
        Box::pin(async move { Ok(hashes) })
    }

    fn count_images(&self) -> AsyncResult<u64> {
        let count = self.tables.read().unwrap_or_else(|e| e.into_inner()).images;
        Box::pin(async move { Ok(count) })
    }

    fn count_by_source(&self, limit: usize) -> AsyncResult<Vec<SourceCount>> {
        let counts = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .top_sources(limit);
        Box::pin(async move { Ok(counts) })
    }
}

struct JsonlState {
    tables: Tables,
    images_file: LineAppender<File>,
    hashes_file: LineAppender<File>,
}

/// Appends one JSON document per line.
///
/// A write that fails part way leaves the handle dirty, and the next append
/// starts with a newline so the torn fragment never merges into a good row.
struct LineAppender<W> {
    writer: W,
    dirty: bool,
}

impl<W: AsyncWrite + Unpin> LineAppender<W> {
    fn new(writer: W, dirty: bool) -> Self {
        Self { writer, dirty }
    }

    async fn append<T: serde::Serialize>(&mut self, row: &T) -> Result<(), StoreError> {
        let mut line = Vec::new();
        if self.dirty {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, row)?;
        line.push(b'\n');

        self.dirty = true;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        self.dirty = false;
        Ok(())
    }
}

/// Append-only store backed by `images.jsonl` and `hashes.jsonl` in one directory.
///
/// Both files are replayed on open. A torn trailing line from a crash is skipped.
#[derive(Clone)]
pub struct JsonlMetadataStore {
    dir: PathBuf,
    state: Arc<Mutex<JsonlState>>,
}

impl JsonlMetadataStore {
    /// Opens (or creates) a store directory and replays its contents
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut tables = Tables::default();

        let (records, images_torn) = read_lines::<ImageRecord>(&dir.join(IMAGES_FILE)).await?;
        for record in records {
            tables.add_image(&record);
        }
        let (rows, hashes_torn) = read_lines::<HashRecord>(&dir.join(HASHES_FILE)).await?;
        for row in rows {
            tables.hashes.insert(row.phash);
        }

        tracing::info!(
            dir = %dir.display(),
            images = tables.images,
            hashes = tables.hashes.len(),
            "Metadata store opened"
        );

        let images_file = append_handle(&dir.join(IMAGES_FILE), images_torn).await?;
        let hashes_file = append_handle(&dir.join(HASHES_FILE), hashes_torn).await?;

        Ok(Self {
            dir,
            state: Arc::new(Mutex::new(JsonlState {
                tables,
                images_file,
                hashes_file,
            })),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn append_handle(path: &Path, torn_tail: bool) -> Result<LineAppender<File>, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    // * A torn last line is terminated by the first append
    Ok(LineAppender::new(file, torn_tail))
}

/// Replays a JSONL file. The flag is true when the file does not end in a newline.
async fn read_lines<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<(Vec<T>, bool), StoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(e.into()),
    };
    let torn_tail = !raw.is_empty() && !raw.ends_with('\n');

    let mut rows = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(row) => rows.push(row),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping unreadable store line"
            ),
        }
    }
    Ok((rows, torn_tail))
}

impl MetadataStore for JsonlMetadataStore {
    fn has_exact_hash(&self, phash: PHash) -> AsyncResult<bool> {
        let state = Arc::clone(&self.state);
        Box::pin(async move { Ok(state.lock().await.tables.hashes.contains(&phash)) })
    }

    fn insert_hash(&self, phash: PHash) -> AsyncResult<bool> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut guard = state.lock().await;
            if guard.tables.hashes.contains(&phash) {
                return Ok(false);
            }
            guard.hashes_file.append(&HashRecord { phash }).await?;
            guard.tables.hashes.insert(phash);
            Ok::<_, StoreError>(true)
        })
    }

    fn insert_image_record(&self, record: NewImageRecord) -> AsyncResult<ImageRecord> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            record.validate()?;
            let mut guard = state.lock().await;
            let id = guard.tables.allocate_id();
            let stored = record.into_record(id);
            guard.images_file.append(&stored).await?;
            guard.tables.add_image(&stored);
            Ok::<_, StoreError>(stored)
        })
    }

    fn iter_all_hashes(&self) -> AsyncResult<Vec<PHash>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move { Ok(state.lock().await.tables.hashes.iter().copied().collect()) })
    }

    fn count_images(&self) -> AsyncResult<u64> {
        let state = Arc::clone(&self.state);
        Box::pin(async move { Ok(state.lock().await.tables.images) })
    }

    fn count_by_source(&self, limit: usize) -> AsyncResult<Vec<SourceCount>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move { Ok(state.lock().await.tables.top_sources(limit)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll};

    // * Accepts `budget` bytes, then fails every write
    struct ShortWriter {
        written: Vec<u8>,
        budget: usize,
    }

    impl AsyncWrite for ShortWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            if this.budget == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            let n = buf.len().min(this.budget);
            this.budget -= n;
            this.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn record(source: &str, phash: u64) -> NewImageRecord {
        NewImageRecord {
            url: format!("https://{}/{:x}.jpg", source, phash),
            source: source.to_string(),
            width: 640,
            height: 480,
            ext: "jpg".to_string(),
            saved_path: PathBuf::from(format!("/tmp/{:x}.jpg", phash)),
            score: None,
            phash: PHash(phash),
        }
    }

    #[tokio::test]
    async fn test_in_memory_hash_table_is_idempotent() {
        let store = InMemoryMetadataStore::new();
        assert!(!store.has_exact_hash(PHash(1)).await.unwrap());
        assert!(store.insert_hash(PHash(1)).await.unwrap());
        assert!(!store.insert_hash(PHash(1)).await.unwrap());
        assert!(store.has_exact_hash(PHash(1)).await.unwrap());
        assert_eq!(store.iter_all_hashes().await.unwrap(), vec![PHash(1)]);
    }

    #[tokio::test]
    async fn test_in_memory_records_and_counts() {
        let store = InMemoryMetadataStore::new();
        let first = store.insert_image_record(record("a.com", 1)).await.unwrap();
        let second = store.insert_image_record(record("b.com", 2)).await.unwrap();
        store.insert_image_record(record("a.com", 3)).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(store.count_images().await.unwrap(), 3);

        let by_source = store.count_by_source(10).await.unwrap();
        assert_eq!(by_source[0], SourceCount { source: "a.com".to_string(), count: 2 });
        assert_eq!(by_source[1].source, "b.com");
        assert_eq!(store.count_by_source(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_record_is_rejected() {
        let store = InMemoryMetadataStore::new();
        let mut bad = record("a.com", 1);
        bad.width = 0;
        let err = store.insert_image_record(bad).await.unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));
        assert_eq!(store.count_images().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = JsonlMetadataStore::open(dir.path()).await.unwrap();
            assert!(store.insert_hash(PHash(0xaa)).await.unwrap());
            assert!(store.insert_hash(PHash(0xbb)).await.unwrap());
            store.insert_image_record(record("a.com", 0xaa)).await.unwrap();
            store.insert_image_record(record("b.com", 0xbb)).await.unwrap();
        }

        let reopened = JsonlMetadataStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.count_images().await.unwrap(), 2);
        assert!(reopened.has_exact_hash(PHash(0xaa)).await.unwrap());
        assert!(!reopened.insert_hash(PHash(0xbb)).await.unwrap());

        let mut hashes = reopened.iter_all_hashes().await.unwrap();
        hashes.sort();
        assert_eq!(hashes, vec![PHash(0xaa), PHash(0xbb)]);

        // * Ids continue after the replayed maximum
        let next = reopened.insert_image_record(record("a.com", 0xcc)).await.unwrap();
        assert_eq!(next.id, 3);
    }

    #[tokio::test]
    async fn test_jsonl_store_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlMetadataStore::open(dir.path()).await.unwrap();
            store.insert_hash(PHash(1)).await.unwrap();
        }
        let path = dir.path().join(HASHES_FILE);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"phash\":\"00ff");
        std::fs::write(&path, raw).unwrap();

        let reopened = JsonlMetadataStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.iter_all_hashes().await.unwrap(), vec![PHash(1)]);
        assert!(reopened.insert_hash(PHash(2)).await.unwrap());
        drop(reopened);

        let again = JsonlMetadataStore::open(dir.path()).await.unwrap();
        let mut hashes = again.iter_all_hashes().await.unwrap();
        hashes.sort();
        assert_eq!(hashes, vec![PHash(1), PHash(2)]);
    }

    #[tokio::test]
    async fn test_failed_append_does_not_corrupt_next_row() {
        let mut appender = LineAppender::new(
            ShortWriter {
                written: Vec::new(),
                budget: 6,
            },
            false,
        );

        assert!(appender.append(&HashRecord { phash: PHash(1) }).await.is_err());
        appender.writer.budget = usize::MAX;
        appender.append(&HashRecord { phash: PHash(2) }).await.unwrap();
        appender.append(&HashRecord { phash: PHash(3) }).await.unwrap();

        let raw = String::from_utf8(appender.writer.written.clone()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(serde_json::from_str::<HashRecord>(lines[0]).is_err());
        assert_eq!(serde_json::from_str::<HashRecord>(lines[1]).unwrap().phash, PHash(2));
        assert_eq!(serde_json::from_str::<HashRecord>(lines[2]).unwrap().phash, PHash(3));
        assert!(raw.ends_with('\n'));
    }
}
