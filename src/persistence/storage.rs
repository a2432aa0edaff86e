// * Storage Writer
// * Encode into scratch -> link into the dataset tree -> record metadata, in that order

use crate::config::{SaveFormat, StorageConfig};
use crate::engine::normalization::extension_from_url;
use crate::persistence::schema::{ImageRecord, NewImageRecord};
use crate::persistence::store::{MetadataStore, StoreError};
use crate::refinery::RefinedImage;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use rand::Rng;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

// * Fresh names tried before a placement gives up
const PLACE_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Blocking task failed: {0}")]
    Join(String),

    #[error("No free file name under {dir} after {attempts} attempts")]
    NameExhausted { dir: PathBuf, attempts: usize },

    #[error("File placed at {path} but metadata insert failed: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: StoreError,
    },
}

impl StorageError {
    /// True when the file reached its final path without a metadata row
    pub fn is_orphan(&self) -> bool {
        matches!(self, StorageError::Metadata { .. })
    }
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes accepted images into `root/<UTC date>/<domain>/img_<ms>_<rand>.<ext>`.
///
/// Linking the finished scratch file into the tree is the commit point. The link
/// never replaces an existing file, so every record owns its own file. A crash
/// before the link leaves nothing in the dataset tree; a crash after it leaves at
/// worst an orphan file with no record, never a record without a file.
pub struct StorageWriter {
    root: PathBuf,
    scratch: PathBuf,
    save_format: SaveFormat,
    jpeg_quality: u8,
    extensions: Vec<String>,
    store: Arc<dyn MetadataStore>,
    initial_bytes: u64,
    written_bytes: AtomicU64,
    budget_bytes: Option<u64>,
    scratch_seq: AtomicU64,
}

impl StorageWriter {
    /// Creates the root and scratch directories and measures the existing tree
    pub async fn open(
        config: &StorageConfig,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Self, StorageError> {
        let root = config.root.clone();
        let scratch = config.scratch_dir();

        tokio::fs::create_dir_all(&root).await.map_err(io_at(&root))?;
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(io_at(&scratch))?;

        let budget_bytes = config.max_folder_bytes();
        let initial_bytes = if budget_bytes.is_some() {
            let walk_root = root.clone();
            tokio::task::spawn_blocking(move || folder_size(&walk_root))
                .await
                .map_err(|e| StorageError::Join(e.to_string()))?
        } else {
            0
        };

        tracing::info!(
            root = %root.display(),
            scratch = %scratch.display(),
            initial_bytes = initial_bytes,
            budget_bytes = ?budget_bytes,
            "Storage writer ready"
        );

        Ok(Self {
            root,
            scratch,
            save_format: config.save_format,
            jpeg_quality: config.jpeg_quality,
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            store,
            initial_bytes,
            written_bytes: AtomicU64::new(0),
            budget_bytes,
            scratch_seq: AtomicU64::new(0),
        })
    }

    /// Picks the on-disk extension and encoder for an image fetched from `url`
    pub fn plan_format(&self, url: &str) -> (String, ImageFormat) {
        if self.save_format == SaveFormat::Original {
            if let Some(ext) = extension_from_url(url) {
                if self.extensions.iter().any(|allowed| *allowed == ext) {
                    if let Some(format) = ImageFormat::from_extension(&ext) {
                        if format.writing_enabled() {
                            return (ext, format);
                        }
                    }
                }
            }
        }
        ("jpg".to_string(), ImageFormat::Jpeg)
    }

    /// Final path for a new file from `source`
    pub fn destination(&self, source: &str, ext: &str) -> PathBuf {
        let now = chrono::Utc::now();
        let disambiguator: u32 = rand::thread_rng().gen_range(1000..=9999);
        self.root
            .join(now.format("%Y-%m-%d").to_string())
            .join(sanitize_segment(source))
            .join(format!(
                "img_{}_{}.{}",
                now.timestamp_millis(),
                disambiguator,
                ext
            ))
    }

    /// Persists an accepted image and records it in the metadata store
    pub async fn write(
        &self,
        refined: RefinedImage,
        url: &str,
        source: &str,
    ) -> Result<ImageRecord, StorageError> {
        let (ext, format) = self.plan_format(url);
        let temp_path = self.scratch.join(format!(
            "{}_{}.part",
            chrono::Utc::now().timestamp_millis(),
            self.scratch_seq.fetch_add(1, Ordering::Relaxed)
        ));

        let width = refined.image.width;
        let height = refined.image.height;

        // * 1. Encode into scratch
        let quality = self.jpeg_quality;
        let encode_path = temp_path.clone();
        let image = refined.image.image;
        let encoded = tokio::task::spawn_blocking(move || {
            encode_to_file(&image, &encode_path, format, quality)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))
        .and_then(|result| result);

        let size = match encoded {
            Ok(size) => size,
            Err(e) => {
                discard_temp(&temp_path).await;
                return Err(e);
            }
        };

        // * 2. Link into the dataset tree under a name nobody holds
        let destination = match self.place(&temp_path, source, &ext).await {
            Ok(destination) => destination,
            Err(e) => {
                discard_temp(&temp_path).await;
                return Err(e);
            }
        };
        self.written_bytes.fetch_add(size, Ordering::Relaxed);

        // * 3. Record metadata, only once the file is in place
        let record = NewImageRecord {
            url: url.to_string(),
            source: source.to_string(),
            width,
            height,
            ext,
            saved_path: destination.clone(),
            score: refined.score,
            phash: refined.phash,
        };

        match self.store.insert_image_record(record).await {
            Ok(stored) => {
                tracing::debug!(
                    path = %destination.display(),
                    bytes = size,
                    phash = %stored.phash,
                    "Image stored"
                );
                Ok(stored)
            }
            Err(source) => {
                tracing::error!(
                    path = %destination.display(),
                    url = %url,
                    error = %source,
                    "ORPHAN FILE: metadata insert failed after placement"
                );
                Err(StorageError::Metadata {
                    path: destination,
                    source,
                })
            }
        }
    }

    async fn place(&self, temp_path: &Path, source: &str, ext: &str) -> Result<PathBuf, StorageError> {
        let mut last_dir = self.root.clone();
        for _ in 0..PLACE_ATTEMPTS {
            let destination = self.destination(source, ext);
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(io_at(parent))?;
                last_dir = parent.to_path_buf();
            }
            if link_no_clobber(temp_path, &destination)
                .await
                .map_err(io_at(&destination))?
            {
                discard_temp(temp_path).await;
                return Ok(destination);
            }
            tracing::debug!(path = %destination.display(), "File name taken, drawing another");
        }
        Err(StorageError::NameExhausted {
            dir: last_dir,
            attempts: PLACE_ATTEMPTS,
        })
    }

    /// Bytes in the storage tree: measured at open plus everything written since
    pub fn total_bytes(&self) -> u64 {
        self.initial_bytes + self.written_bytes.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    /// True once the configured folder budget is used up
    pub fn budget_exhausted(&self) -> bool {
        match self.budget_bytes {
            Some(budget) => self.total_bytes() >= budget,
            None => false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }
}

fn encode_to_file(
    image: &DynamicImage,
    path: &Path,
    format: ImageFormat,
    jpeg_quality: u8,
) -> Result<u64, StorageError> {
    let file = std::fs::File::create(path).map_err(io_at(path))?;
    let mut writer = BufWriter::new(file);

    match format {
        ImageFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut writer, jpeg_quality);
            image.to_rgb8().write_with_encoder(encoder)?;
        }
        other => image.write_to(&mut writer, other)?,
    }

    writer.flush().map_err(io_at(path))?;
    let file = writer.get_ref();
    file.sync_all().map_err(io_at(path))?;
    let size = file.metadata().map_err(io_at(path))?.len();
    Ok(size)
}

/// Hard-links `from` to `to` unless `to` already exists. Ok(false) means the name is taken.
async fn link_no_clobber(from: &Path, to: &Path) -> std::io::Result<bool> {
    match tokio::fs::hard_link(from, to).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

async fn discard_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to clean up temp file");
        }
    }
}

/// Total size of every file under `root`
pub fn folder_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Makes a domain usable as a single path segment (`host:8080` -> `host_8080`)
pub fn sanitize_segment(source: &str) -> String {
    let cleaned: String = source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::{AsyncResult, InMemoryMetadataStore};
    use crate::persistence::schema::SourceCount;
    use crate::refinery::{DecodedImage, PHash};
    use image::{Rgb, RgbImage};

    struct BrokenStore;

    impl MetadataStore for BrokenStore {
        fn has_exact_hash(&self, _phash: PHash) -> AsyncResult<bool> {
            Box::pin(async { Ok(false) })
        }
        fn insert_hash(&self, _phash: PHash) -> AsyncResult<bool> {
            Box::pin(async { Ok(true) })
        }
        fn insert_image_record(&self, _record: NewImageRecord) -> AsyncResult<ImageRecord> {
            Box::pin(async { Err(StoreError::Unavailable("disk full".to_string())) })
        }
        fn iter_all_hashes(&self) -> AsyncResult<Vec<PHash>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn count_images(&self) -> AsyncResult<u64> {
            Box::pin(async { Ok(0) })
        }
        fn count_by_source(&self, _limit: usize) -> AsyncResult<Vec<SourceCount>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn refined() -> RefinedImage {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, 100])
        }));
        RefinedImage {
            image: DecodedImage::from_image(image),
            score: Some(0.8),
            phash: PHash(0xfeed),
        }
    }

    fn config(dir: &Path, save_format: SaveFormat) -> StorageConfig {
        StorageConfig {
            root: dir.join("dataset"),
            save_format,
            ..Default::default()
        }
    }

    fn files_under(path: &Path) -> Vec<PathBuf> {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect()
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("img.example.com"), "img.example.com");
        assert_eq!(sanitize_segment("127.0.0.1:8080"), "127.0.0.1_8080");
        assert_eq!(sanitize_segment(".."), "unknown");
    }

    #[tokio::test]
    async fn test_write_places_file_then_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let writer = StorageWriter::open(&config(dir.path(), SaveFormat::Jpeg), store.clone())
            .await
            .unwrap();

        let record = writer
            .write(refined(), "https://cdn.example.com/a/photo.png", "cdn.example.com")
            .await
            .unwrap();

        assert_eq!(record.ext, "jpg");
        assert_eq!((record.width, record.height), (64, 48));
        assert!(record.saved_path.exists());

        // * root/<date>/<domain>/img_<ms>_<rand>.jpg
        let relative = record.saved_path.strip_prefix(writer.root()).unwrap();
        let parts: Vec<String> = relative
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 10);
        assert_eq!(parts[1], "cdn.example.com");
        assert!(parts[2].starts_with("img_") && parts[2].ends_with(".jpg"));

        assert!(files_under(writer.scratch_dir()).is_empty());
        assert_eq!(store.records().len(), 1);
        assert!(writer.written_bytes() > 0);
    }

    #[tokio::test]
    async fn test_original_format_keeps_allowed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let writer = StorageWriter::open(&config(dir.path(), SaveFormat::Original), store)
            .await
            .unwrap();

        assert_eq!(writer.plan_format("https://x.com/a.png").0, "png");
        assert_eq!(writer.plan_format("https://x.com/a.JPEG?w=1").0, "jpeg");
        // * Not in the allow-list, falls back to JPEG
        assert_eq!(writer.plan_format("https://x.com/a.webp").0, "jpg");
        assert_eq!(writer.plan_format("https://x.com/no-extension").0, "jpg");

        let record = writer
            .write(refined(), "https://x.com/a.png", "x.com")
            .await
            .unwrap();
        let reread = image::open(&record.saved_path).unwrap();
        assert_eq!(reread.width(), 64);
    }

    #[tokio::test]
    async fn test_metadata_failure_leaves_orphan_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StorageWriter::open(&config(dir.path(), SaveFormat::Jpeg), Arc::new(BrokenStore))
            .await
            .unwrap();

        let err = writer
            .write(refined(), "https://x.com/a.jpg", "x.com")
            .await
            .unwrap_err();
        assert!(err.is_orphan());
        if let StorageError::Metadata { path, .. } = err {
            assert!(path.exists());
        }
    }

    #[tokio::test]
    async fn test_placement_failure_cleans_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let writer = StorageWriter::open(&config(dir.path(), SaveFormat::Jpeg), store.clone())
            .await
            .unwrap();

        // * A plain file where the date directory should go blocks placement
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        std::fs::write(writer.root().join(&date), b"not a directory").unwrap();

        let err = writer
            .write(refined(), "https://x.com/a.jpg", "x.com")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(!err.is_orphan());
        assert!(files_under(writer.scratch_dir()).is_empty());
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_link_never_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.part");
        let second = dir.path().join("second.part");
        let target = dir.path().join("img.jpg");
        std::fs::write(&first, b"first").unwrap();
        std::fs::write(&second, b"second").unwrap();

        assert!(link_no_clobber(&first, &target).await.unwrap());
        assert!(!link_no_clobber(&second, &target).await.unwrap());
        assert_eq!(std::fs::read(&target).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_concurrent_writes_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let writer = Arc::new(
            StorageWriter::open(&config(dir.path(), SaveFormat::Jpeg), store.clone())
                .await
                .unwrap(),
        );

        let tasks: Vec<_> = (0..24)
            .map(|i| {
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    writer
                        .write(refined(), &format!("https://x.com/{}.jpg", i), "x.com")
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await.unwrap().saved_path);
        }
        paths.sort();
        paths.dedup();

        assert_eq!(paths.len(), 24);
        assert_eq!(files_under(writer.root()).len(), 24);
        assert!(files_under(writer.scratch_dir()).is_empty());
        assert_eq!(store.records().len(), 24);
    }

    #[tokio::test]
    async fn test_folder_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = config(dir.path(), SaveFormat::Jpeg);
        std::fs::create_dir_all(&storage.root).unwrap();
        std::fs::write(storage.root.join("existing.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();
        storage.max_folder_size_mb = 2;

        let writer = StorageWriter::open(&storage, Arc::new(InMemoryMetadataStore::new()))
            .await
            .unwrap();
        assert_eq!(writer.total_bytes(), 2 * 1024 * 1024);
        assert!(writer.budget_exhausted());

        storage.max_folder_size_mb = 0;
        let unbounded = StorageWriter::open(&storage, Arc::new(InMemoryMetadataStore::new()))
            .await
            .unwrap();
        assert!(!unbounded.budget_exhausted());
    }
}
