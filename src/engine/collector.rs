// * Page Collector seam
// * The pipeline pulls (url, referer) pairs lazily from a collector; how they are discovered is not its concern

use futures::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

// * One image URL to fetch, with the page it was found on when known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub url: String,
    pub referer: Option<String>,
}

impl ImageCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: None,
        }
    }

    pub fn with_referer(url: impl Into<String>, referer: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: Some(referer.into()),
        }
    }

    // * Parses a "url [referer]" line; blank lines and '#' comments yield None
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut parts = line.split_whitespace();
        let url = parts.next()?.to_string();
        let referer = parts.next().map(str::to_string);
        Some(Self { url, referer })
    }
}

// * An asynchronous, restartable, finite source of candidates.
// * Each call starts a fresh pass; the stream ending is the "no more items" signal.
pub trait PageCollector: Send + Sync {
    fn candidates(&self) -> BoxStream<'static, ImageCandidate>;
}

// * Fixed in-memory list (tests, programmatic callers)
#[derive(Debug, Clone, Default)]
pub struct StaticCollector {
    items: Vec<ImageCandidate>,
}

impl StaticCollector {
    pub fn new(items: Vec<ImageCandidate>) -> Self {
        Self { items }
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(urls.into_iter().map(ImageCandidate::new).collect())
    }
}

impl PageCollector for StaticCollector {
    fn candidates(&self) -> BoxStream<'static, ImageCandidate> {
        stream::iter(self.items.clone()).boxed()
    }
}

// * Streams candidates from a text file, one "url [referer]" per line, read lazily
#[derive(Debug, Clone)]
pub struct LineFileCollector {
    path: PathBuf,
}

impl LineFileCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PageCollector for LineFileCollector {
    fn candidates(&self) -> BoxStream<'static, ImageCandidate> {
        let path = self.path.clone();
        stream::once(async move {
            match File::open(&path).await {
                Ok(file) => Some(BufReader::new(file).lines()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to open candidate file");
                    None
                }
            }
        })
        .flat_map(|lines| match lines {
            Some(lines) => stream::unfold(lines, |mut lines| async move {
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if let Some(candidate) = ImageCandidate::parse_line(&line) {
                                return Some((candidate, lines));
                            }
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            warn!(error = %e, "Candidate file read failed, ending stream");
                            return None;
                        }
                    }
                }
            })
            .boxed(),
            None => stream::empty().boxed(),
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            ImageCandidate::parse_line("  https://x.com/a.jpg  https://x.com/page "),
            Some(ImageCandidate::with_referer("https://x.com/a.jpg", "https://x.com/page"))
        );
        assert_eq!(
            ImageCandidate::parse_line("https://x.com/b.jpg"),
            Some(ImageCandidate::new("https://x.com/b.jpg"))
        );
        assert_eq!(ImageCandidate::parse_line("   "), None);
        assert_eq!(ImageCandidate::parse_line("# comment"), None);
    }

    #[tokio::test]
    async fn test_static_collector_is_restartable() {
        let collector = StaticCollector::from_urls(["https://a.com/1.jpg", "https://a.com/2.jpg"]);
        let first: Vec<_> = collector.candidates().collect().await;
        let second: Vec<_> = collector.candidates().collect().await;
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_line_file_collector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "https://a.com/1.jpg https://a.com/gallery").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "# skipped").unwrap();
        writeln!(file, "https://b.com/2.png").unwrap();
        file.flush().unwrap();

        let collector = LineFileCollector::new(file.path());
        let items: Vec<_> = collector.candidates().collect().await;
        assert_eq!(
            items,
            vec![
                ImageCandidate::with_referer("https://a.com/1.jpg", "https://a.com/gallery"),
                ImageCandidate::new("https://b.com/2.png"),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_stream() {
        let collector = LineFileCollector::new("/definitely/not/here.txt");
        assert_eq!(collector.candidates().count().await, 0);
    }
}
