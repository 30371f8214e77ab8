//! Source Loaders
//!
//! Reads script bundles from disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use conduit_bridge::{LifecycleError, LoadProgress, ProgressFn, Source, SourceLoader};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

pub use conduit_bridge::StaticSourceLoader;

const CHUNK_SIZE: usize = 64 * 1024;

/// Loads bundles from a directory. Urls are resolved relative to it, and
/// absolute paths are used as they are.
pub struct FileSourceLoader {
    root: PathBuf,
}

impl FileSourceLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl SourceLoader for FileSourceLoader {
    async fn load(&self, url: &str, progress: ProgressFn) -> Result<Source, LifecycleError> {
        let path = self.resolve(url);
        let failed = |e: std::io::Error| LifecycleError::SourceLoad(format!("{}: {}", path.display(), e));

        let mut file = File::open(&path).await.map_err(failed)?;
        let total = file
            .metadata()
            .await
            .ok()
            .and_then(|m| usize::try_from(m.len()).ok());

        let mut bytes = Vec::with_capacity(total.unwrap_or(0));
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut chunk).await.map_err(failed)?;
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
            progress(LoadProgress {
                done: bytes.len(),
                total,
            });
        }

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Bundle read");
        Ok(Source::new(url, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_loads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("main.js"), "var ready = true;")
            .await
            .unwrap();

        let reported = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reported);
        let loader = FileSourceLoader::new(dir.path());
        let source = loader
            .load(
                "main.js",
                Arc::new(move |p: LoadProgress| seen.store(p.done, Ordering::SeqCst)),
            )
            .await
            .unwrap();

        assert_eq!(source.url, "main.js");
        assert_eq!(source.text().unwrap(), "var ready = true;");
        assert_eq!(reported.load(Ordering::SeqCst), 17);
    }

    #[tokio::test]
    async fn test_file_url_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.js");
        tokio::fs::write(&path, "1").await.unwrap();

        let loader = FileSourceLoader::new("/nonexistent");
        let url = format!("file://{}", path.display());
        assert!(loader.load(&url, Arc::new(|_: LoadProgress| {})).await.is_ok());

        let error = loader.load("missing.js", Arc::new(|_: LoadProgress| {})).await.unwrap_err();
        assert!(matches!(error, LifecycleError::SourceLoad(message) if message.contains("missing.js")));
    }
}
