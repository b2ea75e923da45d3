use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

/// Extensions picked up by [`FsDocumentSource`]
pub const DEFAULT_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// Document content together with its modification time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub mtime: i64,
}

/// Collection of documents addressed by relative, `/`-separated paths
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Every indexable path, sorted
    async fn list_files(&self) -> io::Result<Vec<String>>;

    async fn read(&self, path: &str) -> io::Result<SourceDocument>;
}

/// Documents stored under a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FsDocumentSource {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect(),
        }
    }

    fn is_indexable(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
    }

    fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    #[inline]
    async fn list_files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                // Hidden files and folders (.git, .obsidian, ...)
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }

                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if !file_type.is_symlink() && self.is_indexable(&path) {
                    match self.relative_path(&path) {
                        Some(relative) => files.push(relative),
                        None => debug!("Skipping non UTF-8 path {}", path.display()),
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }

    #[inline]
    async fn read(&self, path: &str) -> io::Result<SourceDocument> {
        let full_path = self.root.join(path);
        let content = fs::read_to_string(&full_path).await?;
        let modified = fs::metadata(&full_path).await?.modified()?;
        let mtime = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);

        Ok(SourceDocument { content, mtime })
    }
}
