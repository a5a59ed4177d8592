//! Narrow file-access capability for collectors that read `/proc`-style files.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Files under /proc are tiny; anything bigger is not what we expect.
const MAX_FILE_SIZE: u64 = 64 * 1024;

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait FileSource: Send + Sync {
    async fn open(&self, path: &Path) -> std::io::Result<FileReader>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFiles;

#[async_trait]
impl FileSource for OsFiles {
    async fn open(&self, path: &Path) -> std::io::Result<FileReader> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }
}

/// Serves fixed buffers keyed by path.
#[derive(Debug, Default, Clone)]
pub struct StaticFiles {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl StaticFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }
}

#[async_trait]
impl FileSource for StaticFiles {
    async fn open(&self, path: &Path) -> std::io::Result<FileReader> {
        match self.files.get(path) {
            Some(contents) => Ok(Box::new(Cursor::new(contents.clone()))),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }
}

pub async fn read_to_string(source: &dyn FileSource, path: &Path) -> std::io::Result<String> {
    let reader = source.open(path).await?;
    let mut contents = String::new();
    reader.take(MAX_FILE_SIZE).read_to_string(&mut contents).await?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_files_serve_contents() {
        let files = StaticFiles::new().with_file("/proc/uptime", "350735.47 234388.90\n");
        let text = read_to_string(&files, Path::new("/proc/uptime")).await.unwrap();
        assert_eq!(text, "350735.47 234388.90\n");
    }

    #[tokio::test]
    async fn test_static_files_missing_path() {
        let err = read_to_string(&StaticFiles::new(), Path::new("/proc/loadavg"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
