// Temp-file handles for atomic blob placement
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A temp file object bytes are streamed into before a commit publishes it.
///
/// The file lives in the disk's temp area, on the same filesystem as every
/// partition directory, so publishing is a rename. A handle that is dropped
/// or abandoned before being saved removes its temp file; once saved, the
/// handle owns nothing and abandoning it does nothing.
#[derive(Debug)]
pub struct WriteHandle {
    file: Option<File>,
    path: Option<TempPath>,
    size_hint: Option<u64>,
    bytes_written: u64,
}

impl WriteHandle {
    pub(crate) async fn create(temp_dir: &Path, size_hint: Option<u64>) -> io::Result<Self> {
        let temp_dir = temp_dir.to_path_buf();
        let (file, path) = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(".write-")
                .tempfile_in(temp_dir)
                .map(|temp| temp.into_parts())
        })
        .await
        .map_err(join_error)??;

        Ok(Self {
            file: Some(File::from_std(file)),
            path: Some(path),
            size_hint,
            bytes_written: 0,
        })
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(released)?;
        file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// Location of the temp file, until the handle is saved or abandoned.
    pub fn temp_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Drop the temp file. Safe to call at any point, any number of times.
    pub fn abandon(&mut self) {
        self.file = None;
        self.path = None;
    }

    /// Flush, fsync and rename the temp file to `dest`.
    pub(crate) async fn save(&mut self, dest: &Path) -> io::Result<()> {
        let mut file = self.file.take().ok_or_else(released)?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let path = self.path.take().ok_or_else(released)?;
        let dest = dest.to_path_buf();
        // On failure the returned TempPath is dropped, which removes the file.
        tokio::task::spawn_blocking(move || path.persist(dest).map_err(|e| e.error))
            .await
            .map_err(join_error)?
    }
}

impl AsyncWrite for WriteHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(released()));
        };
        let poll = Pin::new(file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.bytes_written += *n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Err(released())),
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "write handle already saved or abandoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    #[tokio::test]
    async fn test_save_moves_file() {
        let temp = TempDir::new().unwrap();
        let mut handle = WriteHandle::create(temp.path(), Some(10)).await.unwrap();
        let temp_path = handle.temp_path().unwrap().to_path_buf();
        assert!(temp_path.exists());

        handle.write_all(b"hello ").await.unwrap();
        handle.write_all(b"world").await.unwrap();
        assert_eq!(handle.bytes_written(), 11);
        assert_eq!(handle.size_hint(), Some(10));

        let dest = temp.path().join("final");
        handle.save(&dest).await.unwrap();

        assert!(!temp_path.exists());
        assert_eq!(fs::read(&dest).await.unwrap(), b"hello world");
        assert!(handle.temp_path().is_none());

        // Abandoning a saved handle is a no-op
        handle.abandon();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_abandon_after_partial_write() {
        let temp = TempDir::new().unwrap();
        let mut handle = WriteHandle::create(temp.path(), None).await.unwrap();
        handle.write_all(b"partial").await.unwrap();
        let temp_path = handle.temp_path().unwrap().to_path_buf();

        handle.abandon();
        handle.abandon();
        assert!(!temp_path.exists());
        assert!(handle.write_all(b"more").await.is_err());
        assert!(handle.save(&temp.path().join("x")).await.is_err());
        assert!(!temp.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_drop_removes_temp_file() {
        let temp = TempDir::new().unwrap();
        let temp_path = {
            let mut handle = WriteHandle::create(temp.path(), None).await.unwrap();
            handle.write_all(b"never committed").await.unwrap();
            handle.temp_path().unwrap().to_path_buf()
        };
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_async_write_counts_bytes() {
        let temp = TempDir::new().unwrap();
        let mut handle = WriteHandle::create(temp.path(), None).await.unwrap();
        let mut data: &[u8] = b"streamed through AsyncWrite";
        tokio::io::copy(&mut data, &mut handle).await.unwrap();
        handle.flush().await.unwrap();
        assert_eq!(handle.bytes_written(), 27);
    }

    #[tokio::test]
    async fn test_failed_save_releases_temp_file() {
        let temp = TempDir::new().unwrap();
        let mut handle = WriteHandle::create(temp.path(), None).await.unwrap();
        handle.write_all(b"data").await.unwrap();
        let temp_path = handle.temp_path().unwrap().to_path_buf();

        let dest = temp.path().join("missing-dir").join("final");
        assert!(handle.save(&dest).await.is_err());
        assert!(!temp_path.exists());
        assert!(!dest.exists());
    }
}
