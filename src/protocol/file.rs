//! Local file access through the same operation set.
//!
//! No socket is involved: `connect` opens the file, `perform` streams it
//! through the transfer context and `done` closes it. File records are
//! never pooled.

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use super::{DoOutcome, ProtocolError, ProtocolHandler};
use crate::connection::Connection;
use crate::transfer::TransferContext;

/// Open local file of a FILE connection.
#[derive(Debug, Default)]
pub struct FileState {
    file: Option<File>,
    path: Option<PathBuf>,
    size: Option<u64>,
}

impl FileState {
    /// Path of the open file.
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Size of the file when it was opened for reading.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// True while the file is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

/// Handler for `file`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileHandler;

#[async_trait]
impl ProtocolHandler for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip_all, fields(path = %ctx.target().path()))]
    async fn connect(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        conn.bits.close = true;
        let path = ctx
            .target()
            .url()
            .to_file_path()
            .map_err(|()| ProtocolError::unsupported("URL does not name a local path"))?;

        let (file, size) = if ctx.request().upload {
            let mut options = OpenOptions::new();
            options.write(true).create(true);
            if ctx.request().resume_from.is_some_and(|offset| offset > 0) {
                options.append(true);
            } else {
                options.truncate(true);
            }
            (options.open(&path).await?, None)
        } else {
            let file = File::open(&path).await?;
            let size = file.metadata().await?.len();
            (file, Some(size))
        };
        debug!(path = %path.display(), size = ?size, "Opened local file");

        let state = conn.file_state_mut()?;
        state.file = Some(file);
        state.path = Some(path);
        state.size = size;
        Ok(())
    }

    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let state = conn.file_state_mut()?;
        let size = state.size;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| ProtocolError::unsupported("file is not open"))?;

        if ctx.request().upload {
            let announced = ctx.config().upload_size;
            ctx.progress_mut().set_expected_upload(announced);
            while ctx.pump_upload(file, None).await? > 0 {}
            file.flush().await?;
            return Ok(DoOutcome::default());
        }

        let (start, limit) = match ctx.request().range.as_deref() {
            Some(range) => parse_range(range)
                .ok_or_else(|| ProtocolError::unsupported(format!("bad range '{range}'")))?,
            None => (ctx.request().resume_from.unwrap_or(0), None),
        };
        let available = size.map(|size| size.saturating_sub(start));
        let expected = match (available, limit) {
            (Some(available), Some(limit)) => Some(available.min(limit)),
            (available, limit) => available.or(limit),
        };
        ctx.progress_mut().set_expected_download(expected);
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        let mut remaining = limit;
        loop {
            let read = ctx.pump_payload(file, remaining).await?;
            if read == 0 {
                break;
            }
            if let Some(left) = remaining.as_mut() {
                *left -= read as u64;
            }
        }

        let filetime = if ctx.config().get_filetime {
            file.metadata().await?.modified().ok()
        } else {
            None
        };
        Ok(DoOutcome {
            response_code: None,
            location: None,
            filetime,
        })
    }

    async fn done(
        &self,
        conn: &mut Connection,
        _ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        if let Some(mut file) = conn.file_state_mut()?.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Parses `first-last` or `first-` into a start offset and a byte count.
fn parse_range(range: &str) -> Option<(u64, Option<u64>)> {
    let (first, last) = range.trim().split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    let last = last.trim();
    if last.is_empty() {
        return Some((first, None));
    }
    let last: u64 = last.parse().ok()?;
    (last >= first).then(|| (first, Some(last - first + 1)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SessionConfig;
    use crate::connection::tests::key_for;
    use crate::connection::ConnectionIndex;
    use crate::target::Target;
    use crate::transfer::bench::TestBench;

    fn file_connection() -> Connection {
        Connection::new(
            ConnectionIndex::new(0),
            key_for("file:///tmp/x"),
            Arc::new(FileHandler),
            None,
            None,
        )
    }

    fn file_url(path: &std::path::Path) -> String {
        url::Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("10-19"), Some((10, Some(10))));
        assert_eq!(parse_range("5-"), Some((5, None)));
        assert_eq!(parse_range("9-3"), None);
        assert_eq!(parse_range("abc"), None);
    }

    #[tokio::test]
    async fn test_read_range_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"0123456789").unwrap();

        let config = SessionConfig {
            range: Some("2-5".to_string()),
            ..SessionConfig::default()
        };
        let mut bench = TestBench::new(config, &file_url(&path));
        let mut conn = file_connection();
        let handler = FileHandler;
        {
            let mut ctx = bench.ctx();
            handler.connect(&mut conn, &mut ctx).await.unwrap();
            handler.perform(&mut conn, &mut ctx).await.unwrap();
            handler.done(&mut conn, &mut ctx).await.unwrap();
        }
        assert_eq!(bench.body, b"2345");
        assert!(conn.bits.close);
        assert!(!conn.file_state_mut().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_upload_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let config = SessionConfig {
            upload: true,
            ..SessionConfig::default()
        };
        let mut bench = TestBench::new(config, &file_url(&path));
        bench.hooks.set_read_bytes(b"written through netxfer".to_vec());
        let mut conn = file_connection();
        {
            let mut ctx = bench.ctx();
            FileHandler.connect(&mut conn, &mut ctx).await.unwrap();
            FileHandler.perform(&mut conn, &mut ctx).await.unwrap();
            FileHandler.done(&mut conn, &mut ctx).await.unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"written through netxfer");
        assert_eq!(bench.progress.uploaded(), 23);
    }

    #[tokio::test]
    async fn test_missing_file_fails_connect_with_io() {
        let dir = tempfile::tempdir().unwrap();
        let url = file_url(&dir.path().join("absent"));
        let mut bench = TestBench::new(SessionConfig::default(), &url);
        let mut conn = file_connection();
        let mut ctx = bench.ctx();
        let error = FileHandler.connect(&mut conn, &mut ctx).await.unwrap_err();
        assert!(error.is_io());
        assert!(Target::parse(&url, None).is_ok());
    }
}
