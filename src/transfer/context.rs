//! The view of a transfer handed to protocol operations.
//!
//! [`TransferContext`] borrows the session's configuration, callbacks,
//! progress and buffers for one hop. Handlers move bytes through it so that
//! buffering, byte accounting, the low-speed guard and the progress callback
//! apply the same way for every protocol.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::SessionConfig;
use crate::protocol::ProtocolError;
use crate::target::Target;

use super::{HeaderBuffer, HopRequest, Progress, TransferBuffers, TransferHooks};

/// Per-hop transfer state borrowed from the session.
pub struct TransferContext<'a> {
    config: &'a SessionConfig,
    target: &'a Target,
    request: &'a HopRequest,
    hooks: &'a mut TransferHooks,
    progress: &'a mut Progress,
    buffers: &'a mut TransferBuffers,
    body: &'a mut Vec<u8>,
    delivered: u64,
}

impl<'a> TransferContext<'a> {
    pub(crate) fn new(
        config: &'a SessionConfig,
        target: &'a Target,
        request: &'a HopRequest,
        hooks: &'a mut TransferHooks,
        progress: &'a mut Progress,
        buffers: &'a mut TransferBuffers,
        body: &'a mut Vec<u8>,
    ) -> Self {
        buffers.header.reset();
        buffers.download.reset();
        Self {
            config,
            target,
            request,
            hooks,
            progress,
            buffers,
            body,
            delivered: 0,
        }
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &'a SessionConfig {
        self.config
    }

    /// Target of this hop.
    #[must_use]
    pub fn target(&self) -> &'a Target {
        self.target
    }

    /// Request shape of this hop.
    #[must_use]
    pub fn request(&self) -> &'a HopRequest {
        self.request
    }

    /// Live progress.
    #[must_use]
    pub fn progress(&self) -> &Progress {
        &*self.progress
    }

    /// Live progress, mutable.
    pub fn progress_mut(&mut self) -> &mut Progress {
        &mut *self.progress
    }

    /// Response header buffer.
    #[must_use]
    pub fn header_buffer(&self) -> &HeaderBuffer {
        &self.buffers.header
    }

    /// Response header buffer, mutable.
    pub fn header_buffer_mut(&mut self) -> &mut HeaderBuffer {
        &mut self.buffers.header
    }

    /// Payload bytes delivered during this hop.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Bytes delivered by the last [`pump_payload`](Self::pump_payload).
    #[must_use]
    pub fn last_payload(&self) -> &[u8] {
        self.buffers.download.filled()
    }

    /// Payload bytes still allowed by `max_download`; `None` when unlimited.
    #[must_use]
    pub fn download_allowance(&self) -> Option<u64> {
        self.config
            .max_download
            .map(|max| max.saturating_sub(self.delivered))
    }

    /// Delivers payload bytes to the write callback, or collects them.
    ///
    /// # Errors
    ///
    /// Fails when the write callback fails, the progress callback aborts or
    /// the low-speed guard trips.
    pub fn deliver(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.is_empty() {
            return Ok(());
        }
        self.progress.add_downloaded(data.len() as u64);
        self.delivered = self.delivered.saturating_add(data.len() as u64);
        write_sink(self.hooks, self.body, data)?;
        tick(self.config, self.hooks, self.progress)
    }

    /// Delivers as much of `data` as `max_download` still allows and
    /// returns how many bytes that was.
    ///
    /// # Errors
    ///
    /// Same as [`deliver`](Self::deliver).
    pub fn deliver_allowed(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        let take = self.download_allowance().map_or(data.len(), |allowed| {
            usize::try_from(allowed).map_or(data.len(), |allowed| allowed.min(data.len()))
        });
        self.deliver(&data[..take])?;
        Ok(take)
    }

    /// Delivers one response header block (or line) to the header callback,
    /// and to the payload sink as well when `include_header` is set.
    ///
    /// # Errors
    ///
    /// Fails when a callback fails.
    pub fn deliver_header(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if let Some(header) = self.hooks.header.as_mut() {
            header(data)?;
        }
        if self.config.include_header {
            write_sink(self.hooks, self.body, data)?;
        }
        Ok(())
    }

    /// Reads one chunk from `reader` into the download buffer and delivers it.
    ///
    /// Reads at most `limit` bytes and never more than the `max_download`
    /// allowance. Returns the number of bytes delivered; 0 means end of
    /// stream or an exhausted allowance.
    ///
    /// # Errors
    ///
    /// I/O errors, callback failures and the low-speed guard.
    pub async fn pump_payload<R>(
        &mut self,
        reader: &mut R,
        limit: Option<u64>,
    ) -> Result<usize, ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let allowance = match (limit, self.download_allowance()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let window = allowance.map_or(self.buffers.download_size(), |allowed| {
            usize::try_from(allowed).map_or(self.buffers.download_size(), |allowed| {
                allowed.min(self.buffers.download_size())
            })
        });
        if window == 0 {
            return Ok(0);
        }

        self.buffers.download.reset();
        let guard = low_speed_window(self.config);
        let read = {
            let spare = self.buffers.download.spare_mut(window);
            guarded_read(reader, spare, guard, self.config).await?
        };
        if read == 0 {
            return Ok(0);
        }
        self.buffers.download.advance(read);

        self.progress.add_downloaded(read as u64);
        self.delivered = self.delivered.saturating_add(read as u64);
        write_sink(self.hooks, self.body, self.buffers.download.filled())?;
        tick(self.config, self.hooks, self.progress)?;
        Ok(read)
    }

    /// Reads one chunk from `reader` and appends it to the header buffer.
    /// Returns the number of bytes read; 0 means end of stream.
    ///
    /// # Errors
    ///
    /// I/O errors, header buffer overflow and the low-speed guard.
    pub async fn read_header_chunk<R>(&mut self, reader: &mut R) -> Result<usize, ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.buffers.download.reset();
        let window = self.buffers.download_size();
        let guard = low_speed_window(self.config);
        let read = {
            let spare = self.buffers.download.spare_mut(window);
            guarded_read(reader, spare, guard, self.config).await?
        };
        self.buffers.download.advance(read);
        self.buffers.header.append(self.buffers.download.filled())?;
        Ok(read)
    }

    /// Sends one chunk of upload data from the read callback to `writer`.
    ///
    /// The chunk size follows the adaptive upload window and never exceeds
    /// `limit`. Returns the bytes sent; 0 means the source is exhausted.
    ///
    /// # Errors
    ///
    /// Read callback and socket errors, progress abort, low-speed guard.
    pub async fn pump_upload<W>(
        &mut self,
        writer: &mut W,
        limit: Option<u64>,
    ) -> Result<usize, ProtocolError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let window = self.buffers.upload_window();
        let window = limit.map_or(window, |limit| {
            usize::try_from(limit).map_or(window, |limit| limit.min(window))
        });
        if window == 0 {
            return Ok(0);
        }
        let Some(read_fn) = self.hooks.read.as_mut() else {
            return Ok(0);
        };

        self.buffers.upload.reset();
        let spare = self.buffers.upload.spare_mut(window);
        let read = checked_read(read_fn(spare)?, spare.len())?;
        if read == 0 {
            return Ok(0);
        }
        self.buffers.upload.advance(read);
        writer.write_all(self.buffers.upload.filled()).await?;

        self.progress.add_uploaded(read as u64);
        let speed = self.progress.upload_speed();
        self.buffers.adapt_upload(speed);
        tick(self.config, self.hooks, self.progress)?;
        Ok(read)
    }

    /// Drains the read callback into memory. Used when a protocol needs the
    /// upload size before sending.
    ///
    /// # Errors
    ///
    /// Read callback errors.
    pub fn read_upload_to_end(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::new();
        let Some(read_fn) = self.hooks.read.as_mut() else {
            return Ok(data);
        };
        let chunk = self.buffers.download_size();
        loop {
            self.buffers.upload.reset();
            let spare = self.buffers.upload.spare_mut(chunk);
            let read = checked_read(read_fn(spare)?, spare.len())?;
            if read == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&spare[..read]);
        }
    }

    /// Records bytes a handler sent on its own (request bodies it built).
    ///
    /// # Errors
    ///
    /// Progress abort and low-speed guard.
    pub fn record_upload(&mut self, bytes: u64) -> Result<(), ProtocolError> {
        self.progress.add_uploaded(bytes);
        tick(self.config, self.hooks, self.progress)
    }

    /// Asks the password callback for `user`'s password.
    pub fn prompt_password(&mut self, user: &str) -> Option<String> {
        prompt_password(self.hooks, user)
    }
}

/// Rejects a read callback claiming more bytes than the buffer it was given.
fn checked_read(read: usize, offered: usize) -> Result<usize, ProtocolError> {
    if read > offered {
        return Err(ProtocolError::malformed(format!(
            "read callback returned {read} bytes for a {offered}-byte buffer"
        )));
    }
    Ok(read)
}

pub(crate) fn prompt_password(hooks: &mut TransferHooks, user: &str) -> Option<String> {
    hooks.password.as_mut().and_then(|prompt| prompt(user))
}

fn write_sink(
    hooks: &mut TransferHooks,
    body: &mut Vec<u8>,
    data: &[u8],
) -> Result<(), ProtocolError> {
    match hooks.write.as_mut() {
        Some(write) => write(data)?,
        None => body.extend_from_slice(data),
    }
    Ok(())
}

/// Samples speed, applies the low-speed guard and calls the progress
/// callback (on first call and once per sample interval after that).
pub(crate) fn tick(
    config: &SessionConfig,
    hooks: &mut TransferHooks,
    progress: &mut Progress,
) -> Result<(), ProtocolError> {
    let sampled = progress.sample();
    if sampled
        && let Some(limit) = config.low_speed_limit
    {
        progress.check_low_speed(limit, Duration::from_secs(config.low_speed_time_secs))?;
    }
    if sampled || !progress.callback_invoked() {
        notify_progress(hooks, progress)?;
    }
    Ok(())
}

/// Calls the progress callback unconditionally.
pub(crate) fn notify_progress(
    hooks: &mut TransferHooks,
    progress: &mut Progress,
) -> Result<(), ProtocolError> {
    if let Some(callback) = hooks.progress.as_mut() {
        progress.note_callback();
        if !callback(&progress.snapshot()) {
            return Err(ProtocolError::Aborted);
        }
    }
    Ok(())
}

fn low_speed_window(config: &SessionConfig) -> Option<Duration> {
    config
        .low_speed_limit
        .filter(|limit| *limit > 0)
        .map(|_| Duration::from_secs(config.low_speed_time_secs.max(1)))
}

/// A read that delivers nothing for the whole low-speed window means the
/// speed stayed at zero for that long.
async fn guarded_read<R>(
    reader: &mut R,
    buf: &mut [u8],
    guard: Option<Duration>,
    config: &SessionConfig,
) -> Result<usize, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
{
    match guard {
        Some(window) => match tokio::time::timeout(window, reader.read(buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(ProtocolError::TooSlow {
                limit: config.low_speed_limit.unwrap_or_default(),
                window,
            }),
        },
        None => Ok(reader.read(buf).await?),
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::bench::TestBench;
    use super::*;

    #[tokio::test]
    async fn test_pump_payload_collects_without_write_hook() {
        let mut bench = TestBench::new(SessionConfig::default(), "http://host/");
        let mut reader = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .build();
        let mut ctx = bench.ctx();
        assert_eq!(ctx.pump_payload(&mut reader, None).await.unwrap(), 6);
        assert_eq!(ctx.pump_payload(&mut reader, None).await.unwrap(), 5);
        assert_eq!(ctx.pump_payload(&mut reader, None).await.unwrap(), 0);
        assert_eq!(ctx.delivered(), 11);
        drop(ctx);
        assert_eq!(bench.body, b"hello world");
        assert_eq!(bench.progress.downloaded(), 11);
    }

    #[tokio::test]
    async fn test_pump_payload_respects_max_download() {
        let config = SessionConfig {
            max_download: Some(4),
            ..SessionConfig::default()
        };
        let mut bench = TestBench::new(config, "http://host/");
        let mut reader = tokio_test::io::Builder::new().read(b"abcd").build();
        let mut ctx = bench.ctx();
        assert_eq!(ctx.pump_payload(&mut reader, None).await.unwrap(), 4);
        assert_eq!(ctx.download_allowance(), Some(0));
        assert_eq!(ctx.pump_payload(&mut reader, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_hook_receives_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut bench = TestBench::new(SessionConfig::default(), "http://host/");
        bench.hooks.set_write(move |data| {
            sink.lock().unwrap().extend_from_slice(data);
            Ok(())
        });
        bench.ctx().deliver(b"payload").unwrap();
        assert_eq!(*seen.lock().unwrap(), b"payload");
        assert!(bench.body.is_empty());
    }

    #[test]
    fn test_progress_callback_abort() {
        let mut bench = TestBench::new(SessionConfig::default(), "http://host/");
        bench.hooks.set_progress(|_| false);
        let error = bench.ctx().deliver(b"x").unwrap_err();
        assert!(matches!(error, ProtocolError::Aborted));
        assert!(bench.progress.callback_invoked());
    }

    #[test]
    fn test_include_header_writes_headers_into_body() {
        let config = SessionConfig {
            include_header: true,
            ..SessionConfig::default()
        };
        let mut bench = TestBench::new(config, "http://host/");
        bench.ctx().deliver_header(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert_eq!(bench.body, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(bench.progress.downloaded(), 0);
    }

    #[tokio::test]
    async fn test_pump_upload_uses_read_hook() {
        let mut bench = TestBench::new(SessionConfig::default(), "ftp://host/up");
        bench.hooks.set_read_bytes(b"upload-data".to_vec());
        let mut writer = tokio_test::io::Builder::new().write(b"upload-data").build();
        let mut ctx = bench.ctx();
        assert_eq!(ctx.pump_upload(&mut writer, None).await.unwrap(), 11);
        assert_eq!(ctx.pump_upload(&mut writer, None).await.unwrap(), 0);
        drop(ctx);
        assert_eq!(bench.progress.uploaded(), 11);
    }

    #[test]
    fn test_read_upload_to_end() {
        let mut bench = TestBench::new(SessionConfig::default(), "http://host/");
        bench.hooks.set_read_bytes(vec![7u8; 70_000]);
        let data = bench.ctx().read_upload_to_end().unwrap();
        assert_eq!(data.len(), 70_000);
    }

    #[tokio::test]
    async fn test_read_hook_overreporting_is_rejected() {
        let mut bench = TestBench::new(SessionConfig::default(), "ftp://host/up");
        bench.hooks.set_read(|buf| Ok(buf.len() + 1));
        let mut writer = tokio_test::io::Builder::new().build();
        let mut ctx = bench.ctx();
        let error = ctx.pump_upload(&mut writer, None).await.unwrap_err();
        assert!(matches!(error, ProtocolError::Malformed(_)), "{error:?}");
        let error = ctx.read_upload_to_end().unwrap_err();
        assert!(matches!(error, ProtocolError::Malformed(_)), "{error:?}");
        drop(ctx);
        assert_eq!(bench.progress.uploaded(), 0);
    }

    #[tokio::test]
    async fn test_read_header_chunk_appends() {
        let mut bench = TestBench::new(SessionConfig::default(), "http://host/");
        let mut reader = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 200 OK\r\n")
            .read(b"\r\nbody")
            .build();
        let mut ctx = bench.ctx();
        ctx.read_header_chunk(&mut reader).await.unwrap();
        assert_eq!(ctx.header_buffer_mut().header_end(), None);
        ctx.read_header_chunk(&mut reader).await.unwrap();
        assert_eq!(ctx.header_buffer_mut().header_end(), Some(19));
    }

    #[test]
    fn test_prompt_password() {
        let mut bench = TestBench::new(SessionConfig::default(), "ftp://host/");
        assert_eq!(bench.ctx().prompt_password("alice"), None);
        bench
            .hooks
            .set_password(|user| Some(format!("{user}-secret")));
        assert_eq!(
            bench.ctx().prompt_password("alice").as_deref(),
            Some("alice-secret")
        );
    }
}
