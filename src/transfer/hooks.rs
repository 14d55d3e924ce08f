//! Caller callbacks attached to a session.

use std::fmt;
use std::io;

use super::ProgressSnapshot;

/// Receives payload or header bytes.
pub type WriteFn = Box<dyn FnMut(&[u8]) -> io::Result<()> + Send>;
/// Supplies upload bytes; returning 0 ends the upload.
pub type ReadFn = Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>;
/// Observes progress; returning `false` aborts the transfer.
pub type ProgressFn = Box<dyn FnMut(&ProgressSnapshot) -> bool + Send>;
/// Supplies a password for the given user name.
pub type PasswordFn = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// I/O, progress and password callbacks.
///
/// Without a write callback the payload is collected into the transfer
/// outcome. Without a read callback uploads are empty.
#[derive(Default)]
pub struct TransferHooks {
    pub(crate) write: Option<WriteFn>,
    pub(crate) header: Option<WriteFn>,
    pub(crate) read: Option<ReadFn>,
    pub(crate) progress: Option<ProgressFn>,
    pub(crate) password: Option<PasswordFn>,
}

impl TransferHooks {
    /// Creates an empty set of hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the payload sink.
    pub fn set_write<F>(&mut self, f: F)
    where
        F: FnMut(&[u8]) -> io::Result<()> + Send + 'static,
    {
        self.write = Some(Box::new(f));
    }

    /// Sets the response header sink.
    pub fn set_header<F>(&mut self, f: F)
    where
        F: FnMut(&[u8]) -> io::Result<()> + Send + 'static,
    {
        self.header = Some(Box::new(f));
    }

    /// Sets the upload source.
    pub fn set_read<F>(&mut self, f: F)
    where
        F: FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
    {
        self.read = Some(Box::new(f));
    }

    /// Uploads the given bytes.
    pub fn set_read_bytes(&mut self, data: impl Into<Vec<u8>>) {
        let mut cursor = io::Cursor::new(data.into());
        self.set_read(move |buf| io::Read::read(&mut cursor, buf));
    }

    /// Sets the progress observer.
    pub fn set_progress<F>(&mut self, f: F)
    where
        F: FnMut(&ProgressSnapshot) -> bool + Send + 'static,
    {
        self.progress = Some(Box::new(f));
    }

    /// Sets the password prompt.
    pub fn set_password<F>(&mut self, f: F)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        self.password = Some(Box::new(f));
    }

    /// Removes every callback.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True when a payload sink is installed.
    #[must_use]
    pub fn has_write(&self) -> bool {
        self.write.is_some()
    }
}

impl fmt::Debug for TransferHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHooks")
            .field("write", &self.write.is_some())
            .field("header", &self.header.is_some())
            .field("read", &self.read.is_some())
            .field("progress", &self.progress.is_some())
            .field("password", &self.password.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bytes_drains_then_eof() {
        let mut hooks = TransferHooks::new();
        hooks.set_read_bytes(b"hello".to_vec());
        let read = hooks.read.as_mut().unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(read(&mut buf).unwrap(), 2);
        assert_eq!(read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_debug_lists_installed_hooks() {
        let mut hooks = TransferHooks::new();
        hooks.set_progress(|_| true);
        let rendered = format!("{hooks:?}");
        assert!(rendered.contains("progress: true"), "got: {rendered}");
        assert!(rendered.contains("write: false"), "got: {rendered}");
        hooks.clear();
        assert!(!hooks.has_write());
    }
}
