//! Growable header buffer and fixed-capacity payload buffers.
//!
//! The header buffer starts small and grows on demand, doubling (or growing
//! exactly to the needed size when that is larger than double) so already
//! buffered bytes are never lost. It does not shrink while a transfer runs;
//! [`HeaderBuffer::reset`] only forgets the contents.
//!
//! Payload buffers are fixed-size scratch areas for socket reads. The upload
//! buffer is allocated at download size but only a window of it is used; the
//! window adapts to the measured upload speed.

use thiserror::Error;
use tracing::trace;

use crate::config::BufferHints;

/// A single incoming chunk was larger than the buffer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("chunk of {requested} bytes exceeds hard cap of {hard_cap} bytes")]
pub struct BufferOverflow {
    /// Size of the rejected chunk.
    pub requested: usize,
    /// The cap it exceeded.
    pub hard_cap: usize,
}

/// Growable buffer for response headers.
#[derive(Debug, Clone)]
pub struct HeaderBuffer {
    data: Vec<u8>,
    capacity: usize,
    hard_cap: usize,
    scanned: usize,
}

impl HeaderBuffer {
    /// Creates a header buffer with an initial capacity and a per-chunk hard cap.
    #[must_use]
    pub fn new(initial: usize, hard_cap: usize) -> Self {
        let capacity = initial.max(1);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            hard_cap,
            scanned: 0,
        }
    }

    /// Appends a chunk, growing the buffer if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BufferOverflow`] if the chunk alone is larger than the hard cap.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), BufferOverflow> {
        if chunk.len() > self.hard_cap {
            return Err(BufferOverflow {
                requested: chunk.len(),
                hard_cap: self.hard_cap,
            });
        }

        let needed = self.data.len() + chunk.len();
        if needed > self.capacity {
            let doubled = self.capacity.saturating_mul(2);
            let grown = if needed > doubled { needed } else { doubled };
            trace!(from = self.capacity, to = grown, "growing header buffer");
            self.data.reserve_exact(grown - self.data.len());
            self.capacity = grown;
        }

        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Forgets the buffered bytes. Capacity is kept.
    pub fn reset(&mut self) {
        self.data.clear();
        self.scanned = 0;
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.data.len()
    }

    /// Current logical capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Per-chunk hard cap.
    #[must_use]
    pub fn hard_cap(&self) -> usize {
        self.hard_cap
    }

    /// Buffered bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Fails with [`BufferOverflow`] when an unterminated header block has
    /// grown past the hard cap.
    ///
    /// # Errors
    ///
    /// Returns [`BufferOverflow`] carrying the buffered size.
    pub fn check_unterminated(&self) -> Result<(), BufferOverflow> {
        if self.data.len() > self.hard_cap {
            return Err(BufferOverflow {
                requested: self.data.len(),
                hard_cap: self.hard_cap,
            });
        }
        Ok(())
    }

    /// Offset just past the blank line that ends a header block, if present.
    ///
    /// Accepts both CRLF and bare LF line endings. Scanning resumes where the
    /// previous call stopped.
    pub fn header_end(&mut self) -> Option<usize> {
        let data = &self.data;
        let start = self.scanned.min(data.len());
        let found = (start..data.len()).find_map(|i| {
            if data[i..].starts_with(b"\r\n\r\n") {
                Some(i + 4)
            } else if data[i..].starts_with(b"\n\n") {
                Some(i + 2)
            } else {
                None
            }
        });
        // A terminator may straddle the next append.
        self.scanned = if found.is_some() { 0 } else { data.len().saturating_sub(3) };
        found
    }

    /// Removes and returns everything after `offset`, leaving the head buffered.
    pub fn split_tail(&mut self, offset: usize) -> Vec<u8> {
        self.scanned = 0;
        if offset >= self.data.len() {
            return Vec::new();
        }
        self.data.split_off(offset)
    }
}

/// Fixed-capacity buffer used as socket read scratch space.
#[derive(Debug, Clone)]
pub struct PayloadBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl PayloadBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Total capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Appends a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`BufferOverflow`] if the chunk does not fit in the remaining space.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), BufferOverflow> {
        let remaining = self.data.len() - self.filled;
        if chunk.len() > remaining {
            return Err(BufferOverflow {
                requested: chunk.len(),
                hard_cap: remaining,
            });
        }
        self.data[self.filled..self.filled + chunk.len()].copy_from_slice(chunk);
        self.filled += chunk.len();
        Ok(())
    }

    /// Unfilled tail, limited to `window` bytes of total capacity.
    pub fn spare_mut(&mut self, window: usize) -> &mut [u8] {
        let end = window.clamp(self.filled, self.data.len());
        &mut self.data[self.filled..end]
    }

    /// Marks `n` more bytes as filled after a read into [`spare_mut`](Self::spare_mut).
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Filled bytes.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Number of filled bytes.
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.filled
    }

    /// Empties the buffer.
    pub fn reset(&mut self) {
        self.filled = 0;
    }
}

/// The buffers owned by one session for the transfer in progress.
#[derive(Debug, Clone)]
pub struct TransferBuffers {
    pub(crate) header: HeaderBuffer,
    pub(crate) download: PayloadBuffer,
    pub(crate) upload: PayloadBuffer,
    upload_window: usize,
    upload_min: usize,
}

impl TransferBuffers {
    /// Allocates buffers sized from the session hints.
    #[must_use]
    pub fn new(hints: &BufferHints) -> Self {
        let download_size = hints.download_size;
        let upload_min = hints.upload_size.min(download_size);
        Self {
            header: HeaderBuffer::new(hints.header_initial, hints.header_hard_cap),
            download: PayloadBuffer::new(download_size),
            upload: PayloadBuffer::new(download_size),
            upload_window: upload_min,
            upload_min,
        }
    }

    /// Header buffer.
    #[must_use]
    pub fn header(&self) -> &HeaderBuffer {
        &self.header
    }

    /// Size of the download buffer.
    #[must_use]
    pub fn download_size(&self) -> usize {
        self.download.capacity()
    }

    /// Current upload window.
    #[must_use]
    pub fn upload_window(&self) -> usize {
        self.upload_window
    }

    /// Adapts the upload window to the measured upload speed (bytes/s).
    ///
    /// The window follows the speed, clamped between the configured minimum
    /// upload size and the download buffer size.
    pub fn adapt_upload(&mut self, upload_speed: f64) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let speed = if upload_speed.is_finite() && upload_speed > 0.0 {
            upload_speed as usize
        } else {
            0
        };
        self.upload_window = speed.clamp(self.upload_min, self.download.capacity());
        self.upload_window
    }

    /// Clears every buffer and restores the initial upload window.
    pub fn reset(&mut self) {
        self.header.reset();
        self.download.reset();
        self.upload.reset();
        self.upload_window = self.upload_min;
    }
}
