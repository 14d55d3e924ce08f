//! Line-oriented helpers shared by the text protocols (FTP, DICT, GOPHER).
//!
//! Lines are read one byte at a time so that nothing past the line
//! terminator is consumed; the same stream carries payload afterwards.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::ProtocolError;

/// Longest control line accepted from a peer.
pub(crate) const MAX_LINE: usize = 8 * 1024;

/// Reads one line without its terminator. `None` means the peer closed the
/// stream before sending anything.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte).await? == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            return Err(ProtocolError::malformed(format!(
                "line longer than {MAX_LINE} bytes"
            )));
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// A numbered reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub(crate) code: u32,
    pub(crate) lines: Vec<String>,
}

impl Reply {
    /// Text of the last line after the code.
    pub(crate) fn text(&self) -> &str {
        self.lines
            .last()
            .map_or("", |line| line.get(4..).unwrap_or_default())
    }

    /// Whole reply joined with newlines, for error messages.
    pub(crate) fn message(&self) -> String {
        self.lines.join("\n")
    }

    pub(crate) fn is_positive(&self) -> bool {
        (100..400).contains(&self.code)
    }

    /// Converts a reply whose code is not in `accepted` into an error.
    pub(crate) fn expect_code(self, accepted: &[u32]) -> Result<Self, ProtocolError> {
        if accepted.contains(&self.code) {
            Ok(self)
        } else {
            Err(ProtocolError::reply(self.code, self.message()))
        }
    }
}

fn reply_code(line: &str) -> Option<u32> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Reads a `NNN text` reply. `NNN-` starts a multi-line reply that ends at
/// the first line starting with `NNN `.
pub(crate) async fn read_reply<R>(reader: &mut R) -> Result<Reply, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
{
    let first = read_line(reader)
        .await?
        .ok_or_else(|| ProtocolError::closed_early("reply"))?;
    let code =
        reply_code(&first).ok_or_else(|| ProtocolError::malformed(format!("bad reply '{first}'")))?;
    trace!(line = %first, "<");

    let mut lines = vec![first];
    if lines[0].as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{code} ");
        loop {
            let line = read_line(reader)
                .await?
                .ok_or_else(|| ProtocolError::closed_early("multi-line reply"))?;
            trace!(line = %line, "<");
            let done = line.starts_with(&terminator) || line == terminator.trim_end();
            lines.push(line);
            if done {
                break;
            }
        }
    }
    Ok(Reply { code, lines })
}

/// Writes `line` followed by CRLF.
pub(crate) async fn send_line<W>(writer: &mut W, line: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + Send,
{
    if line.starts_with("PASS ") {
        trace!("> PASS ****");
    } else {
        trace!(line, ">");
    }
    let mut out = Vec::with_capacity(line.len() + 2);
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Sends a command and reads its reply.
pub(crate) async fn command<S>(stream: &mut S, line: &str) -> Result<Reply, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    send_line(stream, line).await?;
    read_reply(stream).await
}
