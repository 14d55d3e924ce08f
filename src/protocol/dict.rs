//! DICT lookups.
//!
//! The URL path selects the command: `/MATCH:word:database:strategy`,
//! `/DEFINE:word:database` (with the `M`, `FIND`, `D` and `LOOKUP` aliases),
//! or anything else as a raw command with `:` standing for spaces. The
//! client identifies itself, sends the command and `QUIT` in one write,
//! then relays the whole server reply.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use super::{DoOutcome, ProtocolError, ProtocolHandler};
use crate::connection::Connection;
use crate::transfer::TransferContext;

const DEFAULT_WORD: &str = "default";
const ANY_DATABASE: &str = "!";
const DEFAULT_STRATEGY: &str = ".";

/// Per-connection DICT bookkeeping.
#[derive(Debug, Default)]
pub struct DictState {
    requests: u64,
    last_command: Option<String>,
}

impl DictState {
    /// Commands sent on this connection.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Last command sent, without its terminator.
    #[must_use]
    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }
}

/// Handler for `dict`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DictHandler;

#[async_trait]
impl ProtocolHandler for DictHandler {
    fn name(&self) -> &'static str {
        "dict"
    }

    #[instrument(skip_all, fields(path = %ctx.target().path()))]
    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let command = build_command(&ctx.target().decoded_path());
        debug!(command = %command, "Sending DICT command");
        conn.bits.close = true;

        let response_code = {
            let stream = conn.stream_mut()?;
            exchange(stream, ctx, &command).await?
        };

        let state = conn.dict_state_mut()?;
        state.requests += 1;
        state.last_command = Some(command);
        Ok(DoOutcome {
            response_code,
            ..DoOutcome::default()
        })
    }
}

async fn exchange<S>(
    stream: &mut S,
    ctx: &mut TransferContext<'_>,
    command: &str,
) -> Result<Option<u32>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = format!(
        "CLIENT netxfer {}\r\n{command}\r\nQUIT\r\n",
        env!("CARGO_PKG_VERSION")
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    ctx.record_upload(request.len() as u64)?;

    let mut response_code = None;
    while ctx.pump_payload(stream, None).await? > 0 {
        if response_code.is_none() {
            response_code = status_code(ctx.last_payload());
        }
    }
    Ok(response_code)
}

fn status_code(data: &[u8]) -> Option<u32> {
    let digits = data.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Maps a decoded URL path to the DICT command line.
fn build_command(path: &str) -> String {
    let path = path.trim_start_matches('/');
    let mut parts = path.split(':');
    let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
    let mut field = |default: &str| {
        parts
            .next()
            .filter(|value| !value.is_empty())
            .map_or_else(|| default.to_string(), str::to_string)
    };

    match verb.as_str() {
        "match" | "m" | "find" => {
            let word = escape_word(&field(DEFAULT_WORD));
            let database = field(ANY_DATABASE);
            let strategy = field(DEFAULT_STRATEGY);
            format!("MATCH {database} {strategy} {word}")
        }
        "define" | "d" | "lookup" => {
            let word = escape_word(&field(DEFAULT_WORD));
            let database = field(ANY_DATABASE);
            format!("DEFINE {database} {word}")
        }
        _ => path.replace(':', " "),
    }
}

/// Backslash-escapes characters that would split or quote a DICT atom.
fn escape_word(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len());
    for ch in word.chars() {
        if ch <= ' ' || ch == '\x7f' || matches!(ch, '"' | '\'' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
