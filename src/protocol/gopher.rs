//! GOPHER selector retrieval.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use super::{DoOutcome, ProtocolError, ProtocolHandler};
use crate::connection::Connection;
use crate::transfer::TransferContext;

/// Per-connection GOPHER bookkeeping.
#[derive(Debug, Default)]
pub struct GopherState {
    selector: Option<String>,
}

impl GopherState {
    /// Selector sent on this connection.
    #[must_use]
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }
}

/// Handler for `gopher`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GopherHandler;

#[async_trait]
impl ProtocolHandler for GopherHandler {
    fn name(&self) -> &'static str {
        "gopher"
    }

    #[instrument(skip_all, fields(host = %ctx.target().host()))]
    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let selector = selector_for(&ctx.target().decoded_path(), ctx.target().query());
        debug!(selector = %selector, "Requesting GOPHER selector");
        conn.bits.close = true;
        {
            let stream = conn.stream_mut()?;
            fetch(stream, ctx, &selector).await?;
        }
        conn.gopher_state_mut()?.selector = Some(selector);
        Ok(DoOutcome::default())
    }
}

async fn fetch<S>(
    stream: &mut S,
    ctx: &mut TransferContext<'_>,
    selector: &str,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let line = format!("{selector}\r\n");
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    ctx.record_upload(line.len() as u64)?;
    while ctx.pump_payload(stream, None).await? > 0 {}
    Ok(())
}

/// Drops the leading item-type character; a query becomes a tab-separated
/// search string.
fn selector_for(path: &str, query: Option<&str>) -> String {
    let path = path.trim_start_matches('/');
    let mut chars = path.chars();
    chars.next();
    let mut selector = chars.as_str().to_string();
    if let Some(query) = query {
        let query = urlencoding::decode(query).map_or_else(|_| query.to_string(), |q| q.into_owned());
        selector.push('\t');
        selector.push_str(&query);
    }
    selector
}
