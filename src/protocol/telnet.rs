//! TELNET as a raw relay that refuses every option the peer offers or asks
//! for.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, trace};

use super::{DoOutcome, ProtocolError, ProtocolHandler};
use crate::connection::Connection;
use crate::transfer::TransferContext;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const RELAY_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Parse {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Negotiation state of a TELNET connection.
#[derive(Debug, Default)]
pub struct TelnetState {
    parse: Parse,
    refused: u64,
}

impl TelnetState {
    /// Options refused so far.
    #[must_use]
    pub fn refused(&self) -> u64 {
        self.refused
    }

    /// Splits peer bytes into payload and negotiation replies.
    fn filter(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.parse = match (self.parse, byte) {
                (Parse::Data, IAC) => Parse::Iac,
                (Parse::Data, _) => {
                    data.push(byte);
                    Parse::Data
                }
                (Parse::Iac, IAC) => {
                    data.push(IAC);
                    Parse::Data
                }
                (Parse::Iac, DO | DONT | WILL | WONT) => Parse::Option(byte),
                (Parse::Iac, SB) => Parse::Sub,
                (Parse::Iac, _) => Parse::Data,
                (Parse::Option(command), option) => {
                    let refusal = match command {
                        DO => Some(WONT),
                        WILL => Some(DONT),
                        _ => None,
                    };
                    if let Some(refusal) = refusal {
                        trace!(command, option, "Refusing TELNET option");
                        replies.extend_from_slice(&[IAC, refusal, option]);
                        self.refused += 1;
                    }
                    Parse::Data
                }
                (Parse::Sub, IAC) => Parse::SubIac,
                (Parse::Sub, _) => Parse::Sub,
                (Parse::SubIac, SE) => Parse::Data,
                (Parse::SubIac, _) => Parse::Sub,
            };
        }
    }
}

/// Handler for `telnet`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelnetHandler;

#[async_trait]
impl ProtocolHandler for TelnetHandler {
    fn name(&self) -> &'static str {
        "telnet"
    }

    async fn connect(
        &self,
        conn: &mut Connection,
        _ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        conn.bits.close = true;
        Ok(())
    }

    #[instrument(skip_all, fields(host = %ctx.target().host()))]
    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let outgoing = if ctx.request().upload {
            escape(&ctx.read_upload_to_end()?)
        } else {
            Vec::new()
        };
        let mut state = std::mem::take(conn.telnet_state_mut()?);
        let relayed = {
            let stream = conn.stream_mut()?;
            relay(stream, &mut state, ctx, &outgoing).await
        };
        debug!(refused = state.refused, "TELNET session ended");
        *conn.telnet_state_mut()? = state;
        relayed?;
        Ok(DoOutcome::default())
    }
}

/// Doubles IAC bytes in outgoing data.
fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}

async fn relay<S>(
    stream: &mut S,
    state: &mut TelnetState,
    ctx: &mut TransferContext<'_>,
    outgoing: &[u8],
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if !outgoing.is_empty() {
        stream.write_all(outgoing).await?;
        stream.flush().await?;
        ctx.record_upload(outgoing.len() as u64)?;
    }

    let mut chunk = vec![0u8; RELAY_CHUNK];
    let mut data = Vec::with_capacity(RELAY_CHUNK);
    let mut replies = Vec::new();
    loop {
        if ctx.download_allowance() == Some(0) {
            return Ok(());
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        data.clear();
        replies.clear();
        state.filter(&chunk[..read], &mut data, &mut replies);
        ctx.deliver_allowed(&data)?;
        if !replies.is_empty() {
            stream.write_all(&replies).await?;
            stream.flush().await?;
        }
    }
}
