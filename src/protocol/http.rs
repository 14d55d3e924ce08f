//! HTTP/1.1 over plain TCP or TLS.
//!
//! One `perform` writes a request and reads one response. Bodies are framed
//! by `Content-Length`, by connection close, or passed through undecoded when
//! chunked; only a length-framed exchange leaves the connection reusable.

use std::time::SystemTime;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use super::{DoOutcome, ProtocolError, ProtocolHandler};
use crate::config::RequestMethod;
use crate::connection::Connection;
use crate::target::Credentials;
use crate::transfer::TransferContext;
use crate::user_agent::default_user_agent;

/// Redirect bodies up to this size are drained to keep the connection.
const DRAIN_LIMIT: u64 = 64 * 1024;

/// Per-connection HTTP state.
#[derive(Debug, Default)]
pub struct HttpState {
    last_status: Option<u32>,
    requests: u64,
    http10: bool,
}

impl HttpState {
    /// Status of the last response on this connection.
    #[must_use]
    pub fn last_status(&self) -> Option<u32> {
        self.last_status
    }

    /// Requests sent on this connection.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// True when the peer answered with HTTP/1.0.
    #[must_use]
    pub fn is_http10(&self) -> bool {
        self.http10
    }
}

/// Handler for `http` and `https`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpHandler;

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip_all, fields(url = %ctx.target().display_url()))]
    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let via_proxy = conn.bits.via_proxy;
        let proxy_credentials = conn.proxy_credentials().filter(|_| via_proxy).cloned();
        let (head, body) =
            build_request(ctx, conn.credentials(), proxy_credentials.as_ref(), via_proxy)?;
        conn.bits.use_range = ctx.request().wants_range();

        let exchange = {
            let stream = conn.stream_mut()?;
            exchange(stream, ctx, &head, body).await?
        };

        conn.bits.chunked = exchange.chunked;
        if !exchange.reusable {
            conn.bits.close = true;
        }
        let state = conn.http_state_mut()?;
        state.last_status = Some(exchange.head.status);
        state.requests += 1;
        state.http10 = exchange.head.http10;

        let status = exchange.head.status;
        let location = (300..400)
            .contains(&status)
            .then(|| exchange.head.header("location").map(str::to_string))
            .flatten();
        let filetime = if ctx.config().get_filetime {
            exchange.head.last_modified()
        } else {
            None
        };
        debug!(status, reusable = exchange.reusable, "HTTP response complete");
        Ok(DoOutcome {
            response_code: Some(status),
            location,
            filetime,
        })
    }
}

/// Request body source.
#[derive(Debug, PartialEq, Eq)]
enum RequestBody {
    None,
    Bytes(Vec<u8>),
    /// Streamed from the read callback; the size is announced up front.
    Stream(u64),
}

/// Builds the request head and picks the body source.
fn build_request(
    ctx: &mut TransferContext<'_>,
    credentials: Option<&Credentials>,
    proxy_credentials: Option<&Credentials>,
    via_proxy: bool,
) -> Result<(Vec<u8>, RequestBody), ProtocolError> {
    let config = ctx.config();
    let target = ctx.target();
    let request = ctx.request();

    let body = match &request.method {
        RequestMethod::Post => {
            RequestBody::Bytes(request.body.clone().unwrap_or_default().into_bytes())
        }
        _ if request.upload => match config.upload_size {
            Some(size) => RequestBody::Stream(size),
            None => RequestBody::Bytes(Vec::new()),
        },
        _ => RequestBody::None,
    };
    let buffer_upload = request.upload && body == RequestBody::Bytes(Vec::new());

    let request_target = if via_proxy {
        target.display_url()
    } else {
        target.request_path()
    };
    let mut lines = vec![format!(
        "{} {request_target} HTTP/1.1",
        request.method.as_str()
    )];

    let custom: Vec<(&str, &str)> = config
        .headers
        .iter()
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();
    let overridden = |name: &str| custom.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));
    let mut push = |name: &str, value: String| {
        if !overridden(name) {
            lines.push(format!("{name}: {value}"));
        }
    };

    push("Host", target.authority());
    if let Some(creds) = credentials {
        push("Authorization", basic_auth(creds));
    }
    if let Some(creds) = proxy_credentials {
        push("Proxy-Authorization", basic_auth(creds));
    }
    push(
        "User-Agent",
        config.user_agent.clone().unwrap_or_else(default_user_agent),
    );
    if let Some(range) = &request.range {
        push("Range", format!("bytes={range}"));
    } else if let Some(offset) = request.resume_from.filter(|offset| *offset > 0) {
        push("Range", format!("bytes={offset}-"));
    }
    if let Some(referer) = &request.referer {
        push("Referer", referer.clone());
    }
    if let Some(cookie) = &config.cookie {
        push("Cookie", cookie.clone());
    }
    push("Accept", "*/*".to_string());
    if matches!(request.method, RequestMethod::Post) {
        push(
            "Content-Type",
            "application/x-www-form-urlencoded".to_string(),
        );
    }

    let body = if buffer_upload {
        RequestBody::Bytes(ctx.read_upload_to_end()?)
    } else {
        body
    };
    match &body {
        RequestBody::Bytes(bytes) => {
            lines.push(format!("Content-Length: {}", bytes.len()));
        }
        RequestBody::Stream(size) => lines.push(format!("Content-Length: {size}")),
        RequestBody::None => {}
    }

    lines.extend(
        custom
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| format!("{name}: {value}")),
    );

    let mut head = lines.join("\r\n").into_bytes();
    head.extend_from_slice(b"\r\n\r\n");
    Ok((head, body))
}

fn basic_auth(creds: &Credentials) -> String {
    let pair = format!("{}:{}", creds.user, creds.password_or_empty());
    format!("Basic {}", BASE64.encode(pair))
}

/// Parsed response status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    pub(crate) status: u32,
    pub(crate) reason: String,
    pub(crate) http10: bool,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub(crate) fn parse(block: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(block);
        let mut lines = text.lines().map(|line| line.trim_end_matches('\r'));
        let status_line = lines
            .next()
            .ok_or_else(|| ProtocolError::malformed("empty response head"))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(ProtocolError::malformed(format!(
                "bad status line '{status_line}'"
            )));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u32>().ok())
            .filter(|code| (100..1000).contains(code))
            .ok_or_else(|| ProtocolError::malformed(format!("bad status line '{status_line}'")))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Ok(Self {
            status,
            reason,
            http10: version == "HTTP/1.0",
            headers,
        })
    }

    /// First value of header `name` (lowercase).
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_str())
    }

    fn has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n == name)
            .flat_map(|(_, value)| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.parse().ok())
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.has_token("transfer-encoding", "chunked")
    }

    /// True when the peer will not keep the connection open.
    pub(crate) fn closes(&self) -> bool {
        if self.has_token("connection", "close") {
            return true;
        }
        self.http10 && !self.has_token("connection", "keep-alive")
    }

    pub(crate) fn last_modified(&self) -> Option<SystemTime> {
        self.header("last-modified")
            .and_then(|value| httpdate::parse_http_date(value).ok())
    }

    fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }
}

/// How the response body ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

fn framing(method: &RequestMethod, head: &ResponseHead) -> Framing {
    if matches!(method, RequestMethod::Head) || matches!(head.status, 204 | 304) {
        Framing::Empty
    } else if head.is_chunked() {
        Framing::Chunked
    } else if let Some(length) = head.content_length() {
        Framing::Length(length)
    } else {
        Framing::UntilClose
    }
}

#[derive(Debug)]
struct Exchange {
    head: ResponseHead,
    chunked: bool,
    reusable: bool,
}

/// Sends the request and reads the whole response.
async fn exchange<S>(
    stream: &mut S,
    ctx: &mut TransferContext<'_>,
    head: &[u8],
    body: RequestBody,
) -> Result<Exchange, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream.write_all(head).await?;
    match body {
        RequestBody::None => {}
        RequestBody::Bytes(bytes) => {
            ctx.progress_mut().set_expected_upload(Some(bytes.len() as u64));
            stream.write_all(&bytes).await?;
            ctx.record_upload(bytes.len() as u64)?;
        }
        RequestBody::Stream(size) => {
            ctx.progress_mut().set_expected_upload(Some(size));
            let mut remaining = size;
            while remaining > 0 {
                let sent = ctx.pump_upload(stream, Some(remaining)).await?;
                if sent == 0 {
                    return Err(ProtocolError::unsupported(format!(
                        "upload source ended {remaining} bytes before the announced size"
                    )));
                }
                remaining -= sent as u64;
            }
        }
    }
    stream.flush().await?;

    let (head, tail) = read_head(stream, ctx).await?;
    debug!(status = head.status, reason = %head.reason, "Received response head");

    if ctx.config().fail_on_error && head.status >= 400 {
        return Err(ProtocolError::reply(head.status, head.reason.clone()));
    }

    let framing = framing(&ctx.request().method, &head);
    ctx.progress_mut().set_expected_download(match framing {
        Framing::Length(length) => Some(length),
        Framing::Empty => Some(0),
        Framing::Chunked | Framing::UntilClose => None,
    });

    let following = ctx.config().follow_location
        && (300..400).contains(&head.status)
        && head.header("location").is_some();
    let clean = if following {
        discard_body(stream, framing, &tail).await?
    } else {
        read_body(stream, ctx, framing, &tail).await?
    };

    Ok(Exchange {
        chunked: framing == Framing::Chunked,
        reusable: clean && !head.closes(),
        head,
    })
}

/// Reads header blocks until a final (non-1xx) one arrives. Returns it with
/// the bytes read past its end.
async fn read_head<S>(
    stream: &mut S,
    ctx: &mut TransferContext<'_>,
) -> Result<(ResponseHead, Vec<u8>), ProtocolError>
where
    S: AsyncRead + Unpin + Send,
{
    let mut pending = Vec::new();
    loop {
        ctx.header_buffer_mut().reset();
        ctx.header_buffer_mut().append(&pending)?;
        let end = loop {
            if let Some(end) = ctx.header_buffer_mut().header_end() {
                break end;
            }
            ctx.header_buffer().check_unterminated()?;
            if ctx.read_header_chunk(stream).await? == 0 {
                return Err(ProtocolError::closed_early("response headers"));
            }
        };
        let tail = ctx.header_buffer_mut().split_tail(end);
        let block = ctx.header_buffer().as_bytes().to_vec();
        ctx.deliver_header(&block)?;

        let head = ResponseHead::parse(&block)?;
        if head.is_informational() {
            debug!(status = head.status, "Skipping informational response");
            pending = tail;
            continue;
        }
        return Ok((head, tail));
    }
}

/// Delivers the body. Returns whether the stream ended exactly at the body
/// end, leaving the connection usable.
async fn read_body<S>(
    stream: &mut S,
    ctx: &mut TransferContext<'_>,
    framing: Framing,
    tail: &[u8],
) -> Result<bool, ProtocolError>
where
    S: AsyncRead + Unpin + Send,
{
    match framing {
        Framing::Empty => Ok(tail.is_empty()),
        Framing::Length(length) => {
            let first = &tail[..tail.len().min(usize::try_from(length).unwrap_or(usize::MAX))];
            if ctx.deliver_allowed(first)? < first.len() {
                return Ok(false);
            }
            let surplus = tail.len() > first.len();
            let mut remaining = length - first.len() as u64;
            while remaining > 0 {
                let read = ctx.pump_payload(stream, Some(remaining)).await?;
                if read == 0 {
                    if ctx.download_allowance() == Some(0) {
                        return Ok(false);
                    }
                    return Err(ProtocolError::closed_early("response body"));
                }
                remaining -= read as u64;
            }
            Ok(!surplus)
        }
        Framing::UntilClose => {
            ctx.deliver_allowed(tail)?;
            while ctx.pump_payload(stream, None).await? > 0 {}
            Ok(false)
        }
        Framing::Chunked => {
            let mut scanner = ChunkScanner::default();
            let end = scanner.feed(tail)?;
            ctx.deliver_allowed(&tail[..end.unwrap_or(tail.len())])?;
            if end.is_some() {
                return Ok(false);
            }
            loop {
                let read = ctx.pump_payload(stream, None).await?;
                if read == 0 {
                    if ctx.download_allowance() == Some(0) {
                        return Ok(false);
                    }
                    return Err(ProtocolError::closed_early("chunked body"));
                }
                if scanner.feed(ctx.last_payload())?.is_some() {
                    return Ok(false);
                }
            }
        }
    }
}

/// Position inside chunked framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ChunkStep {
    #[default]
    Size,
    Extension,
    SizeLf,
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    FinalLf,
    Done,
}

/// Follows chunk boundaries of a body that is passed through undecoded.
#[derive(Debug, Default)]
struct ChunkScanner {
    step: ChunkStep,
    size: u64,
    digits: usize,
}

impl ChunkScanner {
    /// Consumes `data`. Returns the offset just past the last-chunk trailers
    /// once the body is complete.
    fn feed(&mut self, data: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let mut at = 0;
        while at < data.len() {
            let byte = data[at];
            self.step = match self.step {
                ChunkStep::Size => match byte {
                    b'\r' if self.digits > 0 => ChunkStep::SizeLf,
                    b';' | b' ' | b'\t' if self.digits > 0 => ChunkStep::Extension,
                    _ => {
                        let digit = char::from(byte).to_digit(16).ok_or_else(|| {
                            ProtocolError::malformed(format!("bad chunk size byte 0x{byte:02x}"))
                        })?;
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|size| size.checked_add(u64::from(digit)))
                            .ok_or_else(|| ProtocolError::malformed("chunk size overflows"))?;
                        self.digits += 1;
                        ChunkStep::Size
                    }
                },
                ChunkStep::Extension => {
                    if byte == b'\r' {
                        ChunkStep::SizeLf
                    } else {
                        ChunkStep::Extension
                    }
                }
                ChunkStep::SizeLf => {
                    expect_byte(byte, b'\n')?;
                    let size = std::mem::take(&mut self.size);
                    self.digits = 0;
                    if size == 0 {
                        ChunkStep::TrailerStart
                    } else {
                        ChunkStep::Data(size)
                    }
                }
                ChunkStep::Data(remaining) => {
                    let available = (data.len() - at) as u64;
                    let skip = remaining.min(available);
                    // `skip` is at most the bytes left in `data`.
                    at += usize::try_from(skip).unwrap_or(data.len() - at);
                    self.step = if skip == remaining {
                        ChunkStep::DataCr
                    } else {
                        ChunkStep::Data(remaining - skip)
                    };
                    continue;
                }
                ChunkStep::DataCr => {
                    expect_byte(byte, b'\r')?;
                    ChunkStep::DataLf
                }
                ChunkStep::DataLf => {
                    expect_byte(byte, b'\n')?;
                    ChunkStep::Size
                }
                ChunkStep::TrailerStart => {
                    if byte == b'\r' {
                        ChunkStep::FinalLf
                    } else {
                        ChunkStep::TrailerLine
                    }
                }
                ChunkStep::TrailerLine => {
                    if byte == b'\n' {
                        ChunkStep::TrailerStart
                    } else {
                        ChunkStep::TrailerLine
                    }
                }
                ChunkStep::FinalLf => {
                    expect_byte(byte, b'\n')?;
                    ChunkStep::Done
                }
                ChunkStep::Done => return Ok(Some(at)),
            };
            at += 1;
        }
        Ok((self.step == ChunkStep::Done).then_some(data.len()))
    }
}

fn expect_byte(byte: u8, wanted: u8) -> Result<(), ProtocolError> {
    if byte == wanted {
        Ok(())
    } else {
        Err(ProtocolError::malformed(format!(
            "bad chunk framing: expected 0x{wanted:02x}, got 0x{byte:02x}"
        )))
    }
}

/// Skips the body of a redirect that is about to be followed. Returns
/// whether the connection stays usable.
async fn discard_body<S>(stream: &mut S, framing: Framing, tail: &[u8]) -> Result<bool, ProtocolError>
where
    S: AsyncRead + Unpin + Send,
{
    match framing {
        Framing::Empty => Ok(tail.is_empty()),
        Framing::Length(length) if length <= DRAIN_LIMIT => {
            let buffered = tail.len() as u64;
            if buffered > length {
                return Ok(false);
            }
            let mut remaining = length - buffered;
            let mut scratch = [0u8; 4096];
            while remaining > 0 {
                let window = scratch.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                let read = stream.read(&mut scratch[..window]).await?;
                if read == 0 {
                    return Ok(false);
                }
                remaining -= read as u64;
            }
            Ok(true)
        }
        Framing::Length(_) | Framing::Chunked | Framing::UntilClose => Ok(false),
    }
}
