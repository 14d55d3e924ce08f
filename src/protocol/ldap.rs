//! LDAP search over a minimal BER codec.
//!
//! `connect` performs a simple bind (anonymous unless credentials are
//! known), `perform` runs the search described by
//! `ldap://host/base?attributes?scope?filter` and renders every entry as
//! `DN:` plus tab-indented `attribute: value` lines, and `disconnect` sends
//! an unbind.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use super::{DoOutcome, ProtocolError, ProtocolHandler};
use crate::connection::Connection;
use crate::transfer::TransferContext;

const LDAP_VERSION: i64 = 3;
const MAX_MESSAGE: usize = 16 * 1024 * 1024;
const DEFAULT_FILTER: &str = "(objectClass=*)";

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTETS: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0a;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;

const OP_BIND_REQUEST: u8 = 0x60;
const OP_BIND_RESPONSE: u8 = 0x61;
const OP_UNBIND_REQUEST: u8 = 0x42;
const OP_SEARCH_REQUEST: u8 = 0x63;
const OP_SEARCH_ENTRY: u8 = 0x64;
const OP_SEARCH_DONE: u8 = 0x65;
const OP_SEARCH_REFERENCE: u8 = 0x73;

const AUTH_SIMPLE: u8 = 0x80;

const FILTER_AND: u8 = 0xa0;
const FILTER_OR: u8 = 0xa1;
const FILTER_NOT: u8 = 0xa2;
const FILTER_EQUALITY: u8 = 0xa3;
const FILTER_SUBSTRINGS: u8 = 0xa4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xa5;
const FILTER_LESS_OR_EQUAL: u8 = 0xa6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xa8;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const RESULT_SUCCESS: u32 = 0;

/// Bind state of an LDAP connection.
#[derive(Debug, Default)]
pub struct LdapState {
    last_id: i64,
    bound_as: Option<String>,
    searches: u64,
}

impl LdapState {
    /// DN the connection is bound as; empty for an anonymous bind.
    #[must_use]
    pub fn bound_as(&self) -> Option<&str> {
        self.bound_as.as_deref()
    }

    /// Searches completed on this connection.
    #[must_use]
    pub fn searches(&self) -> u64 {
        self.searches
    }

    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Base = 0,
    One = 1,
    Sub = 2,
}

/// Search parameters carried by an LDAP URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchSpec {
    base: String,
    attributes: Vec<String>,
    scope: Scope,
    filter: String,
}

impl SearchSpec {
    fn parse(decoded_path: &str, query: Option<&str>) -> Result<Self, ProtocolError> {
        let base = decoded_path.trim_start_matches('/').to_string();
        let mut fields = query.unwrap_or_default().split('?').map(decode);
        let attributes = fields
            .next()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|attribute| !attribute.is_empty())
            .map(str::to_string)
            .collect();
        let scope = match fields.next().unwrap_or_default().to_ascii_lowercase().as_str() {
            "" | "base" => Scope::Base,
            "one" => Scope::One,
            "sub" => Scope::Sub,
            other => return Err(ProtocolError::malformed(format!("unknown LDAP scope '{other}'"))),
        };
        let filter = fields
            .next()
            .filter(|filter| !filter.is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        Ok(Self {
            base,
            attributes,
            scope,
            filter,
        })
    }
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |s| s.into_owned())
}

/// Handler for `ldap`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LdapHandler;

#[async_trait]
impl ProtocolHandler for LdapHandler {
    fn name(&self) -> &'static str {
        "ldap"
    }

    #[instrument(skip_all, fields(host = %ctx.target().host()))]
    async fn connect(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        let (name, password) = conn.credentials().map_or_else(
            || (String::new(), String::new()),
            |credentials| {
                (
                    credentials.user.clone(),
                    credentials.password_or_empty().to_string(),
                )
            },
        );
        let id = conn.ldap_state_mut()?.next_id();
        {
            let stream = conn.stream_mut()?;
            bind(stream, id, &name, &password).await?;
        }
        debug!(anonymous = name.is_empty(), "LDAP bind accepted");
        conn.ldap_state_mut()?.bound_as = Some(name);
        Ok(())
    }

    #[instrument(skip_all, fields(base = %ctx.target().decoded_path()))]
    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let spec = SearchSpec::parse(&ctx.target().decoded_path(), ctx.target().query())?;
        let id = conn.ldap_state_mut()?.next_id();
        let code = {
            let stream = conn.stream_mut()?;
            search(stream, ctx, id, &spec).await?
        };
        conn.ldap_state_mut()?.searches += 1;
        Ok(DoOutcome {
            response_code: Some(code),
            ..DoOutcome::default()
        })
    }

    async fn disconnect(&self, conn: &mut Connection) -> Result<(), ProtocolError> {
        if !conn.is_connected() {
            return Ok(());
        }
        let id = conn.ldap_state_mut()?.next_id();
        let stream = conn.stream_mut()?;
        stream.write_all(&unbind_request(id)).await?;
        stream.flush().await?;
        Ok(())
    }
}

async fn bind<S>(stream: &mut S, id: i64, name: &str, password: &str) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream.write_all(&bind_request(id, name, password)).await?;
    stream.flush().await?;

    let message = read_message(stream).await?;
    let (tag, body) = split_message(&message, id)?;
    if tag != OP_BIND_RESPONSE {
        return Err(ProtocolError::malformed(format!(
            "expected bind response, got tag {tag:#04x}"
        )));
    }
    let (code, diagnostic) = parse_result(body)?;
    if code != RESULT_SUCCESS {
        return Err(ProtocolError::reply(code, non_empty(diagnostic, "bind rejected")));
    }
    Ok(())
}

async fn search<S>(
    stream: &mut S,
    ctx: &mut TransferContext<'_>,
    id: i64,
    spec: &SearchSpec,
) -> Result<u32, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = search_request(id, spec)?;
    stream.write_all(&request).await?;
    stream.flush().await?;
    ctx.record_upload(request.len() as u64)?;

    let mut entries = 0u64;
    loop {
        let message = read_message(stream).await?;
        let (tag, body) = split_message(&message, id)?;
        match tag {
            OP_SEARCH_ENTRY => {
                entries += 1;
                let rendered = render_entry(body)?;
                if ctx.download_allowance() != Some(0) {
                    ctx.deliver_allowed(rendered.as_bytes())?;
                }
            }
            OP_SEARCH_REFERENCE => debug!("Skipping search continuation reference"),
            OP_SEARCH_DONE => {
                let (code, diagnostic) = parse_result(body)?;
                debug!(code, entries, "LDAP search finished");
                if code != RESULT_SUCCESS {
                    warn!(code, diagnostic = %diagnostic, "LDAP search failed");
                    return Err(ProtocolError::reply(
                        code,
                        non_empty(diagnostic, "search failed"),
                    ));
                }
                return Ok(code);
            }
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unexpected LDAP operation tag {other:#04x}"
                )));
            }
        }
    }
}

fn non_empty(text: String, fallback: &str) -> String {
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

// ---- requests ----

fn bind_request(id: i64, name: &str, password: &str) -> Vec<u8> {
    let mut op = integer(TAG_INTEGER, LDAP_VERSION);
    op.extend(tlv(TAG_OCTETS, name.as_bytes()));
    op.extend(tlv(AUTH_SIMPLE, password.as_bytes()));
    envelope(id, &tlv(OP_BIND_REQUEST, &op))
}

fn search_request(id: i64, spec: &SearchSpec) -> Result<Vec<u8>, ProtocolError> {
    let mut op = tlv(TAG_OCTETS, spec.base.as_bytes());
    op.extend(integer(TAG_ENUMERATED, spec.scope as i64));
    op.extend(integer(TAG_ENUMERATED, 0));
    op.extend(integer(TAG_INTEGER, 0));
    op.extend(integer(TAG_INTEGER, 0));
    op.extend(tlv(TAG_BOOLEAN, &[0x00]));
    op.extend(encode_filter(&spec.filter)?);
    let attributes: Vec<u8> = spec
        .attributes
        .iter()
        .flat_map(|attribute| tlv(TAG_OCTETS, attribute.as_bytes()))
        .collect();
    op.extend(tlv(TAG_SEQUENCE, &attributes));
    Ok(envelope(id, &tlv(OP_SEARCH_REQUEST, &op)))
}

fn unbind_request(id: i64) -> Vec<u8> {
    envelope(id, &tlv(OP_UNBIND_REQUEST, &[]))
}

fn envelope(id: i64, op: &[u8]) -> Vec<u8> {
    let mut content = integer(TAG_INTEGER, id);
    content.extend_from_slice(op);
    tlv(TAG_SEQUENCE, &content)
}

// ---- filters ----

/// Encodes a string filter: `&`, `|`, `!`, equality, `>=`, `<=`, `~=`,
/// presence and substrings. Parentheses around a lone item are optional.
fn encode_filter(filter: &str) -> Result<Vec<u8>, ProtocolError> {
    let trimmed = filter.trim();
    let wrapped;
    let source = if trimmed.starts_with('(') {
        trimmed
    } else {
        wrapped = format!("({trimmed})");
        wrapped.as_str()
    };
    let (encoded, rest) = parse_filter(source)?;
    if !rest.trim().is_empty() {
        return Err(bad_filter(filter));
    }
    Ok(encoded)
}

fn bad_filter(filter: &str) -> ProtocolError {
    ProtocolError::malformed(format!("bad LDAP filter '{filter}'"))
}

fn parse_filter(input: &str) -> Result<(Vec<u8>, &str), ProtocolError> {
    let inner = input
        .trim_start()
        .strip_prefix('(')
        .ok_or_else(|| bad_filter(input))?;
    let set_tag = match inner.chars().next() {
        Some('&') => Some(FILTER_AND),
        Some('|') => Some(FILTER_OR),
        Some('!') => Some(FILTER_NOT),
        _ => None,
    };

    if let Some(tag) = set_tag {
        let mut rest = &inner[1..];
        let mut content = Vec::new();
        let mut members = 0;
        loop {
            let trimmed = rest.trim_start();
            if let Some(after) = trimmed.strip_prefix(')') {
                if members == 0 || (tag == FILTER_NOT && members != 1) {
                    return Err(bad_filter(input));
                }
                return Ok((tlv(tag, &content), after));
            }
            let (member, after) = parse_filter(trimmed)?;
            content.extend(member);
            members += 1;
            rest = after;
        }
    }

    let end = inner.find(')').ok_or_else(|| bad_filter(input))?;
    let item = &inner[..end];
    Ok((encode_item(item)?, &inner[end + 1..]))
}

fn encode_item(item: &str) -> Result<Vec<u8>, ProtocolError> {
    let (attribute, value) = item.split_once('=').ok_or_else(|| bad_filter(item))?;
    let (attribute, tag) = if let Some(attribute) = attribute.strip_suffix('>') {
        (attribute, FILTER_GREATER_OR_EQUAL)
    } else if let Some(attribute) = attribute.strip_suffix('<') {
        (attribute, FILTER_LESS_OR_EQUAL)
    } else if let Some(attribute) = attribute.strip_suffix('~') {
        (attribute, FILTER_APPROX)
    } else {
        (attribute, FILTER_EQUALITY)
    };
    let attribute = attribute.trim();
    if attribute.is_empty() {
        return Err(bad_filter(item));
    }

    if tag == FILTER_EQUALITY && value == "*" {
        return Ok(tlv(FILTER_PRESENT, attribute.as_bytes()));
    }

    if tag == FILTER_EQUALITY && value.contains('*') {
        let pieces: Vec<&str> = value.split('*').collect();
        let last = pieces.len() - 1;
        let mut substrings = Vec::new();
        for (position, piece) in pieces.iter().enumerate() {
            if piece.is_empty() {
                continue;
            }
            let kind = match position {
                0 => SUBSTRING_INITIAL,
                p if p == last => SUBSTRING_FINAL,
                _ => SUBSTRING_ANY,
            };
            substrings.extend(tlv(kind, &unescape_value(piece)?));
        }
        let mut content = tlv(TAG_OCTETS, attribute.as_bytes());
        content.extend(tlv(TAG_SEQUENCE, &substrings));
        return Ok(tlv(FILTER_SUBSTRINGS, &content));
    }

    let mut content = tlv(TAG_OCTETS, attribute.as_bytes());
    content.extend(tlv(TAG_OCTETS, &unescape_value(value)?));
    Ok(tlv(tag, &content))
}

/// Resolves `\XX` hex escapes in a filter value.
fn unescape_value(value: &str) -> Result<Vec<u8>, ProtocolError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\' {
            let hex = value
                .get(index + 1..index + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| bad_filter(value))?;
            out.push(hex);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    Ok(out)
}

// ---- BER ----

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        let significant = &bytes[skip..];
        #[allow(clippy::cast_possible_truncation)]
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
    out.extend_from_slice(content);
    out
}

fn integer(tag: u8, value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    tlv(tag, &bytes[start..])
}

fn decode_integer(content: &[u8]) -> Result<i64, ProtocolError> {
    if content.is_empty() || content.len() > 8 {
        return Err(ProtocolError::malformed("bad BER integer"));
    }
    let negative = content[0] & 0x80 != 0;
    let mut value: i64 = if negative { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | i64::from(byte);
    }
    Ok(value)
}

/// Cursor over consecutive TLVs in a byte slice.
struct BerReader<'a> {
    data: &'a [u8],
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn next(&mut self) -> Result<(u8, &'a [u8]), ProtocolError> {
        let truncated = || ProtocolError::malformed("truncated BER element");
        let (&tag, rest) = self.data.split_first().ok_or_else(truncated)?;
        let (&first, mut rest) = rest.split_first().ok_or_else(truncated)?;
        let len = if first < 0x80 {
            usize::from(first)
        } else {
            let count = usize::from(first & 0x7f);
            if count == 0 || count > 4 || rest.len() < count {
                return Err(ProtocolError::malformed("bad BER length"));
            }
            let len = rest[..count]
                .iter()
                .fold(0usize, |len, &byte| (len << 8) | usize::from(byte));
            rest = &rest[count..];
            len
        };
        if rest.len() < len {
            return Err(truncated());
        }
        let (content, remaining) = rest.split_at(len);
        self.data = remaining;
        Ok((tag, content))
    }

    fn expect(&mut self, tag: u8) -> Result<&'a [u8], ProtocolError> {
        let (found, content) = self.next()?;
        if found != tag {
            return Err(ProtocolError::malformed(format!(
                "expected BER tag {tag:#04x}, got {found:#04x}"
            )));
        }
        Ok(content)
    }
}

/// Reads one complete `LDAPMessage` and returns its content.
async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
{
    let tag = reader.read_u8().await?;
    if tag != TAG_SEQUENCE {
        return Err(ProtocolError::malformed(format!(
            "LDAP message starts with tag {tag:#04x}"
        )));
    }
    let first = reader.read_u8().await?;
    let len = if first < 0x80 {
        usize::from(first)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 {
            return Err(ProtocolError::malformed("bad BER length"));
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | usize::from(reader.read_u8().await?);
        }
        len
    };
    if len > MAX_MESSAGE {
        return Err(ProtocolError::malformed(format!(
            "LDAP message of {len} bytes exceeds limit"
        )));
    }
    let mut content = vec![0u8; len];
    reader.read_exact(&mut content).await?;
    Ok(content)
}

/// Checks the message id and returns the operation tag and content.
fn split_message(message: &[u8], expected_id: i64) -> Result<(u8, &[u8]), ProtocolError> {
    let mut reader = BerReader::new(message);
    let id = decode_integer(reader.expect(TAG_INTEGER)?)?;
    if id != expected_id {
        return Err(ProtocolError::malformed(format!(
            "LDAP reply for message {id}, expected {expected_id}"
        )));
    }
    reader.next()
}

/// Parses an `LDAPResult` into its code and diagnostic message.
fn parse_result(body: &[u8]) -> Result<(u32, String), ProtocolError> {
    let mut reader = BerReader::new(body);
    let code = decode_integer(reader.expect(TAG_ENUMERATED)?)?;
    let code = u32::try_from(code).map_err(|_| ProtocolError::malformed("negative result code"))?;
    reader.expect(TAG_OCTETS)?;
    let diagnostic = String::from_utf8_lossy(reader.expect(TAG_OCTETS)?).into_owned();
    Ok((code, diagnostic))
}

/// Renders a `SearchResultEntry` body.
fn render_entry(body: &[u8]) -> Result<String, ProtocolError> {
    let mut reader = BerReader::new(body);
    let dn = String::from_utf8_lossy(reader.expect(TAG_OCTETS)?);
    let mut out = format!("DN: {dn}\n");

    let mut attributes = BerReader::new(reader.expect(TAG_SEQUENCE)?);
    while !attributes.is_empty() {
        let mut attribute = BerReader::new(attributes.expect(TAG_SEQUENCE)?);
        let name = String::from_utf8_lossy(attribute.expect(TAG_OCTETS)?);
        let mut values = BerReader::new(attribute.expect(TAG_SET)?);
        while !values.is_empty() {
            let value = values.expect(TAG_OCTETS)?;
            match std::str::from_utf8(value) {
                Ok(text) if !text.chars().any(char::is_control) => {
                    out.push_str(&format!("\t{name}: {text}\n"));
                }
                _ => out.push_str(&format!("\t{name}:: {}\n", BASE64.encode(value))),
            }
        }
    }
    out.push('\n');
    Ok(out)
}
