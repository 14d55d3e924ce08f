//! FTP and FTPS (implicit TLS) with passive data connections.
//!
//! `connect` reads the greeting, protects the channel for FTPS and logs in.
//! `perform` changes into the target directory, then lists, retrieves or
//! stores over a fresh passive data connection held as the record's
//! secondary socket. `disconnect` says QUIT.

use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use super::wire::{self, Reply};
use super::{DoOutcome, Protocol, ProtocolError, ProtocolHandler};
use crate::connection::{Connection, Stream};
use crate::constants::{FTP_ANONYMOUS_PASSWORD, FTP_ANONYMOUS_USER};
use crate::target::Credentials;
use crate::transfer::TransferContext;

#[allow(clippy::expect_used)]
static PASV_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})")
        .expect("PASV regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static EPSV_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\|\|\|(\d{1,5})\|\)").expect("EPSV regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static PWD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""((?:[^"]|"")*)""#).expect("PWD regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static SIZE_HINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((\d+) bytes\)").expect("size hint regex is valid") // Static pattern, safe to panic
});

/// Per-connection FTP control-channel state.
#[derive(Debug, Default)]
pub struct FtpState {
    logged_in: bool,
    entry_path: Option<String>,
    current_dir: Vec<String>,
    transfer_type: Option<char>,
    protected: bool,
}

impl FtpState {
    /// True after a successful login.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Working directory reported by `PWD` right after login.
    #[must_use]
    pub fn entry_path(&self) -> Option<&str> {
        self.entry_path.as_deref()
    }

    /// `TYPE` currently in effect (`A` or `I`).
    #[must_use]
    pub fn transfer_type(&self) -> Option<char> {
        self.transfer_type
    }

    /// True when data connections are protected (FTPS).
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.protected
    }
}

/// Handler for `ftp` and `ftps`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FtpHandler;

#[async_trait]
impl ProtocolHandler for FtpHandler {
    fn name(&self) -> &'static str {
        "ftp"
    }

    #[instrument(skip_all, fields(host = %ctx.target().host()))]
    async fn connect(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        let credentials = conn
            .credentials()
            .cloned()
            .unwrap_or_else(|| Credentials::new(FTP_ANONYMOUS_USER, FTP_ANONYMOUS_PASSWORD));
        let protect = conn.protocol() == Protocol::Ftps;
        let entry_path = {
            let stream = conn.stream_mut()?;
            login(stream, &credentials, protect).await?
        };
        debug!(user = %credentials.user, entry_path = ?entry_path, "FTP login complete");

        let state = conn.ftp_state_mut()?;
        state.logged_in = true;
        state.protected = protect;
        state.entry_path = entry_path;
        state.current_dir.clear();
        state.transfer_type = None;
        Ok(())
    }

    #[instrument(skip_all, fields(path = %ctx.target().path()))]
    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let plan = FtpPlan::for_context(ctx)?;
        change_directory(conn, &plan.dirs).await?;
        set_type(conn, plan.transfer_type).await?;

        let mut filetime = None;
        if !plan.is_list() && !plan.upload {
            let stream = conn.stream_mut()?;
            if ctx.config().get_filetime {
                filetime = modification_time(stream, &plan.file).await?;
            }
            if plan.transfer_type == 'I' {
                let size = remote_size(stream, &plan.file).await?;
                if let Some(size) = size {
                    let offset = plan.resume_from.unwrap_or(0);
                    ctx.progress_mut()
                        .set_expected_download(Some(size.saturating_sub(offset)));
                }
            }
            if let Some(offset) = plan.resume_from {
                wire::command(stream, &format!("REST {offset}"))
                    .await?
                    .expect_code(&[350])?;
            }
        }

        open_data_connection(conn, ctx.target().host()).await?;

        let opening = {
            let stream = conn.stream_mut()?;
            wire::command(stream, &plan.command()).await?
        };
        let opening = match opening.expect_code(&[125, 150]) {
            Ok(reply) => reply,
            Err(error) => {
                close_secondary(conn).await;
                return Err(error);
            }
        };
        if !plan.upload
            && ctx.progress().snapshot().expected_download.is_none()
            && let Some(size) = size_hint(&opening)
        {
            ctx.progress_mut().set_expected_download(Some(size));
        }

        let Some(mut data) = conn.take_secondary() else {
            return Err(ProtocolError::closed_early("data connection"));
        };
        let complete = if plan.upload {
            while ctx.pump_upload(&mut data, None).await? > 0 {}
            data.close().await?;
            true
        } else {
            while ctx.pump_payload(&mut data, None).await? > 0 {}
            let truncated = ctx.download_allowance() == Some(0);
            if let Err(error) = data.close().await {
                debug!(error = %error, "Data connection shutdown failed");
            }
            !truncated
        };
        drop(data);

        if !complete {
            // Unread data is still in flight; the control channel is out of step.
            conn.bits.close = true;
            return Ok(DoOutcome {
                response_code: Some(opening.code),
                location: None,
                filetime,
            });
        }

        let stream = conn.stream_mut()?;
        let finished = wire::read_reply(stream).await?.expect_code(&[226, 250])?;
        Ok(DoOutcome {
            response_code: Some(finished.code),
            location: None,
            filetime,
        })
    }

    async fn done(
        &self,
        conn: &mut Connection,
        _ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        close_secondary(conn).await;
        Ok(())
    }

    async fn disconnect(&self, conn: &mut Connection) -> Result<(), ProtocolError> {
        if !conn.is_connected() {
            return Ok(());
        }
        let stream = conn.stream_mut()?;
        let reply = wire::command(stream, "QUIT").await?;
        debug!(code = reply.code, "FTP QUIT");
        Ok(())
    }
}

/// What one `perform` does, derived from the URL and options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FtpPlan {
    dirs: Vec<String>,
    file: String,
    upload: bool,
    list_only: bool,
    append: bool,
    resume_from: Option<u64>,
    transfer_type: char,
}

impl FtpPlan {
    fn for_context(ctx: &TransferContext<'_>) -> Result<Self, ProtocolError> {
        let config = ctx.config();
        let request = ctx.request();
        let path = ctx.target().path();
        let raw = path.strip_prefix('/').unwrap_or(path);

        let mut segments: Vec<String> = raw
            .split('/')
            .map(|segment| {
                urlencoding::decode(segment).map_or_else(|_| segment.to_string(), |s| s.into_owned())
            })
            .collect();
        let file = segments.pop().unwrap_or_default();
        let dirs = segments.into_iter().filter(|s| !s.is_empty()).collect();

        if request.upload && file.is_empty() {
            return Err(ProtocolError::unsupported("upload needs a file name in the URL"));
        }
        let list = file.is_empty() || config.ftp.list_only;
        let transfer_type = if list || config.ftp.ascii { 'A' } else { 'I' };
        let resume_from = request.resume_from.filter(|offset| *offset > 0);

        Ok(Self {
            dirs,
            file,
            upload: request.upload,
            list_only: config.ftp.list_only,
            append: config.ftp.append || (request.upload && resume_from.is_some()),
            resume_from: resume_from.filter(|_| !request.upload),
            transfer_type,
        })
    }

    fn is_list(&self) -> bool {
        !self.upload && (self.file.is_empty() || self.list_only)
    }

    fn command(&self) -> String {
        if self.upload {
            let verb = if self.append { "APPE" } else { "STOR" };
            return format!("{verb} {}", self.file);
        }
        if self.is_list() {
            let verb = if self.list_only { "NLST" } else { "LIST" };
            return if self.file.is_empty() {
                verb.to_string()
            } else {
                format!("{verb} {}", self.file)
            };
        }
        format!("RETR {}", self.file)
    }
}

/// Greeting, optional channel protection and login. Returns the entry path.
async fn login<S>(
    stream: &mut S,
    credentials: &Credentials,
    protect: bool,
) -> Result<Option<String>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    wire::read_reply(stream).await?.expect_code(&[220])?;

    if protect {
        wire::command(stream, "PBSZ 0").await?.expect_code(&[200])?;
        wire::command(stream, "PROT P").await?.expect_code(&[200])?;
    }

    let user = wire::command(stream, &format!("USER {}", credentials.user))
        .await?
        .expect_code(&[230, 331])?;
    if user.code == 331 {
        let pass = wire::command(stream, &format!("PASS {}", credentials.password_or_empty()))
            .await?
            .expect_code(&[230, 202, 332])?;
        if pass.code == 332 {
            return Err(ProtocolError::unsupported("server requires an ACCT login"));
        }
    }

    let pwd = wire::command(stream, "PWD").await?;
    Ok(if pwd.code == 257 {
        parse_pwd(pwd.text())
    } else {
        None
    })
}

fn parse_pwd(text: &str) -> Option<String> {
    PWD_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|path| path.as_str().replace("\"\"", "\""))
}

async fn change_directory(conn: &mut Connection, dirs: &[String]) -> Result<(), ProtocolError> {
    let (current, entry) = {
        let state = conn.ftp_state_mut()?;
        (state.current_dir.clone(), state.entry_path.clone())
    };
    if current == dirs {
        return Ok(());
    }

    {
        let stream = conn.stream_mut()?;
        if !current.is_empty() {
            let home = entry.unwrap_or_else(|| "/".to_string());
            wire::command(stream, &format!("CWD {home}"))
                .await?
                .expect_code(&[250])?;
        }
        for dir in dirs {
            wire::command(stream, &format!("CWD {dir}"))
                .await?
                .expect_code(&[250])?;
        }
    }
    conn.ftp_state_mut()?.current_dir = dirs.to_vec();
    Ok(())
}

async fn set_type(conn: &mut Connection, wanted: char) -> Result<(), ProtocolError> {
    if conn.ftp_state_mut()?.transfer_type == Some(wanted) {
        return Ok(());
    }
    let stream = conn.stream_mut()?;
    wire::command(stream, &format!("TYPE {wanted}"))
        .await?
        .expect_code(&[200])?;
    conn.ftp_state_mut()?.transfer_type = Some(wanted);
    Ok(())
}

async fn remote_size<S>(stream: &mut S, file: &str) -> Result<Option<u64>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let reply = wire::command(stream, &format!("SIZE {file}")).await?;
    Ok((reply.code == 213)
        .then(|| reply.text().trim().parse().ok())
        .flatten())
}

async fn modification_time<S>(stream: &mut S, file: &str) -> Result<Option<SystemTime>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let reply = wire::command(stream, &format!("MDTM {file}")).await?;
    Ok((reply.code == 213).then(|| parse_mdtm(reply.text())).flatten())
}

/// Parses an `MDTM` timestamp (`YYYYMMDDhhmmss`, UTC).
fn parse_mdtm(text: &str) -> Option<SystemTime> {
    let digits = text.trim().get(..14)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| digits[range].parse::<i64>().ok();
    let (year, month, day) = (field(0..4)?, field(4..6)?, field(6..8)?);
    let (hour, minute, second) = (field(8..10)?, field(10..12)?, field(12..14)?);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60 {
        return None;
    }
    let secs = days_from_civil(year, month, day) * 86_400 + hour * 3_600 + minute * 60 + second;
    u64::try_from(secs)
        .ok()
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year - era * 400;
    let shifted_month = (month + 9) % 12;
    let doy = (153 * shifted_month + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn size_hint(reply: &Reply) -> Option<u64> {
    SIZE_HINT_PATTERN
        .captures(&reply.message())
        .and_then(|caps| caps.get(1))
        .and_then(|size| size.as_str().parse().ok())
}

/// Enters passive mode and connects the data socket as the secondary stream.
async fn open_data_connection(conn: &mut Connection, host: &str) -> Result<(), ProtocolError> {
    let peer = conn.remote_addr();
    let extended = peer.is_some_and(|addr| addr.is_ipv6());

    let addr = {
        let stream = conn.stream_mut()?;
        if extended {
            let reply = wire::command(stream, "EPSV").await?.expect_code(&[229])?;
            let port = parse_epsv(&reply.message())
                .ok_or_else(|| ProtocolError::malformed(format!("bad EPSV reply '{}'", reply.message())))?;
            peer.map(|peer| SocketAddr::new(peer.ip(), port))
        } else {
            let reply = wire::command(stream, "PASV").await?.expect_code(&[227])?;
            let announced = parse_pasv(&reply.message())
                .ok_or_else(|| ProtocolError::malformed(format!("bad PASV reply '{}'", reply.message())))?;
            Some(match peer {
                Some(peer) if announced.ip().is_unspecified() => {
                    SocketAddr::new(peer.ip(), announced.port())
                }
                _ => announced,
            })
        }
    }
    .ok_or_else(|| ProtocolError::unsupported("no peer address for the data connection"))?;

    debug!(%addr, "Opening FTP data connection");
    let tcp = TcpStream::connect(addr).await?;
    let data = if conn.protocol() == Protocol::Ftps {
        conn.ssl()
            .wrap_secondary(host, tcp)
            .await?
    } else {
        Stream::Plain(tcp)
    };
    conn.set_secondary(data);
    Ok(())
}

fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let caps = PASV_PATTERN.captures(text)?;
    let mut octets = [0u8; 6];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    let ip = IpAddr::from([octets[0], octets[1], octets[2], octets[3]]);
    let port = (u16::from(octets[4]) << 8) | u16::from(octets[5]);
    Some(SocketAddr::new(ip, port))
}

fn parse_epsv(text: &str) -> Option<u16> {
    EPSV_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|port| port.as_str().parse().ok())
}

async fn close_secondary(conn: &mut Connection) {
    if let Some(mut data) = conn.take_secondary()
        && let Err(error) = data.shutdown().await
    {
        debug!(error = %error, "Data connection shutdown failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{FtpOptions, SessionConfig};
    use crate::transfer::bench::TestBench;

    fn plan(url: &str, config: SessionConfig) -> FtpPlan {
        let mut bench = TestBench::new(config, url);
        let ctx = bench.ctx();
        FtpPlan::for_context(&ctx).unwrap()
    }

    #[test]
    fn test_plan_retrieve_with_directories() {
        let plan = plan("ftp://host/pub/a%20b/file.txt", SessionConfig::default());
        assert_eq!(plan.dirs, vec!["pub".to_string(), "a b".to_string()]);
        assert_eq!(plan.file, "file.txt");
        assert_eq!(plan.transfer_type, 'I');
        assert_eq!(plan.command(), "RETR file.txt");
    }

    #[test]
    fn test_plan_directory_listing() {
        let plan_list = plan("ftp://host/pub/", SessionConfig::default());
        assert!(plan_list.is_list());
        assert_eq!(plan_list.transfer_type, 'A');
        assert_eq!(plan_list.command(), "LIST");

        let config = SessionConfig {
            ftp: FtpOptions {
                list_only: true,
                ..FtpOptions::default()
            },
            ..SessionConfig::default()
        };
        assert_eq!(plan("ftp://host/pub/", config).command(), "NLST");
    }

    #[test]
    fn test_plan_upload_variants() {
        let config = SessionConfig {
            upload: true,
            ..SessionConfig::default()
        };
        assert_eq!(plan("ftp://host/in/up.bin", config.clone()).command(), "STOR up.bin");

        let appending = SessionConfig {
            resume_from: Some(10),
            ..config.clone()
        };
        let appended = plan("ftp://host/up.bin", appending);
        assert_eq!(appended.command(), "APPE up.bin");
        assert_eq!(appended.resume_from, None);

        let mut bench = TestBench::new(config, "ftp://host/dir/");
        let ctx = bench.ctx();
        assert!(matches!(
            FtpPlan::for_context(&ctx),
            Err(ProtocolError::Unsupported(_))
        ));
    }

    #[test]
    fn test_parse_pasv_and_epsv() {
        let addr = parse_pasv("Entering Passive Mode (127,0,0,1,195,80).").unwrap();
        assert_eq!(addr, "127.0.0.1:50000".parse().unwrap());
        assert_eq!(parse_epsv("229 Entering Extended Passive Mode (|||6446|)"), Some(6446));
        assert!(parse_pasv("227 nothing here").is_none());
    }

    #[test]
    fn test_parse_pwd_unescapes_quotes() {
        assert_eq!(parse_pwd(r#""/home/ftp" is current"#).as_deref(), Some("/home/ftp"));
        assert_eq!(parse_pwd(r#""/odd""name""#).as_deref(), Some("/odd\"name"));
        assert_eq!(parse_pwd("no quotes"), None);
    }

    #[test]
    fn test_parse_mdtm() {
        let time = parse_mdtm("20240229123045").unwrap();
        let secs = time.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1_709_209_845);
        assert_eq!(parse_mdtm("19700101000000"), Some(UNIX_EPOCH));
        assert_eq!(parse_mdtm("2024"), None);
    }

    #[test]
    fn test_size_hint_from_opening_reply() {
        let reply = Reply {
            code: 150,
            lines: vec!["150 Opening BINARY mode data connection for f (1234 bytes)".to_string()],
        };
        assert_eq!(size_hint(&reply), Some(1234));
    }

    #[tokio::test]
    async fn test_login_sequence() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"220 Welcome\r\n")
            .write(b"USER alice\r\n")
            .read(b"331 Password required\r\n")
            .write(b"PASS secret\r\n")
            .read(b"230 Logged in\r\n")
            .write(b"PWD\r\n")
            .read(b"257 \"/home/alice\" is the current directory\r\n")
            .build();
        let creds = Credentials::new("alice", "secret");
        let entry = login(&mut stream, &creds, false).await.unwrap();
        assert_eq!(entry.as_deref(), Some("/home/alice"));
    }

    #[tokio::test]
    async fn test_login_rejected_carries_reply_code() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"220 Welcome\r\n")
            .write(b"USER bob\r\n")
            .read(b"331 Password required\r\n")
            .write(b"PASS wrong\r\n")
            .read(b"530 Login incorrect\r\n")
            .build();
        let creds = Credentials::new("bob", "wrong");
        let error = login(&mut stream, &creds, false).await.unwrap_err();
        assert_eq!(error.subcode(), 530);
    }

    #[tokio::test]
    async fn test_ftps_login_protects_channel() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"220 Welcome\r\n")
            .write(b"PBSZ 0\r\n")
            .read(b"200 PBSZ=0\r\n")
            .write(b"PROT P\r\n")
            .read(b"200 Protection set\r\n")
            .write(b"USER anonymous\r\n")
            .read(b"230 Anonymous access granted\r\n")
            .write(b"PWD\r\n")
            .read(b"257 \"/\"\r\n")
            .build();
        let creds = Credentials::new(FTP_ANONYMOUS_USER, FTP_ANONYMOUS_PASSWORD);
        let entry = login(&mut stream, &creds, true).await.unwrap();
        assert_eq!(entry.as_deref(), Some("/"));
    }
}
