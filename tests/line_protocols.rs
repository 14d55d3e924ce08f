//! Integration tests for the line-oriented protocols against scripted
//! loopback servers, plus local FILE transfers.

mod support;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use netxfer_core::{Protocol, Session, SessionConfig, StaticResolver, TransferError};
use support::socket_guard::bind_loopback_or_skip;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const FAKE_HOST: &str = "files.fake.test";

type Transcript = Arc<Mutex<Vec<String>>>;

fn session_for(url: String, config: SessionConfig) -> Session {
    let resolver = StaticResolver::new().with(FAKE_HOST, IpAddr::V4(Ipv4Addr::LOCALHOST));
    Session::new(SessionConfig {
        url: Some(url),
        ..config
    })
    .expect("test configuration is valid")
    .with_resolver(Arc::new(resolver))
}

fn record(transcript: &Transcript, line: &str) {
    transcript.lock().unwrap().push(line.to_string());
}

fn commands(transcript: &Transcript) -> Vec<String> {
    transcript.lock().unwrap().clone()
}

async fn reply(socket: &mut BufReader<TcpStream>, line: &str) {
    socket
        .get_mut()
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .unwrap();
}

/// Serves `files` (name, content) over a minimal passive-mode FTP dialogue.
fn serve_ftp(listener: TcpListener, files: Vec<(&'static str, &'static [u8])>) -> Transcript {
    let transcript: Transcript = Arc::default();
    let log = Arc::clone(&transcript);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            let files = files.clone();
            tokio::spawn(async move { ftp_session(socket, &log, &files).await });
        }
    });
    transcript
}

async fn ftp_session(socket: TcpStream, log: &Transcript, files: &[(&str, &[u8])]) {
    let mut socket = BufReader::new(socket);
    reply(&mut socket, "220 fake FTP ready").await;
    let mut data_listener: Option<TcpListener> = None;
    let mut line = String::new();
    loop {
        line.clear();
        if socket.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let command = line.trim_end().to_string();
        record(log, &command);
        let (verb, argument) = command.split_once(' ').unwrap_or((command.as_str(), ""));
        match verb {
            "USER" => reply(&mut socket, "331 password please").await,
            "PASS" => reply(&mut socket, "230 welcome").await,
            "PWD" => reply(&mut socket, "257 \"/\" is the current directory").await,
            "CWD" => reply(&mut socket, "250 directory changed").await,
            "TYPE" => reply(&mut socket, "200 type set").await,
            "SIZE" => match files.iter().find(|(name, _)| *name == argument) {
                Some((_, content)) => reply(&mut socket, &format!("213 {}", content.len())).await,
                None => reply(&mut socket, "550 no such file").await,
            },
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data_listener = Some(listener);
                let announce = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port >> 8,
                    port & 0xff
                );
                reply(&mut socket, &announce).await;
            }
            "RETR" => {
                let Some(listener) = data_listener.take() else {
                    reply(&mut socket, "425 use PASV first").await;
                    continue;
                };
                let Some((_, content)) = files.iter().find(|(name, _)| *name == argument) else {
                    reply(&mut socket, "550 no such file").await;
                    continue;
                };
                reply(&mut socket, "150 opening data connection").await;
                let (mut data, _) = listener.accept().await.unwrap();
                data.write_all(content).await.unwrap();
                data.shutdown().await.unwrap();
                drop(data);
                reply(&mut socket, "226 transfer complete").await;
            }
            "QUIT" => {
                reply(&mut socket, "221 bye").await;
                return;
            }
            _ => reply(&mut socket, "502 not implemented").await,
        }
    }
}

#[tokio::test]
async fn test_ftp_download_then_reuse_control_connection() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let transcript = serve_ftp(
        listener,
        vec![
            ("readme.txt", &b"hello ftp\r\n"[..]),
            ("other.txt", &b"second file"[..]),
        ],
    );

    let mut session = session_for(
        format!("ftp://{FAKE_HOST}:{port}/pub/readme.txt"),
        SessionConfig::default(),
    );
    let first = session.perform().await.expect("first FTP transfer");
    assert_eq!(first.body, b"hello ftp\r\n");
    assert_eq!(first.response_code, Some(226));
    assert_eq!(first.progress.expected_download, Some(11));
    assert!(!first.connection_reused);

    session.set_url(format!("ftp://{FAKE_HOST}:{port}/pub/other.txt"));
    let second = session.perform().await.expect("second FTP transfer");
    assert_eq!(second.body, b"second file");
    assert!(second.connection_reused);

    session.close().await;
    let sent = commands(&transcript);
    assert_eq!(sent.first().map(String::as_str), Some("USER anonymous"));
    assert_eq!(sent.iter().filter(|c| c.starts_with("USER")).count(), 1);
    assert_eq!(sent.iter().filter(|c| c.as_str() == "CWD pub").count(), 1);
    assert_eq!(sent.iter().filter(|c| c.starts_with("TYPE")).count(), 1);
    assert!(sent.contains(&"RETR readme.txt".to_string()));
    assert!(sent.contains(&"RETR other.txt".to_string()));
    assert_eq!(sent.last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_ftp_missing_file_fails_and_drops_connection() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    serve_ftp(listener, Vec::new());

    let mut session = session_for(
        format!("ftp://{FAKE_HOST}:{port}/absent.bin"),
        SessionConfig::default(),
    );
    let error = session.perform().await.unwrap_err();
    assert_eq!(error.protocol(), Some(Protocol::Ftp));
    assert_eq!(error.subcode(), Some(550));
    assert_eq!(session.pool_stats().occupied, 0);
}

#[tokio::test]
async fn test_ftp_silent_after_login_times_out_and_tears_down() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let transcript: Transcript = Arc::default();
    let log = Arc::clone(&transcript);
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        reply(&mut socket, "220 fake FTP ready").await;
        let mut line = String::new();
        while socket.read_line(&mut line).await.unwrap_or(0) > 0 {
            let command = line.trim_end().to_string();
            line.clear();
            record(&log, &command);
            if command.starts_with("USER") {
                reply(&mut socket, "331 password please").await;
            } else if command.starts_with("PASS") {
                reply(&mut socket, "230 welcome").await;
            }
        }
    });

    let mut session = session_for(
        format!("ftp://{FAKE_HOST}:{port}/pub/readme.txt"),
        SessionConfig {
            timeout_ms: Some(500),
            ..SessionConfig::default()
        },
    );
    let started = std::time::Instant::now();
    let error = tokio::time::timeout(std::time::Duration::from_secs(8), session.perform())
        .await
        .expect("teardown must not wait on a silent peer")
        .unwrap_err();
    assert!(
        matches!(error, TransferError::Timeout { .. }),
        "Unexpected error: {error:?}"
    );
    assert!(started.elapsed() < std::time::Duration::from_secs(8));
    assert_eq!(session.pool_stats().occupied, 0);
    assert_eq!(session.pool_stats().busy, 0);
    assert!(commands(&transcript).iter().any(|c| c.starts_with("PASS")));
}

#[tokio::test]
async fn test_dict_define_relays_server_reply() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let transcript: Transcript = Arc::default();
    let log = Arc::clone(&transcript);
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        reply(&mut socket, "220 fake dictd ready").await;
        let mut line = String::new();
        while socket.read_line(&mut line).await.unwrap_or(0) > 0 {
            let command = line.trim_end().to_string();
            line.clear();
            record(&log, &command);
            if command == "QUIT" {
                break;
            }
        }
        reply(&mut socket, "150 1 definitions retrieved").await;
        reply(&mut socket, "151 \"rust\" wn").await;
        reply(&mut socket, "a reddish-brown coating on iron").await;
        reply(&mut socket, ".").await;
        reply(&mut socket, "250 ok").await;
        reply(&mut socket, "221 bye").await;
    });

    let mut session = session_for(
        format!("dict://{FAKE_HOST}:{port}/d:rust:wn"),
        SessionConfig::default(),
    );
    let outcome = session.perform().await.unwrap();
    let body = String::from_utf8(outcome.body).unwrap();
    assert!(body.starts_with("220 fake dictd ready\r\n"));
    assert!(body.contains("a reddish-brown coating on iron"));
    assert!(body.ends_with("221 bye\r\n"));
    assert_eq!(outcome.response_code, Some(220));
    assert_eq!(session.pool_stats().occupied, 0, "DICT connections are never pooled");

    let sent = commands(&transcript);
    assert!(sent[0].starts_with("CLIENT netxfer"));
    assert_eq!(&sent[1..], ["DEFINE wn rust", "QUIT"]);
}

#[tokio::test]
async fn test_gopher_sends_selector_without_item_type() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let transcript: Transcript = Arc::default();
    let log = Arc::clone(&transcript);
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        let mut line = String::new();
        socket.read_line(&mut line).await.unwrap();
        record(&log, line.trim_end());
        reply(&mut socket, "iWelcome to the hole\tfake\tnull\t0").await;
        reply(&mut socket, ".").await;
    });

    let mut session = session_for(
        format!("gopher://{FAKE_HOST}:{port}/1/docs"),
        SessionConfig::default(),
    );
    let outcome = session.perform().await.unwrap();
    assert_eq!(commands(&transcript), ["/docs"]);
    assert_eq!(outcome.body, b"iWelcome to the hole\tfake\tnull\t0\r\n.\r\n");
}

#[tokio::test]
async fn test_telnet_refuses_options_and_relays_text() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let refusal = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&refusal);
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&[255, 253, 24]).await.unwrap();
        socket.write_all(b"login: ").await.unwrap();
        let mut answer = [0u8; 3];
        socket.read_exact(&mut answer).await.unwrap();
        seen.lock().unwrap().extend_from_slice(&answer);
    });

    let mut session = session_for(
        format!("telnet://{FAKE_HOST}:{port}"),
        SessionConfig::default(),
    );
    let outcome = session.perform().await.unwrap();
    assert_eq!(outcome.body, b"login: ");
    assert_eq!(*refusal.lock().unwrap(), vec![255, 252, 24]);
    assert_eq!(session.pool_stats().occupied, 0);
}

#[tokio::test]
async fn test_file_upload_then_ranged_download() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("notes.txt");
    let url = url::Url::from_file_path(&path).unwrap().to_string();

    let mut session = session_for(
        url.clone(),
        SessionConfig {
            upload: true,
            ..SessionConfig::default()
        },
    );
    session.hooks_mut().set_read_bytes(b"alpha beta gamma".to_vec());
    let uploaded = session.perform().await.unwrap();
    assert_eq!(uploaded.bytes_up, 16);
    assert_eq!(std::fs::read(&path).unwrap(), b"alpha beta gamma");

    session
        .set_config(SessionConfig {
            range: Some("6-9".to_string()),
            get_filetime: true,
            ..SessionConfig::for_url(&url)
        })
        .unwrap();
    session.hooks_mut().clear();
    let ranged = session.perform().await.unwrap();
    assert_eq!(ranged.body, b"beta");
    assert!(ranged.filetime.is_some());
    assert_eq!(session.pool_stats().occupied, 0, "FILE records are never pooled");
}

#[tokio::test]
async fn test_file_missing_reports_protocol_connect_failure() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let url = url::Url::from_file_path(dir.path().join("absent")).unwrap().to_string();
    let mut session = session_for(url, SessionConfig::default());
    let error = session.perform().await.unwrap_err();
    assert!(
        matches!(error, TransferError::ProtocolConnect { protocol: Protocol::File, .. }),
        "Unexpected error: {error:?}"
    );
}
