//! Integration tests for dispatcher phases, cancellation and connection
//! lifecycle.
//!
//! Custom handlers are registered over the DICT flag so the tests control
//! exactly what happens inside `perform`.

mod support;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use netxfer_core::connection::Connection;
use netxfer_core::transfer::TransferContext;
use netxfer_core::{
    DoOutcome, Phase, Protocol, ProtocolError, ProtocolHandler, Session, SessionConfig,
    StaticResolver, TransferError,
};
use support::socket_guard::bind_loopback_or_skip;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const FAKE_HOST: &str = "fake.test";

/// Never finishes `perform`; counts `done` calls.
#[derive(Debug, Default)]
struct StallingHandler {
    done_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ProtocolHandler for StallingHandler {
    fn name(&self) -> &'static str {
        "stall"
    }

    async fn perform(
        &self,
        _conn: &mut Connection,
        _ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        std::future::pending::<()>().await;
        Ok(DoOutcome::default())
    }

    async fn done(
        &self,
        _conn: &mut Connection,
        _ctx: &mut TransferContext<'_>,
    ) -> Result<(), ProtocolError> {
        self.done_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sends `ping` and delivers the five-byte answer.
#[derive(Debug, Default)]
struct PingHandler;

#[async_trait]
impl ProtocolHandler for PingHandler {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn perform(
        &self,
        conn: &mut Connection,
        ctx: &mut TransferContext<'_>,
    ) -> Result<DoOutcome, ProtocolError> {
        let stream = conn.stream_mut()?;
        stream.write_all(b"ping\n").await?;
        stream.flush().await?;
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await?;
        ctx.deliver(&reply)?;
        Ok(DoOutcome {
            response_code: Some(200),
            ..DoOutcome::default()
        })
    }
}

fn session_with(url: String, handler: Arc<dyn ProtocolHandler>, config: SessionConfig) -> Session {
    support::init_tracing();
    let resolver = StaticResolver::new().with(FAKE_HOST, IpAddr::V4(Ipv4Addr::LOCALHOST));
    let mut session = Session::new(SessionConfig {
        url: Some(url),
        ..config
    })
    .expect("test configuration is valid")
    .with_resolver(Arc::new(resolver));
    session.registry_mut().register(Protocol::Dict, handler);
    session
}

/// Accepts connections and keeps them open without reading.
fn serve_silently(listener: TcpListener) {
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
}

/// Answers one ping per connection, then hangs up.
fn serve_one_ping_per_connection(listener: TcpListener) -> Arc<AtomicUsize> {
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = [0u8; 5];
                if socket.read_exact(&mut request).await.is_ok() {
                    let _ = socket.write_all(b"pong\n").await;
                    let _ = socket.flush().await;
                }
            });
        }
    });
    accepted
}

#[tokio::test]
async fn test_cancel_during_perform_runs_done_and_discards_connection() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    serve_silently(listener);

    let handler = StallingHandler::default();
    let done_calls = Arc::clone(&handler.done_calls);
    let mut session = session_with(
        format!("dict://{FAKE_HOST}:{port}/"),
        Arc::new(handler),
        SessionConfig::default(),
    );

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let error = session.perform().await.unwrap_err();
    match error {
        TransferError::Cancelled { phase, protocol } => {
            assert_eq!(phase, Phase::Doing);
            assert_eq!(protocol, Some(Protocol::Dict));
        }
        other => panic!("Expected Cancelled, got {other:?}"),
    }
    assert_eq!(done_calls.load(Ordering::SeqCst), 1, "done must run after cancel");
    assert_eq!(session.pool_stats().occupied, 0);
    assert_eq!(session.pool_stats().busy, 0);
}

#[tokio::test]
async fn test_overall_timeout_expires_during_perform() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    serve_silently(listener);

    let handler = StallingHandler::default();
    let done_calls = Arc::clone(&handler.done_calls);
    let mut session = session_with(
        format!("dict://{FAKE_HOST}:{port}/"),
        Arc::new(handler),
        SessionConfig {
            timeout_ms: Some(150),
            ..SessionConfig::default()
        },
    );

    let error = session.perform().await.unwrap_err();
    match error {
        TransferError::Timeout { phase, limit, .. } => {
            assert_eq!(phase, Phase::Doing);
            assert_eq!(limit, Duration::from_millis(150));
        }
        other => panic!("Expected Timeout, got {other:?}"),
    }
    assert_eq!(done_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.pool_stats().occupied, 0);
}

#[tokio::test]
async fn test_stale_pooled_connection_is_replaced_transparently() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let accepted = serve_one_ping_per_connection(listener);

    let mut session = session_with(
        format!("dict://{FAKE_HOST}:{port}/"),
        Arc::new(PingHandler),
        SessionConfig::default(),
    );

    let first = session.perform().await.unwrap();
    assert_eq!(first.body, b"pong\n");
    assert_eq!(session.pool_stats().idle, 1);

    // The server hung up after the first answer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = session.perform().await.unwrap();
    assert_eq!(second.body, b"pong\n");
    assert!(!second.connection_reused, "stale connection must be replaced");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unknown_host_fails_resolution() {
    let mut session = session_with(
        "dict://nowhere.test:2628/".to_string(),
        Arc::new(PingHandler),
        SessionConfig::default(),
    );
    let error = session.perform().await.unwrap_err();
    assert_eq!(error.phase(), Phase::Resolving);
    match error {
        TransferError::Resolution { host, port, .. } => {
            assert_eq!(host, "nowhere.test");
            assert_eq!(port, 2628);
        }
        other => panic!("Expected Resolution, got {other:?}"),
    }
    assert_eq!(session.pool_stats().occupied, 0);
}

#[tokio::test]
async fn test_refused_connection_reports_connect_error() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut session = session_with(
        format!("dict://{FAKE_HOST}:{port}/"),
        Arc::new(PingHandler),
        SessionConfig::default(),
    );
    let error = session.perform().await.unwrap_err();
    assert!(
        matches!(error, TransferError::Connect { .. }),
        "Unexpected error: {error:?}"
    );
    assert_eq!(error.phase(), Phase::Connecting);
    assert_eq!(session.pool_stats().occupied, 0);
}

#[tokio::test]
async fn test_tls_handshake_failure_is_never_reused() {
    let Some(listener) = bind_loopback_or_skip() else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        }
    });

    let mut session =
        Session::new(SessionConfig::for_url(format!("https://127.0.0.1:{port}/"))).unwrap();
    for attempt in 1..=2 {
        let error = session.perform().await.unwrap_err();
        match &error {
            TransferError::TlsHandshake { host, protocol, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(*protocol, Protocol::Https);
            }
            other => panic!("Expected TlsHandshake, got {other:?}"),
        }
        assert_eq!(error.phase(), Phase::Connecting);
        assert_eq!(session.pool_stats().occupied, 0, "failed TLS connection must not be pooled");
        assert_eq!(
            accepted.load(Ordering::SeqCst),
            attempt,
            "each attempt must open a fresh connection and handshake again"
        );
    }
}
