//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod socket_guard;

use std::io;
use std::sync::{Arc, Mutex, Once};

use netxfer_core::{Session, SessionConfig};

static TRACING: Once = Once::new();

/// Routes library logs to the test writer; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds a session for `url`, panicking on invalid configuration.
pub fn session_for(url: &str) -> Session {
    Session::new(SessionConfig::for_url(url)).expect("test configuration is valid")
}

/// Installs a header sink on `session` and returns the collected header bytes.
pub fn capture_headers(session: &mut Session) -> Arc<Mutex<Vec<u8>>> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    session.hooks_mut().set_header(move |data| {
        sink.lock()
            .map_err(|_| io::Error::other("header sink poisoned"))?
            .extend_from_slice(data);
        Ok(())
    });
    captured
}
