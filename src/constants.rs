//! Constants for the transfer engine (buffer sizes, timeouts, pool limits).

use std::time::Duration;

/// Download buffer size. Kept fairly big for throughput.
pub const DOWNLOAD_BUFFER_SIZE: usize = 50 * 1024;

/// Default upload buffer size. Kept small so progress updates stay responsive;
/// it grows with the measured upload speed, never beyond [`DOWNLOAD_BUFFER_SIZE`].
pub const UPLOAD_BUFFER_SIZE: usize = 2 * 1024;

/// Initial header buffer capacity. Enlarged on demand.
pub const HEADER_BUFFER_INITIAL: usize = 256;

/// Largest header chunk, and largest unterminated header block, the header
/// buffer accepts (100 KiB).
pub const HEADER_CHUNK_HARD_CAP: usize = 100 * 1024;

/// Default number of pooled connections per session.
pub const DEFAULT_POOL_CAPACITY: usize = 5;

/// Upper bound for a configured pool capacity.
pub const MAX_POOL_CAPACITY: usize = 256;

/// Default connect-phase timeout (30 seconds).
pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Bound on each cleanup step (`done`, `disconnect`, `close`, socket shutdown).
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of samples kept in the rolling speed window.
pub const SPEED_SAMPLES: usize = 5;

/// Minimum interval between two speed samples.
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Default FTP user when no credentials are supplied.
pub const FTP_ANONYMOUS_USER: &str = "anonymous";

/// Default FTP password for the anonymous user.
pub const FTP_ANONYMOUS_PASSWORD: &str = "netxfer@localhost";
