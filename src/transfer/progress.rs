//! Transfer progress: byte counters, timing milestones and speed.
//!
//! Speed is measured over a rolling window of [`SPEED_SAMPLES`] one-second
//! intervals. Byte counters only grow while a transfer runs; [`Progress::reset`]
//! starts a new transfer.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::constants::{SPEED_SAMPLE_INTERVAL, SPEED_SAMPLES};
use crate::protocol::ProtocolError;

/// Timing milestones, measured from transfer start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    /// Host name resolved.
    NameLookup,
    /// Socket (and TLS) connected.
    Connect,
    /// About to start the request.
    PreTransfer,
}

/// Point-in-time view of a transfer, handed to the progress callback and
/// returned with the outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Payload bytes received.
    pub downloaded: u64,
    /// Payload bytes sent.
    pub uploaded: u64,
    /// Announced download size.
    pub expected_download: Option<u64>,
    /// Announced upload size.
    pub expected_upload: Option<u64>,
    /// Time since transfer start.
    pub elapsed: Duration,
    /// Time to name resolution.
    pub name_lookup: Option<Duration>,
    /// Time to connect.
    pub connect: Option<Duration>,
    /// Time to pre-transfer.
    pub pre_transfer: Option<Duration>,
    /// Bytes/s over the rolling window.
    pub current_speed: f64,
    /// Average download bytes/s since start.
    pub download_speed: f64,
    /// Average upload bytes/s since start.
    pub upload_speed: f64,
    /// Last protocol reply code.
    pub response_code: Option<u32>,
    /// Remote file time, when reported.
    pub filetime: Option<SystemTime>,
}

/// Live progress of the current transfer.
#[derive(Debug, Clone)]
pub struct Progress {
    start: Instant,
    name_lookup: Option<Duration>,
    connect: Option<Duration>,
    pre_transfer: Option<Duration>,
    downloaded: u64,
    uploaded: u64,
    expected_download: Option<u64>,
    expected_upload: Option<u64>,
    samples: VecDeque<(Instant, u64)>,
    current_speed: f64,
    low_speed_since: Option<Instant>,
    response_code: Option<u32>,
    filetime: Option<SystemTime>,
    callback_invoked: bool,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    /// Starts tracking a transfer now.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(start: Instant) -> Self {
        let mut samples = VecDeque::with_capacity(SPEED_SAMPLES + 1);
        samples.push_back((start, 0));
        Self {
            start,
            name_lookup: None,
            connect: None,
            pre_transfer: None,
            downloaded: 0,
            uploaded: 0,
            expected_download: None,
            expected_upload: None,
            samples,
            current_speed: 0.0,
            low_speed_since: None,
            response_code: None,
            filetime: None,
            callback_invoked: false,
        }
    }

    /// Discards all state and restarts the clock.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Records a milestone at the current time. Later marks overwrite earlier
    /// ones, so redirect hops report the final hop's timings.
    pub fn mark(&mut self, milestone: Milestone) {
        let elapsed = self.start.elapsed();
        match milestone {
            Milestone::NameLookup => self.name_lookup = Some(elapsed),
            Milestone::Connect => self.connect = Some(elapsed),
            Milestone::PreTransfer => self.pre_transfer = Some(elapsed),
        }
    }

    /// Time recorded for a milestone.
    #[must_use]
    pub fn milestone(&self, milestone: Milestone) -> Option<Duration> {
        match milestone {
            Milestone::NameLookup => self.name_lookup,
            Milestone::Connect => self.connect,
            Milestone::PreTransfer => self.pre_transfer,
        }
    }

    /// Adds received payload bytes.
    pub fn add_downloaded(&mut self, bytes: u64) {
        self.downloaded = self.downloaded.saturating_add(bytes);
    }

    /// Adds sent payload bytes.
    pub fn add_uploaded(&mut self, bytes: u64) {
        self.uploaded = self.uploaded.saturating_add(bytes);
    }

    /// Payload bytes received.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Payload bytes sent.
    #[must_use]
    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    /// Records the announced download size.
    pub fn set_expected_download(&mut self, size: Option<u64>) {
        self.expected_download = size;
    }

    /// Records the announced upload size.
    pub fn set_expected_upload(&mut self, size: Option<u64>) {
        self.expected_upload = size;
    }

    /// Records the last reply code.
    pub fn set_response_code(&mut self, code: Option<u32>) {
        if code.is_some() {
            self.response_code = code;
        }
    }

    /// Last reply code.
    #[must_use]
    pub fn response_code(&self) -> Option<u32> {
        self.response_code
    }

    /// Records the remote file time.
    pub fn set_filetime(&mut self, filetime: Option<SystemTime>) {
        if filetime.is_some() {
            self.filetime = filetime;
        }
    }

    /// True once the progress callback has been called for this transfer.
    #[must_use]
    pub fn callback_invoked(&self) -> bool {
        self.callback_invoked
    }

    pub(crate) fn note_callback(&mut self) {
        self.callback_invoked = true;
    }

    /// Time since transfer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Takes a speed sample if a sample interval has passed since the last
    /// one. Returns true when a sample was taken.
    pub fn sample(&mut self) -> bool {
        self.sample_at(Instant::now())
    }

    pub(crate) fn sample_at(&mut self, now: Instant) -> bool {
        let total = self.downloaded.saturating_add(self.uploaded);
        let due = self
            .samples
            .back()
            .is_none_or(|(at, _)| now.saturating_duration_since(*at) >= SPEED_SAMPLE_INTERVAL);
        if !due {
            return false;
        }
        self.samples.push_back((now, total));
        while self.samples.len() > SPEED_SAMPLES + 1 {
            self.samples.pop_front();
        }
        self.current_speed = match (self.samples.front(), self.samples.back()) {
            (Some((first_at, first)), Some((last_at, last))) => {
                let secs = last_at.saturating_duration_since(*first_at).as_secs_f64();
                if secs > 0.0 {
                    to_f64(last.saturating_sub(*first)) / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        true
    }

    /// Bytes/s over the rolling window.
    #[must_use]
    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    /// Average upload bytes/s since start.
    #[must_use]
    pub fn upload_speed(&self) -> f64 {
        average(self.uploaded, self.start.elapsed())
    }

    /// Fails when the speed has stayed below `limit` bytes/s for `window`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TooSlow`] once the window is exceeded.
    pub fn check_low_speed(&mut self, limit: u64, window: Duration) -> Result<(), ProtocolError> {
        self.check_low_speed_at(limit, window, Instant::now())
    }

    pub(crate) fn check_low_speed_at(
        &mut self,
        limit: u64,
        window: Duration,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        if self.current_speed >= to_f64(limit) {
            self.low_speed_since = None;
            return Ok(());
        }
        let since = *self.low_speed_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= window {
            return Err(ProtocolError::TooSlow { limit, window });
        }
        Ok(())
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.start.elapsed();
        ProgressSnapshot {
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            expected_download: self.expected_download,
            expected_upload: self.expected_upload,
            elapsed,
            name_lookup: self.name_lookup,
            connect: self.connect,
            pre_transfer: self.pre_transfer,
            current_speed: self.current_speed,
            download_speed: average(self.downloaded, elapsed),
            upload_speed: average(self.uploaded, elapsed),
            response_code: self.response_code,
            filetime: self.filetime,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(value: u64) -> f64 {
    value as f64
}

fn average(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { to_f64(bytes) / secs } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut progress = Progress::new();
        progress.add_downloaded(10);
        progress.add_downloaded(5);
        progress.add_uploaded(7);
        assert_eq!(progress.downloaded(), 15);
        assert_eq!(progress.uploaded(), 7);
        progress.add_downloaded(u64::MAX);
        assert_eq!(progress.downloaded(), u64::MAX);
    }

    #[test]
    fn test_milestones_are_ordered() {
        let mut progress = Progress::new();
        progress.mark(Milestone::NameLookup);
        progress.mark(Milestone::Connect);
        progress.mark(Milestone::PreTransfer);
        let lookup = progress.milestone(Milestone::NameLookup).unwrap_or_default();
        let connect = progress.milestone(Milestone::Connect).unwrap_or_default();
        let pre = progress.milestone(Milestone::PreTransfer).unwrap_or_default();
        assert!(lookup <= connect && connect <= pre);
    }

    #[test]
    fn test_speed_window_uses_last_samples() {
        let start = Instant::now();
        let mut progress = Progress::starting_at(start);
        for second in 1..=8u64 {
            progress.add_downloaded(1000);
            assert!(progress.sample_at(start + Duration::from_secs(second)));
        }
        assert!((progress.current_speed() - 1000.0).abs() < 1e-6);

        // Too soon for another sample.
        assert!(!progress.sample_at(start + Duration::from_millis(8500)));
    }

    #[test]
    fn test_low_speed_guard_trips_after_window() {
        let start = Instant::now();
        let mut progress = Progress::starting_at(start);
        let window = Duration::from_secs(3);
        progress.sample_at(start + Duration::from_secs(1));
        assert!(progress.check_low_speed_at(100, window, start + Duration::from_secs(1)).is_ok());
        assert!(progress.check_low_speed_at(100, window, start + Duration::from_secs(2)).is_ok());
        let error = progress
            .check_low_speed_at(100, window, start + Duration::from_secs(4))
            .unwrap_err();
        assert!(matches!(error, ProtocolError::TooSlow { limit: 100, .. }));
    }

    #[test]
    fn test_low_speed_guard_resets_when_fast_again() {
        let start = Instant::now();
        let mut progress = Progress::starting_at(start);
        let window = Duration::from_secs(2);
        assert!(progress.check_low_speed_at(10, window, start).is_ok());
        progress.add_downloaded(100_000);
        progress.sample_at(start + Duration::from_secs(1));
        assert!(progress.check_low_speed_at(10, window, start + Duration::from_secs(1)).is_ok());
        assert!(progress.check_low_speed_at(10, window, start + Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_snapshot_and_reset() {
        let mut progress = Progress::new();
        progress.add_downloaded(42);
        progress.set_expected_download(Some(100));
        progress.set_response_code(Some(200));
        progress.set_response_code(None);
        progress.note_callback();
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.downloaded, 42);
        assert_eq!(snapshot.expected_download, Some(100));
        assert_eq!(snapshot.response_code, Some(200));
        assert!(progress.callback_invoked());

        progress.reset();
        assert_eq!(progress.downloaded(), 0);
        assert!(!progress.callback_invoked());
        assert_eq!(progress.snapshot().response_code, None);
    }
}
