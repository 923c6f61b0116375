use common::{ParseSizeError, parse_size};
use std::time::Duration;

/// Tunables for a transfer session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Upload job granularity in bytes.
    pub block_size: u64,
    /// Per-driver-call timeout. A timed-out call counts as a transient
    /// failure and the job is re-queued.
    pub timeout: Duration,
    /// Number of concurrent worker tasks.
    pub threads: usize,
    /// Desired depot-distinct replicas per chunk.
    pub copies: usize,
    /// Lifetime hint for new allocations.
    pub duration: Duration,
    /// Optional visualization endpoint.
    pub viz_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            timeout: Duration::from_secs(30),
            threads: 5,
            copies: 1,
            duration: Duration::from_secs(24 * 60 * 60),
            viz_url: None,
        }
    }
}

impl SessionConfig {
    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }

    /// Block size from a human-readable string such as `"5m"`.
    pub fn block_size_str(mut self, raw: &str) -> Result<Self, ParseSizeError> {
        self.block_size = parse_size(raw)?;
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn copies(mut self, copies: usize) -> Self {
        self.copies = copies;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn viz_url(mut self, url: impl Into<String>) -> Self {
        self.viz_url = Some(url.into());
        self
    }
}
