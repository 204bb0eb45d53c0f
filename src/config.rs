use chrono::Duration;

/// Maximum stored sizes for variable-length job fields, in bytes.
///
/// Violating inputs are rejected with `DataTooLong` at the protocol
/// boundary. The one exception is the worker error message, which is
/// truncated instead (diagnostics are best-effort, not load-bearing).
#[derive(Debug, Clone)]
pub struct FieldLimits {
    pub input: usize,
    pub output: usize,
    pub description: usize,
    pub progress_msg: usize,
    pub err_msg: usize,
    /// Per-element limit for affinity and group tokens.
    pub token: usize,
    /// Limit for client ip / session id / PHID strings.
    pub client_info: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            input: 2048,
            output: 2048,
            description: 1024,
            progress_msg: 1024,
            err_msg: 2048,
            token: 2048,
            client_info: 1024,
        }
    }
}

/// Per-queue defaults used whenever a job carries no override of its own.
///
/// A job-level timeout of `Duration::zero()` means "use the queue default";
/// the queue-level values here are always nonzero.
#[derive(Debug, Clone)]
pub struct QueueTimeouts {
    /// Lifetime of a job outside of execution/reading.
    pub timeout: Duration,
    /// How long a dispatched job may run before it is requeued.
    pub run_timeout: Duration,
    /// How long a job handed out for reading may stay in `Reading`.
    pub read_timeout: Duration,
    /// Hard upper bound on how long a job may sit in `Pending`,
    /// counted from submit time.
    pub pending_timeout: Duration,
}

impl Default for QueueTimeouts {
    fn default() -> Self {
        Self {
            timeout: Duration::seconds(3600),
            run_timeout: Duration::seconds(3600),
            read_timeout: Duration::seconds(600),
            pending_timeout: Duration::seconds(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub timeouts: QueueTimeouts,
    pub limits: FieldLimits,
    /// How many times a job may fail before `FinalFail` makes it terminal.
    pub failed_retries: u32,
    /// How many times reading may fail before `ReadFinalFail`.
    pub read_failed_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            timeouts: QueueTimeouts::default(),
            limits: FieldLimits::default(),
            failed_retries: 3,
            read_failed_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.timeout = timeout;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.timeouts.run_timeout = run_timeout;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.timeouts.read_timeout = read_timeout;
        self
    }

    pub fn with_pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.timeouts.pending_timeout = pending_timeout;
        self
    }

    pub fn with_failed_retries(mut self, retries: u32) -> Self {
        self.failed_retries = retries;
        self
    }

    pub fn with_read_failed_retries(mut self, retries: u32) -> Self {
        self.read_failed_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_limits_default() {
        let limits = FieldLimits::default();
        assert_eq!(limits.input, 2048);
        assert_eq!(limits.output, 2048);
        assert_eq!(limits.description, 1024);
        assert_eq!(limits.progress_msg, 1024);
        assert_eq!(limits.err_msg, 2048);
    }

    #[test]
    fn queue_timeouts_default_nonzero() {
        let t = QueueTimeouts::default();
        assert!(t.timeout > Duration::zero());
        assert!(t.run_timeout > Duration::zero());
        assert!(t.read_timeout > Duration::zero());
        assert!(t.pending_timeout > Duration::zero());
    }

    #[test]
    fn queue_config_default_retries() {
        let cfg = QueueConfig::new();
        assert_eq!(cfg.failed_retries, 3);
        assert_eq!(cfg.read_failed_retries, 3);
    }

    #[test]
    fn queue_config_builders() {
        let cfg = QueueConfig::new()
            .with_timeout(Duration::seconds(10))
            .with_run_timeout(Duration::seconds(20))
            .with_read_timeout(Duration::seconds(30))
            .with_pending_timeout(Duration::seconds(40))
            .with_failed_retries(5)
            .with_read_failed_retries(1);
        assert_eq!(cfg.timeouts.timeout, Duration::seconds(10));
        assert_eq!(cfg.timeouts.run_timeout, Duration::seconds(20));
        assert_eq!(cfg.timeouts.read_timeout, Duration::seconds(30));
        assert_eq!(cfg.timeouts.pending_timeout, Duration::seconds(40));
        assert_eq!(cfg.failed_retries, 5);
        assert_eq!(cfg.read_failed_retries, 1);
    }
}
