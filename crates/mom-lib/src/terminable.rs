//! Cooperative termination and deferred start
//!
//! Every long-lived task receives a [`Terminable`] built from a shared
//! [`CancellationToken`]. Terminating any holder of the token wakes every
//! sleeper that shares it. Child handles (see [`Terminable::child`]) can be
//! terminated on their own without affecting the parent.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Sleeps shorter than this are skipped entirely
pub const DEFAULT_MINIMAL_SLEEP: Duration = Duration::from_millis(10);

/// Shared termination handle
#[derive(Debug, Clone)]
pub struct Terminable {
    token: CancellationToken,
    minimal_sleep: Duration,
}

impl Default for Terminable {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminable {
    /// Create a new, independent termination handle
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Wrap an existing cancellation token
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            minimal_sleep: DEFAULT_MINIMAL_SLEEP,
        }
    }

    /// Override the minimal sleep duration
    pub fn with_minimal_sleep(mut self, minimal_sleep: Duration) -> Self {
        self.minimal_sleep = minimal_sleep;
        self
    }

    /// A handle that is terminated with this one, but can also be
    /// terminated alone
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            minimal_sleep: self.minimal_sleep,
        }
    }

    /// The underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request termination. Idempotent.
    pub fn terminate(&self) {
        self.token.cancel();
    }

    pub fn should_run(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Sleep for `duration` unless terminated first.
    ///
    /// Returns `true` if the task should keep running afterwards.
    pub async fn terminable_sleep(&self, duration: Duration) -> bool {
        if duration <= self.minimal_sleep {
            return self.should_run();
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => self.should_run(),
            _ = self.token.cancelled() => false,
        }
    }

    /// Sleep for a duration given in (possibly negative) seconds
    pub async fn terminable_sleep_secs(&self, seconds: f64) -> bool {
        if !seconds.is_finite() || seconds <= 0.0 {
            return self.should_run();
        }
        self.terminable_sleep(Duration::from_secs_f64(seconds)).await
    }

    /// Resolves once termination was requested
    pub async fn terminated(&self) {
        self.token.cancelled().await
    }
}

/// Start gate shared by tasks that must not begin their main loop until an
/// external trigger fires.
#[derive(Debug, Clone)]
pub struct DeferredStart {
    gate: CancellationToken,
    started_at: Arc<OnceLock<Instant>>,
    start_timeout: Option<Duration>,
}

impl Default for DeferredStart {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredStart {
    pub fn new() -> Self {
        Self {
            gate: CancellationToken::new(),
            started_at: Arc::new(OnceLock::new()),
            start_timeout: None,
        }
    }

    /// Give up waiting for `go()` after `timeout` and start anyway
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    /// Open the gate for every task sharing it
    pub fn go(&self) {
        self.started_at.get_or_init(Instant::now);
        self.gate.cancel();
    }

    pub fn is_started(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// When `go()` was first called
    pub fn start_time(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    /// Wait for the gate to open.
    ///
    /// Termination also opens the gate so no task hangs here. Returns `true`
    /// if the caller should proceed with its main loop.
    pub async fn wait(&self, terminable: &Terminable, name: &str) -> bool {
        if !self.is_started() {
            info!(task = %name, "Started deferred, waiting for start event");
        }

        let gate = async {
            tokio::select! {
                _ = self.gate.cancelled() => {}
                _ = terminable.terminated() => {}
            }
        };

        match self.start_timeout {
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, gate).await;
            }
            None => gate.await,
        }

        terminable.should_run()
    }
}
