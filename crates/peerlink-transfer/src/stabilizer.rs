/// Reconnection rate limiter for the transfer channel.
///
/// Keeps a sliding window of recent connection attempts. Callers ask
/// `should_attempt_connection()` before every (re)connect; the answer is
/// always yes, but it may first make the caller wait:
///
///   - attempts in window >= max_attempts  ->  backoff *= 1.5 (capped), wait
///     the new backoff, clear the window
///   - last attempt less than reconnect_delay ago  ->  wait the remainder
///
/// A successful connection resets the backoff to the base delay.
///
/// One instance is created per running agent and shared by `Arc` with every
/// component that connects.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rolling window used to count recent attempts.
pub const STABILIZATION_PERIOD: Duration = Duration::from_millis(30_000);

/// Attempts allowed inside one window before a backoff is forced.
pub const MAX_RECONNECT_ATTEMPTS: usize = 3;

/// Base delay between attempts, and the backoff value after a success.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5_000);

/// Backoff ceiling.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_millis(60_000);

/// Backoff growth factor per forced wait.
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Stabilizer tuning.
#[derive(Debug, Clone)]
pub struct StabilizerConfig {
    pub stabilization_period: Duration,
    pub max_attempts: usize,
    pub reconnect_delay: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        StabilizerConfig {
            stabilization_period: STABILIZATION_PERIOD,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            max_backoff: MAX_BACKOFF_DELAY,
            multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

/// A recorded attempt with its outcome.
#[derive(Clone, Copy, Debug)]
struct ConnectionAttempt {
    time: Instant,
    success: bool,
}

struct StabilizerState {
    attempts: VecDeque<ConnectionAttempt>,
    backoff: Duration,
    last_connection_time: Option<Instant>,
}

impl StabilizerState {
    fn prune(&mut self, now: Instant, period: Duration) {
        while let Some(front) = self.attempts.front() {
            if now.duration_since(front.time) > period {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct ConnectionStabilizer {
    config: StabilizerConfig,
    state: Mutex<StabilizerState>,
}

impl Default for ConnectionStabilizer {
    fn default() -> Self {
        Self::new(StabilizerConfig::default())
    }
}

impl ConnectionStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        let backoff = config.reconnect_delay;
        ConnectionStabilizer {
            config,
            state: Mutex::new(StabilizerState {
                attempts: VecDeque::with_capacity(8),
                backoff,
                last_connection_time: None,
            }),
        }
    }

    /// Wait until a connection attempt is allowed. Always returns `true`.
    pub async fn should_attempt_connection(&self) -> bool {
        let wait = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.prune(now, self.config.stabilization_period);

            if state.attempts.len() >= self.config.max_attempts {
                let grown = state.backoff.mul_f64(self.config.multiplier);
                state.backoff = grown.min(self.config.max_backoff);
                state.attempts.clear();
                warn!(
                    "{} connection attempts inside {:?}, backing off for {:?}",
                    self.config.max_attempts, self.config.stabilization_period, state.backoff
                );
                Some(state.backoff)
            } else {
                state.last_connection_time.and_then(|last| {
                    let since = now.duration_since(last);
                    (since < self.config.reconnect_delay)
                        .then(|| self.config.reconnect_delay - since)
                })
            }
        };

        if let Some(delay) = wait {
            debug!("Delaying connection attempt by {:?}", delay);
            tokio::time::sleep(delay).await;
        }
        true
    }

    /// Record the outcome of a connection attempt.
    pub fn record_connection_attempt(&self, success: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.attempts.push_back(ConnectionAttempt { time: now, success });
        state.last_connection_time = Some(now);

        if success {
            state.backoff = self.config.reconnect_delay;
            state.attempts.clear();
        } else {
            let failures = state.attempts.iter().filter(|a| !a.success).count();
            debug!("Connection attempt failed ({} in window)", failures);
        }
    }

    /// Backoff that the next forced wait will grow from.
    pub fn current_backoff(&self) -> Duration {
        self.state.lock().backoff
    }

    /// Attempts currently inside the window (before pruning).
    pub fn window_len(&self) -> usize {
        self.state.lock().attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_attempt_is_immediate() {
        let s = ConnectionStabilizer::default();
        let start = Instant::now();
        assert!(s.should_attempt_connection().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_reconnect_delay() {
        let s = ConnectionStabilizer::default();
        s.record_connection_attempt(false);
        tokio::time::advance(Duration::from_millis(2_000)).await;

        let start = Instant::now();
        s.should_attempt_connection().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(3_000), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(3_100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_force_backoff() {
        let s = ConnectionStabilizer::default();
        for _ in 0..3 {
            s.record_connection_attempt(false);
        }

        let start = Instant::now();
        assert!(s.should_attempt_connection().await);
        assert!(start.elapsed() >= Duration::from_millis(7_500));
        assert_eq!(s.current_backoff(), Duration::from_millis(7_500));
        assert_eq!(s.window_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_monotonically_and_caps() {
        let s = ConnectionStabilizer::default();
        let mut previous = s.current_backoff();
        for _ in 0..12 {
            for _ in 0..3 {
                s.record_connection_attempt(false);
            }
            s.should_attempt_connection().await;
            let now = s.current_backoff();
            assert!(now >= previous);
            assert!(now <= MAX_BACKOFF_DELAY);
            previous = now;
        }
        assert_eq!(previous, MAX_BACKOFF_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff_and_window() {
        let s = ConnectionStabilizer::default();
        for _ in 0..3 {
            s.record_connection_attempt(false);
        }
        s.should_attempt_connection().await;
        assert!(s.current_backoff() > RECONNECT_DELAY);

        s.record_connection_attempt(false);
        s.record_connection_attempt(true);
        assert_eq!(s.current_backoff(), RECONNECT_DELAY);
        assert_eq!(s.window_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn old_attempts_leave_the_window() {
        let s = ConnectionStabilizer::default();
        for _ in 0..3 {
            s.record_connection_attempt(false);
        }
        tokio::time::advance(Duration::from_millis(31_000)).await;

        let start = Instant::now();
        s.should_attempt_connection().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(s.current_backoff(), RECONNECT_DELAY);
    }
}
