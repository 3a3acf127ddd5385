//! Tunables for the suspension engine.

use std::time::Duration;

/// Engine-wide timing configuration, injected through the runtime
/// container. Defaults mirror long-standing production values.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use stopworld::config::EngineConfig;
///
/// let config = EngineConfig {
///     ping_timeout: Duration::from_millis(2),
///     ..EngineConfig::default()
/// };
/// assert_eq!(config.ping_timeout, Duration::from_millis(2));
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a coordinator waits on the suspend signal before
    /// re-running a suspension pass. Short, so a hijacked thread that
    /// wandered into a long-running call is retried promptly.
    pub ping_timeout: Duration,
    /// After this long without convergence a diagnostic build reports a
    /// fatal error naming the stuck thread. Release builds retry forever.
    pub deadlock_timeout: Duration,
    /// Interval between abort re-checks while the target sits at an
    /// unsafe point.
    pub abort_poll_interval: Duration,
    /// A normal abort that has not been delivered by this deadline is
    /// escalated to rude.
    pub abort_deadline: Duration,
    /// How long a canary check waits for the probe thread to answer
    /// before caching a "locks unavailable" verdict.
    pub canary_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_millis(1),
            deadlock_timeout: Duration::from_secs(40),
            abort_poll_interval: Duration::from_millis(10),
            abort_deadline: Duration::from_secs(40),
            canary_timeout: Duration::from_millis(200),
        }
    }
}
