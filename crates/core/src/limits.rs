//! Duration defaults and clamps used by the coordinator and its idle passes.

use std::time::Duration;

/// Default commit max duration when the caller specifies `<= 0`.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(15 * 60);

/// Upper clamp for commit max duration; requests above this are capped.
pub const MAX_MAX_DURATION: Duration = Duration::from_secs(60 * 60);

/// Clamp a requested commit duration to `[default=15m, max=1h]`.
pub fn clamp_max_duration(requested: Option<Duration>) -> Duration {
    match requested {
        None => DEFAULT_MAX_DURATION,
        Some(d) if d.is_zero() => DEFAULT_MAX_DURATION,
        Some(d) if d > MAX_MAX_DURATION => MAX_MAX_DURATION,
        Some(d) => d,
    }
}

/// Priority-rollback idle pass interval when no priority work is known
/// pending.
pub const PRIORITY_IDLE_INTERVAL: Duration = Duration::from_secs(150);

/// Priority-rollback idle pass interval once priority work has been
/// observed, so abandoned writers are reclaimed quickly.
pub const PRIORITY_IDLE_INTERVAL_ACTIVE: Duration = Duration::from_secs(5);

/// Age a priority log entry must reach before `doPriorityRollbacks` will
/// touch it, so it doesn't race a writer still finishing Phase 2.
pub const PRIORITY_LOG_AGING_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Expired-log sweep interval when no hour is mid-processing.
pub const EXPIRED_LOG_IDLE_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Expired-log sweep interval while a stale hour is being drained.
pub const EXPIRED_LOG_IDLE_INTERVAL_ACTIVE: Duration = Duration::from_secs(5 * 60);
