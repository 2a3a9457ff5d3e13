use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds since the process-wide monotonic epoch.
///
/// Every pipeline stage stamps with this clock, so stage deltas are immune to
/// wall-clock jumps. Strictly non-decreasing within a process.
pub fn monotonic_us() -> u64 {
	EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Wall-clock microseconds, used only to bucket statistics by whole second.
pub fn wall_clock_us() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_micros() as u64
}
