use std::time::Duration;

pub const UI_REFRESH_HZ: u64 = 4;
pub const UI_REFRESH_INTERVAL: Duration = Duration::from_millis(1_000 / UI_REFRESH_HZ);

/// Above this many devices the status display gets unreadable.
pub const TUI_MAX_DEVICES: usize = 16;
