pub const PROCESSING_LONG_EDGE: u32 = 640;
pub const TICK_RATE_HZ: u32 = 60;
pub const DETECTION_TIMEOUT_MS: u64 = 2000;
pub const DEVICE_PIXEL_RATIO: f64 = 1.0;

// channels
pub const REQUEST_CHANNEL_CAPACITY: usize = 4;
pub const EVENT_CHANNEL_CAPACITY: usize = 8;
pub const ALERT_CHANNEL_CAPACITY: usize = 16;

// health
pub const HEALTH_SUMMARY_INTERVAL_SECS: u64 = 30;
pub const STALL_THRESHOLD_SECS: u64 = 5;
