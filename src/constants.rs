// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";

// Delivery configuration constants
pub const DEFAULT_EVICTION_THRESHOLD: u32 = 5;
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;
pub const DEFAULT_MAX_CONCURRENT_DELIVERIES: usize = 1024;
