pub const VENDOR_IDENTIFIER: &str = "relmap";
pub const FRAMEWORK_LOG_VERSION: &str = "1.0";

// Environment variable consulted by the logger for its output directory.
pub const LOG_DIR_ENV: &str = "RELMAP_LOG_DIR";
pub const LOG_LEVEL_ENV: &str = "RELMAP_LOG_LEVEL";

// Pool defaults. These mirror the defaults of the pooled datasource
// configuration surface and are shared with the builder so that markup
// omitting a property and a programmatically built pool agree.
pub const DEFAULT_POOL_MAX_ACTIVE: usize = 10;
pub const DEFAULT_POOL_MAX_IDLE: usize = 5;
pub const DEFAULT_POOL_MAX_CHECKOUT_MS: u64 = 20_000;
pub const DEFAULT_POOL_TIME_TO_WAIT_MS: u64 = 20_000;
pub const DEFAULT_POOL_BAD_CONNECTION_TOLERANCE: usize = 3;
pub const DEFAULT_POOL_PING_QUERY: &str = "NO PING QUERY SET";
pub const DEFAULT_POOL_PING_NOT_USED_FOR_MS: u64 = 0;

// Cache defaults.
pub const DEFAULT_CACHE_SIZE: usize = 1024;
pub const DEFAULT_WEAK_HARD_LINKS: usize = 256;
pub const DEFAULT_SOFT_HARD_LINKS: usize = 1024;

// Separator between a namespace and a statement or result-map id.
pub const NAMESPACE_SEPARATOR: char = '.';
