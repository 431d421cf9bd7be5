//! Bundle distribution constants.

/// Byte budget of the in-memory bundle cache; least-recently-used entries
/// are evicted past this.
pub const BUNDLE_CACHE_CAP_BYTES: usize = 512 * 1024 * 1024;

/// Origin fetches are retried this many times with backoff before the
/// failure surfaces to the reconciler.
pub const BUNDLE_FETCH_RETRIES: u32 = 3;

/// Base delay between origin fetch retries, in milliseconds.
pub const BUNDLE_RETRY_BASE_DELAY_MS: u64 = 250;
