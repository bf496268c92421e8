//! Pool configuration.
//!
//! [`PoolConfig`] is validated once, when a [`ConnectionPool`] is built, and
//! is immutable afterwards. Zero values are treated as "unset" and replaced
//! with the defaults below by [`PoolConfig::normalized`].
//!
//! With the `clap` feature, [`PoolArgs`] exposes the same knobs as CLI flags
//! with environment variable fallbacks so binaries can `#[command(flatten)]`
//! them into their own argument structs.
//!
//! [`ConnectionPool`]: crate::ConnectionPool

use core::time::Duration;

/// Number of connection slots per endpoint.
pub const DEFAULT_POOL_SIZE: usize = 10;
/// Upper bound on establishing a single connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between HTTP/2 keep-alive pings.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for a keep-alive ack before the connection is dropped.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest message the client will encode.
pub const DEFAULT_MAX_SEND_MESSAGE_SIZE: usize = 4 << 20;
/// Largest message the client will decode.
pub const DEFAULT_MAX_RECV_MESSAGE_SIZE: usize = 4 << 20;
/// HTTP/2 flow-control window per stream.
pub const DEFAULT_INITIAL_STREAM_WINDOW_SIZE: u32 = 4 << 20;
/// HTTP/2 flow-control window per connection.
pub const DEFAULT_INITIAL_CONNECTION_WINDOW_SIZE: u32 = 4 << 20;

/// Settings shared by every pool built from one routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Fixed number of slots (connections) per endpoint.
    pub pool_size: usize,
    /// Bound on a single dial, including the HTTP/2 handshake.
    pub dial_timeout: Duration,
    /// HTTP/2 keep-alive ping interval. Pings are sent even while idle.
    pub keep_alive_interval: Duration,
    /// Keep-alive ack deadline.
    pub keep_alive_timeout: Duration,
    pub max_send_message_size: usize,
    pub max_recv_message_size: usize,
    pub initial_stream_window_size: u32,
    pub initial_connection_window_size: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            max_send_message_size: DEFAULT_MAX_SEND_MESSAGE_SIZE,
            max_recv_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
            initial_stream_window_size: DEFAULT_INITIAL_STREAM_WINDOW_SIZE,
            initial_connection_window_size: DEFAULT_INITIAL_CONNECTION_WINDOW_SIZE,
        }
    }
}

impl PoolConfig {
    /// Returns a copy where every zero field is replaced by its default.
    #[must_use]
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            pool_size: or_default(self.pool_size, defaults.pool_size),
            dial_timeout: or_default(self.dial_timeout, defaults.dial_timeout),
            keep_alive_interval: or_default(self.keep_alive_interval, defaults.keep_alive_interval),
            keep_alive_timeout: or_default(self.keep_alive_timeout, defaults.keep_alive_timeout),
            max_send_message_size: or_default(
                self.max_send_message_size,
                defaults.max_send_message_size,
            ),
            max_recv_message_size: or_default(
                self.max_recv_message_size,
                defaults.max_recv_message_size,
            ),
            initial_stream_window_size: or_default(
                self.initial_stream_window_size,
                defaults.initial_stream_window_size,
            ),
            initial_connection_window_size: or_default(
                self.initial_connection_window_size,
                defaults.initial_connection_window_size,
            ),
        }
    }

    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    #[must_use]
    pub const fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    #[must_use]
    pub const fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.keep_alive_timeout = timeout;
        self
    }
}

fn or_default<T: Default + PartialEq>(value: T, default: T) -> T {
    if value == T::default() { default } else { value }
}

/// CLI/environment view of [`PoolConfig`].
///
/// Durations are given in milliseconds. A value of `0` means "use the
/// default".
#[cfg(feature = "clap")]
#[derive(clap::Args, Debug, Clone)]
pub struct PoolArgs {
    /// Number of long-lived connections kept per endpoint.
    ///
    /// Environment variable: `MUXPOOL_POOL_SIZE`
    #[arg(long, env = "MUXPOOL_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Upper bound on dialing a single connection, in milliseconds.
    ///
    /// Environment variable: `MUXPOOL_DIAL_TIMEOUT_MS`
    #[arg(long, env = "MUXPOOL_DIAL_TIMEOUT_MS", default_value_t = 10_000)]
    pub dial_timeout_ms: u64,

    /// HTTP/2 keep-alive ping interval, in milliseconds.
    ///
    /// Environment variable: `MUXPOOL_KEEP_ALIVE_INTERVAL_MS`
    #[arg(long, env = "MUXPOOL_KEEP_ALIVE_INTERVAL_MS", default_value_t = 30_000)]
    pub keep_alive_interval_ms: u64,

    /// How long to wait for a keep-alive ack, in milliseconds.
    ///
    /// Environment variable: `MUXPOOL_KEEP_ALIVE_TIMEOUT_MS`
    #[arg(long, env = "MUXPOOL_KEEP_ALIVE_TIMEOUT_MS", default_value_t = 10_000)]
    pub keep_alive_timeout_ms: u64,
}

#[cfg(feature = "clap")]
impl From<PoolArgs> for PoolConfig {
    fn from(args: PoolArgs) -> Self {
        Self::default()
            .with_pool_size(args.pool_size)
            .with_dial_timeout(Duration::from_millis(args.dial_timeout_ms))
            .with_keep_alive(
                Duration::from_millis(args.keep_alive_interval_ms),
                Duration::from_millis(args.keep_alive_timeout_ms),
            )
            .normalized()
    }
}
