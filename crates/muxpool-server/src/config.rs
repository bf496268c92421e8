use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use muxpool::{Headers, PoolArgs, PoolConfig, retry::RetryConfig};
use tonic::codec::CompressionEncoding;
#[cfg(feature = "tls")]
use std::path::PathBuf;

/// Runtime configuration for the `muxpool-server` binary.
///
/// Every field is parsed from a CLI flag or its environment variable. A `.env`
/// file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "muxpool-server",
    version,
    about = "A gRPC server exposing health checking and reflection"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/muxpool.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Serve the gRPC reflection service.
    ///
    /// Environment variable: `ENABLE_REFLECTION`
    #[arg(long, env = "ENABLE_REFLECTION", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_reflection: bool,

    /// Serve the `grpc.health.v1.Health` service.
    ///
    /// Environment variable: `ENABLE_HEALTH`
    #[arg(long, env = "ENABLE_HEALTH", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_health: bool,

    /// Service names reported as `SERVING` in addition to the server as a
    /// whole (the empty name). Comma separated.
    ///
    /// Environment variable: `HEALTH_SERVICES`
    #[arg(long, env = "HEALTH_SERVICES", value_delimiter = ',')]
    pub health_services: Vec<String>,

    /// Record per-RPC request counts and handling times. Exported only when
    /// built with the `metrics` feature.
    ///
    /// Environment variable: `ENABLE_METRICS`
    #[arg(long, env = "ENABLE_METRICS", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_metrics: bool,

    /// Compression accepted and sent by the built-in services: `gzip`,
    /// `zstd` or `none`.
    ///
    /// Environment variable: `COMPRESSION`
    #[arg(long, env = "COMPRESSION", default_value_t = String::from("none"))]
    pub compression: String,

    /// Interval between HTTP/2 keep-alive pings sent to clients, in
    /// milliseconds. Zero disables pings.
    ///
    /// Environment variable: `KEEP_ALIVE_INTERVAL_MS`
    #[arg(long, env = "KEEP_ALIVE_INTERVAL_MS", default_value_t = 30_000)]
    pub keep_alive_interval_ms: u64,

    /// How long to wait for a ping ack before closing the connection, in
    /// milliseconds.
    ///
    /// Environment variable: `KEEP_ALIVE_TIMEOUT_MS`
    #[arg(long, env = "KEEP_ALIVE_TIMEOUT_MS", default_value_t = 10_000)]
    pub keep_alive_timeout_ms: u64,

    /// PEM certificate chain presented to clients.
    ///
    /// Environment variable: `TLS_CERT`
    #[cfg(feature = "tls")]
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `TLS_CERT`.
    ///
    /// Environment variable: `TLS_KEY`
    #[cfg(feature = "tls")]
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// PEM CA bundle. When set, clients must present a certificate signed by
    /// it.
    ///
    /// Environment variable: `TLS_CLIENT_CA`
    #[cfg(feature = "tls")]
    #[arg(long, env = "TLS_CLIENT_CA", requires = "tls_cert")]
    pub tls_client_ca: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub enable_reflection: bool,
    pub enable_health: bool,
    pub health_services: Vec<String>,
    pub enable_metrics: bool,
    pub compression: Option<CompressionEncoding>,
    /// `None` disables keep-alive pings.
    pub keep_alive: Option<(Duration, Duration)>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsPaths>,
}

/// File locations of the server identity and, for mutual TLS, the client CA.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: Option<PathBuf>,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.server_addr.trim().is_empty() {
            bail!("SERVER_ADDR must not be empty");
        }

        if !args.uds && args.server_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!(
                "SERVER_ADDR ({}) is not a socket address; pass --uds to listen on a Unix socket",
                args.server_addr
            );
        }

        let keep_alive = if args.keep_alive_interval_ms == 0 {
            None
        } else {
            if args.keep_alive_timeout_ms == 0 {
                bail!("KEEP_ALIVE_TIMEOUT_MS must be greater than 0 when keep-alive is enabled");
            }
            Some((
                Duration::from_millis(args.keep_alive_interval_ms),
                Duration::from_millis(args.keep_alive_timeout_ms),
            ))
        };

        let health_services = args
            .health_services
            .into_iter()
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();

        #[cfg(feature = "tls")]
        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert,
                key,
                client_ca: args.tls_client_ca,
            }),
            (None, None) => None,
            _ => bail!("TLS_CERT and TLS_KEY must be set together"),
        };

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            enable_reflection: args.enable_reflection,
            enable_health: args.enable_health,
            health_services,
            enable_metrics: args.enable_metrics,
            compression: parse_compression(&args.compression)?,
            keep_alive,
            #[cfg(feature = "tls")]
            tls,
        })
    }
}

/// Runtime configuration for the `muxpool-check` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "muxpool-check",
    version,
    about = "Checks gRPC health endpoints through a muxpool connection pool"
)]
pub struct CheckArgs {
    /// Endpoint to check, `host:port`.
    ///
    /// Environment variable: `CHECK_ENDPOINT`
    #[arg(long, env = "CHECK_ENDPOINT", default_value_t = String::from("127.0.0.1:50051"))]
    pub endpoint: String,

    /// Service whose health to query. Repeatable; without it the server as a
    /// whole is checked.
    #[arg(long = "service")]
    pub services: Vec<String>,

    /// Header sent with every check, `key=value`. Repeatable.
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Attempts per check, the first one included.
    ///
    /// Environment variable: `CHECK_RETRIES`
    #[arg(long, env = "CHECK_RETRIES", default_value_t = muxpool::retry::DEFAULT_ATTEMPTS)]
    pub retries: u32,

    /// Pause between attempts, in milliseconds.
    ///
    /// Environment variable: `CHECK_RETRY_DELAY_MS`
    #[arg(long, env = "CHECK_RETRY_DELAY_MS", default_value_t = 3_000)]
    pub retry_delay_ms: u64,

    /// Deadline of a single check, in milliseconds.
    ///
    /// Environment variable: `CHECK_TIMEOUT_MS`
    #[arg(long, env = "CHECK_TIMEOUT_MS", default_value_t = 5_000)]
    pub timeout_ms: u64,

    #[command(flatten)]
    pub pool: PoolArgs,
}

#[derive(Debug, Clone)]
pub struct CheckConfig {
    pub endpoint: String,
    /// Never empty; `""` stands for the server as a whole.
    pub services: Vec<String>,
    pub headers: Headers,
    pub retry: RetryConfig,
    pub timeout: Duration,
    pub pool: PoolConfig,
}

impl TryFrom<CheckArgs> for CheckConfig {
    type Error = anyhow::Error;

    fn try_from(args: CheckArgs) -> Result<Self, Self::Error> {
        if args.endpoint.trim().is_empty() {
            bail!("CHECK_ENDPOINT must not be empty");
        }
        if args.retries == 0 {
            bail!("CHECK_RETRIES must be greater than 0");
        }
        if args.timeout_ms == 0 {
            bail!("CHECK_TIMEOUT_MS must be greater than 0");
        }

        let services = if args.services.is_empty() {
            vec![String::new()]
        } else {
            args.services
        };

        Ok(Self {
            endpoint: args.endpoint,
            services,
            headers: args.headers.into_iter().collect(),
            retry: RetryConfig::new(args.retries, Duration::from_millis(args.retry_delay_ms)),
            timeout: Duration::from_millis(args.timeout_ms),
            pool: args.pool.into(),
        })
    }
}

/// Parses a compression name; `none` turns compression off.
pub fn parse_compression(raw: &str) -> anyhow::Result<Option<CompressionEncoding>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "none" | "" => Ok(None),
        "gzip" => Ok(Some(CompressionEncoding::Gzip)),
        "zstd" => Ok(Some(CompressionEncoding::Zstd)),
        other => bail!("unsupported compression `{other}`; expected gzip, zstd or none"),
    }
}

/// Parses `key=value`. The key is trimmed; the value is kept verbatim.
pub fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("header `{raw}` is not `key=value`"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("header `{raw}` has an empty key");
    }
    Ok((key.to_owned(), value.to_owned()))
}
