use clap::Parser;
use futures::Stream;
use muxpool_server::{
    GrpcServer, ServerBuilder,
    config::{CliArgs, ServerConfig},
    shutdown_signal,
    telemetry::{TelemetryProviders, init_telemetry},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Connected;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry("muxpool-server")?;
    let server = build_server(&config)?;

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&uds_path, &config);
            let res = run_server_with_incoming(providers, server, incoming).await;
            // A panic can still leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp_path = config.server_addr.clone();
        let tcp = TcpListener::bind(&tcp_path).await?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&tcp_path, &config);
        run_server_with_incoming(providers, server, incoming).await
    }
}

fn build_server(config: &ServerConfig) -> anyhow::Result<GrpcServer> {
    let mut builder = ServerBuilder::new().health_services(config.health_services.iter().cloned());
    if config.enable_health {
        builder = builder.enable_health();
    }
    if config.enable_reflection {
        builder = builder.enable_reflection();
    }
    if config.enable_metrics {
        builder = builder.enable_metrics();
    }
    if let Some(encoding) = config.compression {
        builder = builder.compression(encoding);
    }
    if let Some((interval, timeout)) = config.keep_alive {
        builder = builder.keep_alive(interval, timeout);
    }

    #[cfg(feature = "tls")]
    if let Some(tls) = &config.tls {
        use anyhow::Context;

        let cert = std::fs::read(&tls.cert)
            .with_context(|| format!("reading TLS_CERT {}", tls.cert.display()))?;
        let key = std::fs::read(&tls.key)
            .with_context(|| format!("reading TLS_KEY {}", tls.key.display()))?;
        let client_ca = tls
            .client_ca
            .as_ref()
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("reading TLS_CLIENT_CA {}", path.display()))
            })
            .transpose()?;
        builder = builder.tls(&cert, &key, client_ca.as_deref());
    }

    builder.build()
}

async fn run_server_with_incoming<I, IO, IE>(
    providers: TelemetryProviders,
    server: GrpcServer,
    incoming: I,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let res = server
        .serve_with_incoming_shutdown(incoming, shutdown_signal())
        .await;

    #[cfg(feature = "tracing")]
    match &res {
        Ok(()) => tracing::info!("Server shut down successfully"),
        Err(err) => tracing::error!("Server stopped with an error: {:?}", err),
    }

    providers.shutdown();
    res
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting gRPC server on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting gRPC server on {} (health: {}, reflection: {}, metrics: {})",
            _addr,
            _config.enable_health,
            _config.enable_reflection,
            _config.enable_metrics
        );
    }
}
