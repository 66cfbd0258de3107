use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use hospital_gateway::{
    adapters::{HealthAggregator, HttpClientAdapter, HttpHandler, build_router},
    config::{GatewayConfig, GatewayConfigValidator, loader::load_config_sync},
    core::{Dispatcher, GatewayService},
    metrics,
    ports::{Clock, HttpClient, SystemClock},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};
use metrics_exporter_prometheus::PrometheusBuilder;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration (file plus GATEWAY__* environment overrides)
    Validate {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config),
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config_sync(config_path)
        .map_err(|e| eyre!("Failed to load configuration from {config_path}: {e}"))?;
    GatewayConfigValidator::validate(&config).context("Invalid gateway configuration")?;

    tracing_setup::init_for_format(config.observability.log_format)
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already; continuing.",
            e
        );
    }

    install_metrics_exporter(&config)?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {e}"))?;

    let config = Arc::new(config);
    let gateway_service =
        Arc::new(GatewayService::new(config.clone()).context("Failed to build service routes")?);

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let dispatcher = Arc::new(Dispatcher::from_config(&config, http_client.clone(), clock));
    let health = Arc::new(HealthAggregator::new(
        gateway_service.clone(),
        http_client.clone(),
    ));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());

    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let health_task = {
        let health = health.clone();
        let health_config = config.health_check.clone();
        let token = graceful_shutdown.token();
        tokio::spawn(async move { health.run(&health_config, token).await })
    };

    let handler = Arc::new(HttpHandler::new(
        gateway_service.clone(),
        dispatcher,
        health,
        graceful_shutdown.token(),
    ));
    let app = build_router(handler);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(
        %addr,
        services = gateway_service.service_count(),
        "Hospital gateway listening"
    );

    let shutdown_for_server = graceful_shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = shutdown_for_server.wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received: {:?}", reason);
    });

    let drain_timeout = graceful_shutdown.drain_timeout();
    let server_result = tokio::select! {
        result = server => result.context("Server error"),
        _ = async {
            graceful_shutdown.token().cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            tracing::warn!(?drain_timeout, "In-flight requests did not drain in time");
            Ok(())
        }
    };

    graceful_shutdown.trigger(ShutdownReason::Requested);
    if let Err(e) = health_task.await {
        tracing::warn!("Health aggregator task ended abnormally: {}", e);
    }

    tracing::info!("Graceful shutdown completed");
    server_result
}

fn install_metrics_exporter(config: &GatewayConfig) -> Result<()> {
    let Some(metrics_addr) = config.observability.metrics_addr.as_deref() else {
        tracing::info!("Prometheus exporter disabled (no metrics_addr configured)");
        return Ok(());
    };

    let addr: SocketAddr = metrics_addr
        .parse()
        .with_context(|| format!("Invalid metrics address: {metrics_addr}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| eyre!("Failed to install Prometheus exporter on {addr}: {e}"))?;

    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Validate configuration and exit
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration: {config_path}");

    if !Path::new(config_path).exists() {
        println!("ℹ️  '{config_path}' not found, validating environment variables only");
    }

    let config = match load_config_sync(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            let mut names: Vec<&String> = config.services.keys().collect();
            names.sort();
            for name in names {
                let service = &config.services[name];
                println!("   • Service {name}: {} → {}", service.prefix, service.base_url);
            }
            println!(
                "   • Retries: {} attempts (GET/HEAD only)",
                config.retry.max_attempts
            );
            println!(
                "   • Breaker: trips at {}% over {} samples",
                config.circuit_breaker.failure_threshold_percent,
                config.circuit_breaker.minimum_samples
            );
            println!("   • Cache Enabled: {}", config.cache.enabled);
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure every base_url starts with http:// or https://");
            println!("   • Give each service a distinct prefix such as '/admin'");
            println!("   • Keep timeouts.gateway_ms above max_attempts x upstream_ms plus backoff");
            println!("   • Verify listen address format (e.g., '0.0.0.0:3000')");
            std::process::exit(1);
        }
    }
}

/// Write a starter configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Hospital gateway configuration
# Every value can be overridden with GATEWAY__<SECTION>__<KEY>, e.g.
# GATEWAY__SERVICES__ADMIN__BASE_URL=http://admin-service:3001

listen_addr = "0.0.0.0:3000"
max_body_bytes = 2097152

[services.admin]
prefix = "/admin"
base_url = "http://localhost:3001"

[services.medico]
prefix = "/medico"
base_url = "http://localhost:3002"
health_paths = ["/api/health", "/health"]

[timeouts]
upstream_ms = 5000
gateway_ms = 20000

[retry]
max_attempts = 3
base_delay_ms = 250
max_delay_ms = 5000
jitter_ratio = 0.0

[circuit_breaker]
window_ms = 60000
failure_threshold_percent = 50
minimum_samples = 5
half_open_after_ms = 30000

[cache]
enabled = true
capacity = 100
fresh_ttl_ms = 60000
stale_ttl_ms = 300000
max_entry_bytes = 102400

[health_check]
enabled = true
interval_secs = 30
timeout_ms = 2000

[observability]
log_format = "pretty"
# metrics_addr = "0.0.0.0:9100"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'hospital-gateway serve --config {config_path}' to start the gateway");
    Ok(())
}
