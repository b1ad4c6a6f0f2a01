//! glyphgate - image-recognition inference gateway

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glyphgate_runtime::admission::{sign_params, spawn_maintenance};
use glyphgate_runtime::default_engine;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use glyphgate_cli::api;
use glyphgate_cli::config::{Config, LoggingConfig};
use glyphgate_cli::{check_path, Gateway};

#[derive(Parser)]
#[command(name = "glyphgate")]
#[command(author = "Glyphgate Contributors")]
#[command(version)]
#[command(about = "glyphgate - image-recognition inference gateway", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "GLYPHGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Server port
        #[arg(short, long, env = "GLYPHGATE_PORT")]
        port: Option<u16>,

        /// Bind address
        #[arg(long, env = "GLYPHGATE_BIND")]
        bind: Option<String>,

        /// Directory of model descriptors
        #[arg(long, env = "GLYPHGATE_DESCRIPTOR_DIR")]
        descriptor_dir: Option<PathBuf>,

        /// Base directory for model artifacts
        #[arg(long, env = "GLYPHGATE_GRAPH_DIR")]
        graph_dir: Option<PathBuf>,

        /// Inference worker threads
        #[arg(short, long, env = "GLYPHGATE_WORKERS")]
        workers: Option<usize>,
    },

    /// Validate a descriptor file or every descriptor in a directory
    Check {
        /// Descriptor file or directory (defaults to the configured one)
        path: Option<PathBuf>,
    },

    /// Sign a request body for the authenticated endpoint
    Sign {
        /// Access key to embed
        #[arg(long)]
        access_key: String,

        /// Secret key to sign with
        #[arg(long, env = "GLYPHGATE_SECRET_KEY")]
        secret_key: String,

        /// JSON object with the request parameters
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Print an example configuration
    Config {
        /// Output format (yaml, toml)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Serve {
            port,
            bind,
            descriptor_dir,
            graph_dir,
            workers,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(dir) = descriptor_dir {
                config.models.descriptor_dir = dir;
            }
            if let Some(dir) = graph_dir {
                config.models.graph_dir = dir;
            }
            if workers.is_some() {
                config.server.workers = workers;
            }
            config.validate()?;

            init_logging(&config.logging)?;
            run_server(config).await?;
        }

        Commands::Check { path } => {
            let path = path.unwrap_or_else(|| config.models.descriptor_dir.clone());
            let outcomes = check_path(&path, &config.models.graph_dir)?;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(d) => println!(
                        "OK    {} ({} v{}, {})",
                        outcome.path.display(),
                        d.name,
                        d.version,
                        d.size_key()
                    ),
                    Err(e) => {
                        failed += 1;
                        println!("ERROR {}: {}", outcome.path.display(), e);
                    }
                }
            }
            println!("{} descriptors, {} invalid", outcomes.len(), failed);
            if failed > 0 {
                anyhow::bail!("{} invalid descriptors", failed);
            }
        }

        Commands::Sign {
            access_key,
            secret_key,
            params,
        } => {
            let mut params: Map<String, Value> =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            params.insert("accessKey".to_string(), Value::String(access_key));
            params
                .entry("timestamp")
                .or_insert_with(|| Value::String(chrono::Utc::now().timestamp().to_string()));
            let sign = sign_params(&params, &secret_key);
            params.insert("sign".to_string(), Value::String(sign));
            println!("{}", serde_json::to_string_pretty(&params)?);
        }

        Commands::Config { format } => match format.as_str() {
            "yaml" | "yml" => print!("{}", Config::example_yaml()),
            "toml" => print!("{}", Config::example_toml()),
            other => anyhow::bail!("Unknown format '{}', expected yaml or toml", other),
        },
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level '{}'", config.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

async fn run_server(config: Config) -> Result<()> {
    let descriptor_dir = &config.models.descriptor_dir;
    if !descriptor_dir.is_dir() {
        anyhow::bail!(
            "Descriptor directory {} does not exist",
            descriptor_dir.display()
        );
    }
    let bind_addr: std::net::IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;

    let engine = default_engine();
    let gateway = Gateway::build(&config, engine.clone());

    println!("glyphgate");
    println!("==================");
    println!("HTTP:        http://{}:{}/captcha/v1", bind_addr, config.server.port);
    println!("Descriptors: {}", descriptor_dir.display());
    println!("Graphs:      {}", config.models.graph_dir.display());
    println!("Engine:      {}", engine.name());
    println!("Workers:     {}", gateway.pool.workers());
    println!(
        "Rate Limit:  {}",
        if config.rate_limit.is_unlimited() {
            "disabled".to_string()
        } else {
            format!(
                "{} per address, {} global",
                config.rate_limit.address_limit, config.rate_limit.global_limit
            )
        }
    );
    println!();

    if config.auth.credentials.is_empty() {
        if let Some(credential) = gateway.state.verifier.credentials().first() {
            warn!(
                "No credentials configured, derived access key {}",
                credential.access_key
            );
        }
    }

    let baseline = gateway
        .watcher
        .initial_scan()
        .await
        .with_context(|| format!("scanning {}", descriptor_dir.display()))?;
    let watcher = gateway.watcher.clone().spawn(baseline);
    let maintenance = spawn_maintenance(gateway.limiter.clone());

    let routes = api::api_routes(gateway.state.clone());
    let (addr, server) = warp::serve(routes).try_bind_with_graceful_shutdown(
        (bind_addr, config.server.port),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        },
    )?;
    info!("Listening on {}", addr);
    server.await;

    info!("Shutting down");
    watcher.stop();
    for handle in maintenance {
        handle.abort();
    }
    gateway.pool.drain().await;
    let closed = gateway.registry.clear();
    info!("Closed {} models", closed);

    Ok(())
}
