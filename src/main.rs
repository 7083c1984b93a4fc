// Copyright 2024 Prism Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use prism::config::{Config, StoreBackend};
use prism::gateway::{ApiGateway, GatewayBuilder};
use prism::metrics::PrometheusMetrics;
use prism::server::GatewayServer;

/// Prism - request-routing and traffic-control core for an API gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level, overridden by RUST_LOG
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    info!("Starting Prism gateway...");

    // Load configuration
    let config = match Config::from_file(&args.config).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => {
            info!(
                "Configuration loaded from {} ({} routes)",
                args.config,
                config.routes.len()
            );
            Arc::new(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return Err(e);
        }
    };

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args.config, config))
}

async fn run(config_path: String, config: Arc<Config>) -> Result<()> {
    let metrics = if config.metrics.prometheus {
        Some(Arc::new(PrometheusMetrics::new()?))
    } else {
        None
    };

    let mut builder = ApiGateway::builder(config.clone());
    if let Some(metrics) = &metrics {
        builder = builder.metric_sink(metrics.clone());
    }
    let builder = with_store(builder, &config).await?;
    let gateway = Arc::new(builder.build()?);

    info!("Prism initialized with {} routes", gateway.route_count());

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(gateway.clone(), config_path));
    #[cfg(not(unix))]
    let _ = config_path;

    GatewayServer::new(gateway, metrics)
        .run(shutdown_signal())
        .await
}

#[cfg(feature = "redis")]
async fn with_store(builder: GatewayBuilder, config: &Config) -> Result<GatewayBuilder> {
    use anyhow::{anyhow, Context};
    use prism::store::RedisStore;

    if config.store.backend != StoreBackend::Redis {
        return Ok(builder);
    }

    let url = config
        .store
        .redis_url
        .as_deref()
        .ok_or_else(|| anyhow!("store.redis_url is required when store.backend is redis"))?;
    let store = Arc::new(
        RedisStore::connect(url)
            .await
            .context("Failed to connect to Redis store")?,
    );

    Ok(builder.counter_store(store.clone()).cache_store(store))
}

#[cfg(not(feature = "redis"))]
async fn with_store(builder: GatewayBuilder, config: &Config) -> Result<GatewayBuilder> {
    if config.store.backend == StoreBackend::Redis {
        anyhow::bail!("store.backend is redis but Prism was built without the `redis` feature");
    }
    Ok(builder)
}

/// Re-read the config file on SIGHUP and swap in its routes
#[cfg(unix)]
async fn reload_on_hangup(gateway: Arc<ApiGateway>, config_path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to register SIGHUP handler, reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading routes from {}", config_path);
        match Config::from_file(&config_path).and_then(|c| gateway.reload(&c.routes)) {
            Ok(()) => info!("Route snapshot replaced ({} routes)", gateway.route_count()),
            Err(e) => error!("Reload rejected, keeping current routes: {:#}", e),
        }
    }
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C elsewhere)
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers, using Ctrl+C only: {}", e);
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}
