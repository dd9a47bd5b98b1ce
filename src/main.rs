use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod cluster;
mod config;
mod config_secret_controller;
mod error;
mod executor;
mod fetcher;
mod fscache;
mod http_objects;
mod newdeploy;
mod podspec;
mod poolmgr;
mod rbac;
mod reaper;
mod routes;
mod service;
mod throttler;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod integration_test;
#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::ServerConfig::from_path(&path.to_string_lossy()),
        None => config::ServerConfig::from_env(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {err:?}");
            std::process::exit(1);
        }
    };
    // Pin the id so every component and the root span agree on it.
    let instance_id = config.instance_id();
    config.instance_id = Some(instance_id.clone());

    if let Err(err) = setup_tracing(&config) {
        eprintln!("Error setting up tracing: {err:?}");
    }

    let root_span = info_span!("executor", env = config.env, instance_id);
    let _guard = root_span.enter();

    let service = Service::new(config).await;
    let mut service = match service {
        Ok(service) => service,
        Err(err) => {
            error!("Error creating service: {:?}", err);
            return;
        }
    };
    if let Err(err) = service.start().await {
        error!("Error starting service: {:?}", err);
    }
}
