//! Cuttle CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cuttle_core::{endpoint, Body, Pipeline, Request, Response};
use cuttle_scripting::{config, ModuleRegistry, ScriptHandler, ScriptRuntime};
use http_body_util::BodyExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cuttle")]
#[command(about = "Scripted HTTP handler stage", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a handler configuration and compile its script
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "handler.yaml")]
        config: PathBuf,
    },

    /// Run the handler once against a synthetic request and print the response
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "handler.yaml")]
        config: PathBuf,

        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request URI
        #[arg(short, long, default_value = "/")]
        uri: String,

        /// Request header as `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Log level (trace, debug, info, warn, error); script `log::*` calls included
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing_subscriber::fmt().with_target(false).init();

            tracing::info!("Validating handler configuration: {}", config.display());

            match validate(&config) {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::error!("✗ Handler validation failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Run {
            config,
            method,
            uri,
            headers,
            log_level,
        } => {
            init_tracing(&log_level)?;
            run(config, &method, &uri, &headers).await
        }

        Commands::Version => {
            println!("Cuttle scripted handler");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn validate(path: &Path) -> Result<()> {
    let config = config::load_from_file(path)?;
    let runtime = ScriptRuntime::new(&config, ModuleRegistry::standard());
    let program = runtime
        .load(&config.handler_path)
        .with_context(|| format!("compiling {}", config.script_name()))?;

    tracing::info!("✓ Handler configuration is valid");
    tracing::info!("  Script: {}", program.name());
    tracing::info!("  Constants: {}", program.constants());
    tracing::info!("  Cached: {}", config.cache_compiled_script);
    tracing::info!(
        "  Imports: {}",
        config
            .import_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "registry only".to_string())
    );
    Ok(())
}

async fn run(path: PathBuf, method: &str, uri: &str, headers: &[String]) -> Result<()> {
    let config = config::load_from_file(&path)?;
    let handler = ScriptHandler::provision(config, ModuleRegistry::standard()).await?;

    let mut builder = Request::builder().method(method).uri(uri);
    for header in headers {
        let Some((name, value)) = header.split_once(':') else {
            bail!("header '{}' is not in `Name: value` form", header);
        };
        builder = builder.header(name.trim(), value.trim());
    }
    let req = builder.body(Body::default())?;

    let pipeline = Pipeline::new(endpoint(|_req| async {
        tracing::debug!("Request reached the end of the pipeline");
        Ok(Response::new(Body::default()))
    }))
    .stage(Arc::new(handler));

    let res = match pipeline.handle(req).await {
        Ok(res) => res,
        Err(e) => {
            tracing::error!(status = e.to_status_code().as_u16(), "Script failed: {}", e);
            std::process::exit(1);
        }
    };

    let (parts, body) = res.into_parts();
    println!("{:?} {}", parts.version, parts.status);
    for (name, value) in &parts.headers {
        println!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    println!();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(never) => match never {},
    };
    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(filter.into()))
        .init();

    Ok(())
}
