//! A3S Dispatch CLI - send paced, retried requests to the search upstream.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use a3s_dispatch::{
    AnonymityController, CircuitControl, DispatchConfig, DispatchRequest, Dispatcher, Pacer,
    ProxyConfig, RequestContext,
};

/// A3S Dispatch - outbound search dispatch CLI
#[derive(Parser)]
#[command(name = "a3s-dispatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Route requests through the local anonymity network
    #[arg(long, global = true)]
    tor: bool,

    /// Upstream proxy (e.g., http://127.0.0.1:8080 or socks5://127.0.0.1:1080)
    #[arg(short, long, global = true)]
    proxy: Option<String>,

    /// Present a mobile browser identity
    #[arg(long, global = true)]
    mobile: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a search request and report the upstream response
    Search {
        /// Search query
        query: String,

        /// Print the response body instead of a summary
        #[arg(long)]
        raw: bool,
    },

    /// Fetch search suggestions as a JSON list
    Autocomplete {
        /// Partial query
        query: String,
    },

    /// Check the anonymity network: heartbeat, then validate the circuit
    Circuit,
}

#[derive(Serialize)]
struct CircuitReport {
    control_addr: String,
    reachable: bool,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = DispatchConfig::from_env();
    if cli.tor {
        config.anonymity.enabled = true;
    }
    if let Some(raw) = &cli.proxy {
        config.proxy = Some(ProxyConfig::parse(raw).context("invalid --proxy")?);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Search { query, raw } => run_search(&config, &query, raw, cli.mobile, cancel).await,
        Commands::Autocomplete { query } => run_autocomplete(&config, &query, cancel).await,
        Commands::Circuit => run_circuit(&config).await,
    }
}

fn build_dispatcher(config: &DispatchConfig) -> Result<Dispatcher> {
    let pacer = Arc::new(Pacer::new(config.retry.pacing));
    let context = Arc::new(RequestContext::new(config, None));
    let circuit: Option<Arc<dyn CircuitControl>> = if config.anonymity.enabled {
        Some(Arc::new(AnonymityController::from_config(&config.anonymity)?))
    } else {
        None
    };
    Ok(Dispatcher::new(config, context, pacer, circuit)?)
}

async fn run_search(
    config: &DispatchConfig,
    query: &str,
    raw: bool,
    mobile: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let dispatcher = build_dispatcher(config)?;
    let mut request = DispatchRequest::search(urlencoding::encode(query)).with_cancel(cancel);
    if mobile {
        request = request.force_mobile();
    }

    let response = dispatcher.send(&request).await?;
    if raw {
        println!("{}", response.body);
    } else {
        println!("Status: {}", response.status);
        println!("URL:    {}", response.url);
        println!("Body:   {} bytes", response.body.len());
        if !dispatcher.context().anonymity_enabled() && config.anonymity.enabled {
            eprintln!("Warning: anonymity network was disabled during this request");
        }
    }
    Ok(())
}

async fn run_autocomplete(config: &DispatchConfig, query: &str, cancel: CancellationToken) -> Result<()> {
    let dispatcher = build_dispatcher(config)?;
    let suggestions = dispatcher.autocomplete(query, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&suggestions)?);
    Ok(())
}

async fn run_circuit(config: &DispatchConfig) -> Result<()> {
    let controller = AnonymityController::from_config(&config.anonymity)?;

    controller.heartbeat().await;
    let reachable = controller.is_available();
    let (valid, error) = match controller.validate().await {
        Ok(valid) => (valid, None),
        Err(e) => (false, Some(e.to_string())),
    };

    let report = CircuitReport {
        control_addr: config.anonymity.control_addr.clone(),
        reachable,
        valid,
        error,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !valid {
        anyhow::bail!("anonymity circuit is not usable");
    }
    Ok(())
}
