//! Skein CLI - run a demo provider, call services, probe providers.

mod demo;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::Value;
use skein_core::{
    probe, ConnectionConfig, Consumer, ConsumerConfig, Discovery, FileDiscovery, MemoryDiscovery,
    Monitor, MonitorConfig, Provider, ProviderConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "skein")]
#[command(about = "Lightweight RPC provider, consumer and health probe")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo echo service until Ctrl-C
    Serve(ServeArgs),
    /// Call a method on a service
    Call(CallArgs),
    /// Send a health probe to one provider address
    Probe(ProbeArgs),
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "8090")]
    port: u16,

    /// Host published to discovery (defaults to the bound address)
    #[arg(long)]
    advertise_host: Option<String>,

    /// Service version
    #[arg(long, default_value = "0.0.1")]
    version: String,

    /// Shared registry file (in-process registry when omitted)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Publish this collector address as the monitoring center
    #[arg(long)]
    center: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct CallArgs {
    /// Interface name
    #[arg(short, long, default_value = demo::INTERFACE)]
    interface: String,

    /// Service version
    #[arg(long, default_value = "0.0.1")]
    version: String,

    /// Method name; the signature is derived from the parameter count
    method: String,

    /// Parameters as JSON values (bare words are sent as strings)
    params: Vec<String>,

    /// Shared registry file to resolve providers from
    #[arg(long, conflicts_with = "address")]
    registry: Option<PathBuf>,

    /// Call this provider address directly
    #[arg(long)]
    address: Option<String>,

    /// Call timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Report the call duration to this collector URL
    #[arg(long)]
    collector: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct ProbeArgs {
    /// Provider address (host:port)
    address: String,

    /// Probe timeout in milliseconds
    #[arg(long, default_value = "3000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve(serve) => run_serve(serve).await,
        Command::Call(call) => run_call(call).await,
        Command::Probe(probe_args) => run_probe(probe_args).await,
    }
}

fn open_discovery(registry: Option<PathBuf>) -> Arc<dyn Discovery> {
    match registry {
        Some(path) => {
            info!("Using registry file {}", path.display());
            Arc::new(FileDiscovery::new(path))
        }
        None => Arc::new(MemoryDiscovery::new()),
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let discovery = open_discovery(args.registry);
    if let Some(center) = &args.center {
        discovery.register_center(center).await?;
    }

    let mut config = ProviderConfig::default()
        .with_bind_host(args.host)
        .with_port(args.port)
        .with_version(args.version);
    if let Some(host) = args.advertise_host {
        config = config.with_advertise_host(host);
    }

    let mut handle = Provider::serve(config, vec![demo::echo_service()], Arc::clone(&discovery))
        .await
        .context("failed to start provider")?;

    // Scripts read the advertised address from stdout
    println!("SKEIN_ADDRESS={}", handle.address());
    info!("Serving {:?} on {}", handle.services(), handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");

    handle.stop().await?;
    if args.center.is_some() {
        if let Err(e) = discovery.unregister_center().await {
            warn!("Failed to clear monitoring center: {}", e);
        }
    }
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let discovery: Arc<dyn Discovery> = match (&args.address, args.registry) {
        (Some(address), _) => {
            let memory = MemoryDiscovery::new();
            let service = skein_core::naming::service_name(&args.interface, &args.version);
            memory.register(&service, address).await?;
            Arc::new(memory)
        }
        (None, Some(path)) => Arc::new(FileDiscovery::new(path)),
        (None, None) => bail!("either --address or --registry is required"),
    };

    let monitor = match &args.collector {
        Some(url) => Monitor::new(MonitorConfig::enabled().with_collector_url(url.clone())),
        None => Monitor::disabled(),
    };
    let reporter = if monitor.is_enabled() {
        Some(monitor.spawn_reporter(None)?)
    } else {
        None
    };

    let timeout = Duration::from_millis(args.timeout_ms);
    let consumer = Consumer::new(ConsumerConfig::default(), discovery).with_monitor(monitor);
    let stub = consumer
        .consume(&args.interface, &args.version)
        .await?
        .with_timeout(timeout);

    let params: Vec<Value> = args.params.iter().map(|raw| parse_param(raw)).collect();
    let connected = match consumer.pool().select(stub.service()) {
        Ok(conn) => {
            conn.wait_for_state(skein_core::ConnectionState::Connected, timeout)
                .await
        }
        Err(_) => false,
    };
    if !connected {
        warn!("No connected provider for {} yet", stub.service());
    }

    let outcome = stub.invoke(&args.method, params).await;
    consumer.shutdown();
    if let Some(reporter) = reporter {
        reporter.stop().await;
    }

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    let timeout = Duration::from_millis(args.timeout_ms);
    let rtt = probe(&args.address, ConnectionConfig::default(), timeout)
        .await
        .with_context(|| format!("health probe of {} failed", args.address))?;
    println!("{} ok in {:?}", args.address, rtt);
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("42"), json!(42));
        assert_eq!(parse_param("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_param("\"quoted\""), json!("quoted"));
        assert_eq!(parse_param("bare"), json!("bare"));
    }

    #[test]
    fn test_cli_parses_call() {
        let args = Args::parse_from([
            "skein", "call", "add", "1", "2", "--address", "127.0.0.1:8090",
        ]);
        match args.command {
            Command::Call(call) => {
                assert_eq!(call.method, "add");
                assert_eq!(call.params, vec!["1", "2"]);
                assert_eq!(call.interface, demo::INTERFACE);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
