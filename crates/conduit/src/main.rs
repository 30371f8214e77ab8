//! Conduit
//!
//! Runs a script bundle against the built-in native modules.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use conduit::{BridgeConfig, Host};
use conduit_bridge::ConfigStyle;

/// Conduit bridge host
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "Batched call bridge host", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "conduit.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a bundle and run it until idle
    Run {
        /// Bundle to load; overrides `bridge.bundle_url`
        bundle: Option<String>,

        /// Script call to make once loaded, as `Module.method` or
        /// `Module.method:[json args]`. May be repeated.
        #[arg(long = "call")]
        calls: Vec<String>,

        /// Inject the minimal module configuration
        #[arg(long)]
        minimal_config: bool,

        /// How long to let work settle after the last call, in milliseconds
        #[arg(long, default_value = "200")]
        settle_ms: u64,

        /// Keep running until interrupted
        #[arg(long)]
        keep_alive: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conduit=info,conduit_bridge=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = BridgeConfig::load_or_default(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    match args.command {
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            bundle,
            calls,
            minimal_config,
            settle_ms,
            keep_alive,
        } => {
            let mut config = config;
            if let Some(bundle) = bundle {
                config.bridge.bundle_url = bundle;
            }
            if minimal_config {
                config.bridge.config_style = ConfigStyle::Minimal;
            }
            run(config, calls, Duration::from_millis(settle_ms), keep_alive).await
        }
    }
}

/// Split `Module.method:[args]` into target and arguments.
fn parse_call(call: &str) -> Result<(String, Vec<Value>)> {
    let (target, args) = match call.split_once(':') {
        Some((target, args)) => (target, args),
        None => (call, "[]"),
    };
    let args = match serde_json::from_str(args).with_context(|| format!("Invalid arguments for {}", target))? {
        Value::Array(args) => args,
        _ => bail!("Arguments for {} must be a JSON array", target),
    };
    Ok((target.to_string(), args))
}

async fn run(config: BridgeConfig, calls: Vec<String>, settle: Duration, keep_alive: bool) -> Result<ExitCode> {
    let calls = calls
        .iter()
        .map(|call| parse_call(call))
        .collect::<Result<Vec<_>>>()?;

    let root = std::env::current_dir()?;
    let host = Host::new(&config, root)?;
    let bridge = host.bridge();

    info!("Starting conduit v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = bridge.start().await {
        error!("Bundle failed to load: {}", e);
        return Ok(ExitCode::FAILURE);
    }

    for (target, args) in calls {
        if let Err(e) = bridge.enqueue_call(&target, args) {
            warn!("Call {} rejected: {}", target, e);
        }
    }

    if keep_alive {
        info!("Running, press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::time::sleep(settle).await;
    }

    let errored = bridge.has_errored();
    info!(views = host.views().len(), "Shutting down");
    bridge.invalidate().await;

    Ok(if errored { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_call() {
        let (target, args) = parse_call("AppRegistry.runApplication:[1,\"a:b\"]").unwrap();
        assert_eq!(target, "AppRegistry.runApplication");
        assert_eq!(args, vec![json!(1), json!("a:b")]);

        assert_eq!(parse_call("App.ping").unwrap().1, Vec::<Value>::new());
        assert!(parse_call("App.ping:{}").is_err());
        assert!(parse_call("App.ping:[").is_err());
    }
}
