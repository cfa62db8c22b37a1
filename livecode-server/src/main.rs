//! livecode relay server.
//!
//! Serves the realtime WebSocket relay and the session discovery API:
//!
//! ```text
//! livecode-server --config relay.toml --bind 0.0.0.0:9090 --http 0.0.0.0:9091
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;

use livecode_collab::config::ServerConfig;
use livecode_collab::server::SyncServer;

#[derive(Parser, Debug)]
#[command(name = "livecode-server", version, about = "Real-time collaborative editing relay")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "LIVECODE_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket listen address
    #[arg(short, long, env = "LIVECODE_BIND")]
    bind: Option<String>,

    /// Discovery API listen address
    #[arg(long, env = "LIVECODE_HTTP", conflicts_with = "no_http")]
    http: Option<String>,

    /// Disable the discovery API
    #[arg(long)]
    no_http: bool,

    /// Execution timeout in seconds
    #[arg(long)]
    exec_timeout: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if self.no_http {
            config.http_addr = None;
        } else if let Some(http) = self.http {
            config.http_addr = Some(http);
        }
        if let Some(secs) = self.exec_timeout {
            config.execution.timeout_secs = secs;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    info!(
        "Starting livecode relay (max {} peers per session, {}s execution timeout)",
        config.max_peers_per_session, config.execution.timeout_secs
    );

    let server = SyncServer::with_process_executor(config);
    tokio::select! {
        result = server.run() => result.context("relay stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "livecode-server",
            "--bind",
            "0.0.0.0:7000",
            "--no-http",
            "--exec-timeout",
            "3",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.http_addr, None);
        assert_eq!(config.execution.timeout_secs, 3);
    }

    #[test]
    fn test_http_override() {
        let args = Args::parse_from(["livecode-server", "--http", "0.0.0.0:7001"]);
        let config = args.into_config().unwrap();
        assert_eq!(config.http_addr.as_deref(), Some("0.0.0.0:7001"));
        assert_eq!(config.bind_addr, ServerConfig::default().bind_addr);
    }
}
