use std::path::PathBuf;

use clap::{Parser, Subcommand};

use weft::config;
use weft::core::{RpcError, UserId};
use weft::server::{
    CallContext, CallOutcome, LogTxn, RpcHandler, SyncServer, SyncServerConfig, UpdateLog,
};
use weft::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "weft",
    version,
    about = "Realtime state synchronization engine",
    arg_required_else_help = true
)]
struct Cli {
    /// Config file (TOML).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync server.
    Serve {
        /// Listen address; overrides the config file.
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },
}

/// Token-only placeholder surface: accepts `user:<id>` credentials and
/// rejects every method. Real deployments embed the engine and register
/// their own handler.
struct NullHandler;

impl RpcHandler for NullHandler {
    fn authenticate(&mut self, token: &str) -> Result<UserId, RpcError> {
        token
            .strip_prefix("user:")
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(UserId::new)
            .ok_or_else(|| RpcError::unauthorized("unrecognized token"))
    }

    fn interests(&self, _user_id: UserId) -> Vec<weft::UpdateKey> {
        Vec::new()
    }

    fn handle(
        &mut self,
        _ctx: &CallContext,
        method: &str,
        _input: &[u8],
        _txn: &mut LogTxn<'_>,
    ) -> Result<CallOutcome, RpcError> {
        Err(RpcError::method_not_found(method))
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config load failed: {e}");
            std::process::exit(1);
        }
    };
    telemetry::init(cli.verbose, &config.logging);

    match cli.command {
        Command::Serve { listen } => {
            let server_config = SyncServerConfig {
                listen_addr: listen.unwrap_or(config.server.listen_addr),
                limits: config.limits,
                heartbeat_window_ms: config.server.heartbeat_window_ms,
                sweep_interval_ms: config.server.sweep_interval_ms,
            };
            let handle = match SyncServer::start(
                server_config,
                Box::new(NullHandler),
                UpdateLog::in_memory(),
            ) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!("failed to start server: {e}");
                    std::process::exit(1);
                }
            };

            tracing::info!(addr = %handle.local_addr(), "serving; Ctrl-C to stop");
            // Foreground server: park until the process is killed.
            loop {
                std::thread::park();
            }
        }
    }
}
