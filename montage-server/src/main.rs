//! montage-server: authoritative track sync server.
//!
//! Usage:
//!   montage-server --bind 0.0.0.0:9090 --storage ./montage_data
//!
//! Without `--storage` tracks live in memory and are lost on exit.
//! Log level defaults to `info`; override with `RUST_LOG`.

use std::path::PathBuf;

use clap::Parser;
use log::info;
use montage_collab::{ServerConfig, SyncServer, DEFAULT_HISTORY_CAP};

#[derive(Parser, Debug)]
#[command(name = "montage-server")]
#[command(about = "Authoritative sync server for collaborative tracks")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; omit to keep tracks in memory
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Deltas kept per track for catch-up
    #[arg(long, default_value_t = DEFAULT_HISTORY_CAP)]
    history_cap: usize,

    /// Messages buffered per subscriber before it must resync
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

impl Args {
    fn server_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.broadcast_capacity,
            history_cap: self.history_cap,
            storage_path: self.storage,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().server_config();
    match &config.storage_path {
        Some(path) => info!("starting montage-server with storage at {}", path.display()),
        None => info!("starting montage-server in memory"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run().await {
        log::error!("server stopped: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let config = Args::try_parse_from(["montage-server"]).unwrap().server_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.history_cap, 1000);
        assert_eq!(config.broadcast_capacity, defaults.broadcast_capacity);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_flags() {
        let config = Args::try_parse_from([
            "montage-server",
            "--bind",
            "0.0.0.0:8080",
            "--storage",
            "/tmp/montage",
            "--history-cap",
            "50",
            "--broadcast-capacity",
            "32",
        ])
        .unwrap()
        .server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/montage")));
        assert_eq!(config.history_cap, 50);
        assert_eq!(config.broadcast_capacity, 32);
    }
}
