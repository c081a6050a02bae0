use anyhow::Result;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Miner address as `host` or `host:port`. None disables polling and the
    /// log stream (attach attempts are rejected).
    pub miner_host: Option<String>,
    pub poll_interval_ms: u64,
    pub max_history: usize,
    pub persist_min_interval_ms: u64,
    pub history_dir: PathBuf,
    pub listen_host: String,
    pub listen_port: u16,
    pub explorer_api_base: Option<String>,
    pub explorer_poll_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let miner_host = env::var("MINER_HOST")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let poll_interval_ms = env::var("MINER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(5_000);
        let max_history = env::var("MINER_MAX_HISTORY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(2_880);
        let persist_min_interval_ms = env::var("MINER_PERSIST_MIN_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30_000);
        let history_dir = env::var("MINER_HISTORY_DIR")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("history"));

        let listen_host = env::var("MINER_LISTEN_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listen_port = env::var("MINER_LISTEN_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(7870);

        let explorer_api_base = match env::var("MINER_EXPLORER_API_BASE") {
            Ok(value) => {
                let trimmed = value.trim().trim_end_matches('/').to_string();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed)
                }
            }
            Err(_) => Some("https://mempool.space/api".to_string()),
        };
        let explorer_poll_interval_ms = env::var("MINER_EXPLORER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(60_000);

        Ok(Self {
            miner_host,
            poll_interval_ms,
            max_history,
            persist_min_interval_ms,
            history_dir,
            listen_host,
            listen_port,
            explorer_api_base,
            explorer_poll_interval_ms,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn persist_min_interval(&self) -> Duration {
        Duration::from_millis(self.persist_min_interval_ms)
    }

    pub fn explorer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.explorer_poll_interval_ms)
    }

    /// Websocket address of the miner's live event log, when a miner is
    /// configured.
    pub fn miner_ws_url(&self) -> Option<String> {
        self.miner_host
            .as_deref()
            .map(|host| format!("ws://{host}/api/ws"))
    }
}
