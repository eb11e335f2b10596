/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 17300;
pub const DEFAULT_FIRST_CONTACT_TEXT: &str = "Hello, is this still available?";

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Id of the logged-in user
    pub viewer_id: String,

    /// Display name recorded on conversations the viewer starts
    pub viewer_name: String,

    /// Data directory for the local backend (defaults to `.chatsync/<viewer>`)
    pub data_dir: Option<PathBuf>,

    /// UI API address
    pub api_addr: SocketAddr,

    /// First retry delay for subscriptions and snapshot fetches
    pub retry_initial: Duration,

    /// Retry delay ceiling
    pub retry_max: Duration,

    /// Attempts before a transport error is surfaced to the caller
    pub max_attempts: u32,

    /// Buffered UI events per listener
    pub event_capacity: usize,

    /// Buffered change-feed signals per subscription; overflow forces a resync
    pub feed_capacity: usize,

    /// Prefilled text for the first message from a listing page
    pub first_contact_text: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            viewer_id: String::new(),
            viewer_name: String::new(),
            data_dir: None,
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
            max_attempts: 8,
            event_capacity: 256,
            feed_capacity: 256,
            first_contact_text: DEFAULT_FIRST_CONTACT_TEXT.to_string(),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <viewer_id> [--name <display name>] [--data-dir <path>] [--api-port <port>] [--retry-ms <ms>]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let viewer_id = args[1].trim().to_string();
        if viewer_id.is_empty() || viewer_id.starts_with("--") {
            return Err(SyncError::Config("viewer id must come first".to_string()));
        }

        let mut viewer_name: Option<String> = None;
        let mut data_dir: Option<PathBuf> = None;
        let mut api_port: Option<u16> = None;
        let mut retry_ms: Option<u64> = None;

        let mut i = 2;
        while i < args.len() {
            let next = args.get(i + 1).cloned();
            let value = |flag: &str| {
                next.clone()
                    .ok_or_else(|| SyncError::Config(format!("{} requires an argument", flag)))
            };
            match args[i].as_str() {
                "--name" => {
                    viewer_name = Some(value("--name")?);
                    i += 2;
                }
                "--data-dir" => {
                    data_dir = Some(PathBuf::from(value("--data-dir")?));
                    i += 2;
                }
                "--api-port" => {
                    api_port = Some(value("--api-port")?.parse::<u16>().map_err(|_| {
                        SyncError::Config("--api-port must be a valid number (0-65535)".to_string())
                    })?);
                    i += 2;
                }
                "--retry-ms" => {
                    retry_ms = Some(value("--retry-ms")?.parse::<u64>().map_err(|_| {
                        SyncError::Config("--retry-ms must be a number of milliseconds".to_string())
                    })?);
                    i += 2;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Some(p) = std::env::var("CHATSYNC_API_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            api_port = Some(p);
        }
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(name) = std::env::var("CHATSYNC_NAME") {
            viewer_name = Some(name);
        }
        let feed_capacity = std::env::var("CHATSYNC_FEED_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok());

        let defaults = Self::default();
        let retry_initial = retry_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_initial);

        Ok(Self {
            viewer_name: viewer_name.unwrap_or_else(|| viewer_id.clone()),
            viewer_id,
            data_dir,
            api_addr: SocketAddr::from(([127, 0, 0, 1], api_port.unwrap_or(DEFAULT_API_PORT))),
            retry_initial,
            retry_max: defaults.retry_max.max(retry_initial),
            feed_capacity: feed_capacity.unwrap_or(defaults.feed_capacity),
            ..defaults
        })
    }

    /// Data directory, falling back to `.chatsync/<viewer>`
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!(".chatsync/{}", self.viewer_id)))
    }
}
