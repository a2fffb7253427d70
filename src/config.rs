//! Server configuration, read from the environment (and `.env` when present).
use {
    crate::engine::recent_leaders_slot::{TpuClientConfig, DEFAULT_FANOUT_SLOTS},
    std::{
        net::{Ipv4Addr, SocketAddr},
        str::FromStr,
    },
    thiserror::Error,
};

pub const DEFAULT_LISTEN_PORT: u16 = 3001;
pub const DEFAULT_REPEAT_COUNT: usize = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub rpc_url: String,
    /// Empty when slot updates should be polled over RPC.
    pub ws_url: String,
    pub listen_addr: SocketAddr,
    pub repeat_count: usize,
    pub tpu_client: TpuClientConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let rpc_url = lookup("RPC_URL")
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing("RPC_URL"))?;
        let ws_url = lookup("WS_URL").unwrap_or_default();
        let listen_addr = parse_or(&lookup, "LISTEN_ADDR", || {
            SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT))
        })?;
        let repeat_count = parse_or(&lookup, "REPEAT_COUNT", || DEFAULT_REPEAT_COUNT)?.max(1);
        let fanout_slots = parse_or(&lookup, "FANOUT_SLOTS", || DEFAULT_FANOUT_SLOTS)?;

        Ok(Self {
            rpc_url,
            ws_url,
            listen_addr,
            repeat_count,
            tpu_client: TpuClientConfig {
                fanout_slots,
                ..TpuClientConfig::default()
            },
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: impl FnOnce() -> T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default()),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
