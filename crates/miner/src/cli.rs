use clap::{ArgGroup, Parser};

use hds_miner_core::variant::SolverVariant;
use hds_miner_engine::EngineConfig;

/// Pool address split into host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `host:port`; IPv6 hosts are written as `[addr]:port`.
pub fn parse_server(input: &str) -> Result<ServerAddr, String> {
    let s = input.trim();
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid server {input:?}: expected host:port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(format!("invalid server {input:?}: empty host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid server {input:?}: bad port {port:?}"))?;
    if port == 0 {
        return Err(format!("invalid server {input:?}: port must not be 0"));
    }
    Ok(ServerAddr {
        host: host.to_string(),
        port,
    })
}

#[derive(Debug, Clone, Parser)]
#[command(name = "hds-miner", version, about = "HDS GPU pool miner")]
#[command(group(ArgGroup::new("variant").args(["hds_hash_i", "hds_hash_ii", "hds_hash_iii"])))]
pub struct Cli {
    /// Pool address (`host:port`). Falls back to the saved profile.
    #[arg(short = 's', long, env = "HDS_SERVER", value_parser = parse_server)]
    pub server: Option<ServerAddr>,

    /// Pool API key. Falls back to the saved profile.
    #[arg(short = 'k', long = "key", env = "HDS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Comma-separated device indices to mine on (default: all).
    #[arg(short = 'd', long, env = "HDS_DEVICES", value_delimiter = ',')]
    pub devices: Vec<usize>,

    /// Always solve with HdsHash I.
    #[arg(long = "hds-hash-i")]
    pub hds_hash_i: bool,

    /// Always solve with HdsHash II.
    #[arg(long = "hds-hash-ii")]
    pub hds_hash_ii: bool,

    /// Always solve with HdsHash III.
    #[arg(long = "hds-hash-iii")]
    pub hds_hash_iii: bool,

    /// Verbose diagnostics on stderr (wire traffic included).
    #[arg(long, env = "HDS_DEBUG", default_value_t = false)]
    pub debug: bool,

    #[arg(long, env = "HDS_NO_TUI", default_value_t = false)]
    pub no_tui: bool,

    /// Mine with N scripted devices that never find solutions.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..=64))]
    pub dry_run: Option<u16>,

    /// Seconds to wait before reconnecting to the pool.
    #[arg(
        long,
        env = "HDS_RECONNECT_DELAY",
        value_name = "SECS",
        default_value_t = EngineConfig::DEFAULT_RECONNECT_DELAY.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub reconnect_delay: u64,

    /// Treat a device as failed when one round takes longer than this.
    #[arg(long, env = "HDS_DISPATCH_TIMEOUT", value_name = "SECS")]
    pub dispatch_timeout: Option<u64>,
}

impl Cli {
    pub fn forced_variant(&self) -> Option<SolverVariant> {
        if self.hds_hash_i {
            Some(SolverVariant::HdsI)
        } else if self.hds_hash_ii {
            Some(SolverVariant::HdsII)
        } else if self.hds_hash_iii {
            Some(SolverVariant::HdsIII)
        } else {
            None
        }
    }
}
