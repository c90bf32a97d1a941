use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::{fs::read_to_string, net::SocketAddr, path::Path, time::Duration};

/// Serde helpers for representing `Duration` as a number of seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// A network interface the proxy derives local addresses from.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct IfaceConf {
    #[serde(default)]
    pub ifname: String,
}

/// Control-plane interface settings shared by both planes.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CpIface {
    #[serde(default)]
    pub dnn: String,

    /// Overrides the per-plane control API port (Up 8080, Down 8081).
    #[serde(default)]
    pub http_port: String,

    /// PFCP node id; when empty it is derived from the first
    /// non-loopback interface address (or the hostname with `use_fqdn`).
    #[serde(default)]
    pub node_id: String,

    #[serde(default)]
    pub use_fqdn: bool,

    #[serde(default)]
    pub enable_ue_ip_alloc: bool,

    #[serde(default)]
    pub ue_ip_pool: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

/// Session load generator mode.
///
/// `Create` establishes sessions and exits, `Delete` establishes and
/// deletes them again, `CreateContinue` establishes and keeps serving.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    Create,
    Delete,
    #[value(name = "create_continue")]
    CreateContinue,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub access_iface: IfaceConf,
    #[serde(default)]
    pub core_iface: IfaceConf,
    #[serde(default)]
    pub cpiface: CpIface,

    /// How many times an unanswered request is retransmitted with the
    /// same sequence number before the peer is given up on.
    #[serde(default = "Config::max_req_retries")]
    pub max_req_retries: u8,

    /// Wait per attempt for a matching response.
    #[serde(default = "Config::resp_timeout", with = "duration_secs")]
    pub resp_timeout: Duration,

    #[serde(default = "Config::read_timeout", with = "duration_secs")]
    pub read_timeout: Duration,

    #[serde(default = "Config::heart_beat_interval", with = "duration_secs")]
    pub heart_beat_interval: Duration,

    #[serde(default = "Config::enable_hb_timer")]
    pub enable_hb_timer: bool,

    /// Number of UPF workloads provisioned at startup.
    #[serde(default)]
    pub init_upfs: u32,

    #[serde(default = "Config::max_sessions_threshold")]
    pub max_sessions_threshold: u32,
    #[serde(default)]
    pub min_sessions_threshold: u32,
    #[serde(default = "Config::max_cpu_threshold")]
    pub max_cpu_threshold: u32,
    #[serde(default)]
    pub min_cpu_threshold: u32,
    #[serde(default = "Config::max_bitrate_threshold")]
    pub max_bitrate_threshold: u64,
    #[serde(default)]
    pub min_bitrate_threshold: u64,
    #[serde(default)]
    pub max_sessions_tolerance: f32,
    #[serde(default)]
    pub min_sessions_tolerance: f32,

    #[serde(default = "Config::reconciliation_interval", with = "duration_secs")]
    pub reconciliation_interval: Duration,

    #[serde(default)]
    pub auto_scale_out: bool,
    #[serde(default)]
    pub auto_scale_in: bool,
    #[serde(default)]
    pub scale_by_cpu: bool,
    #[serde(default = "Config::scale_by_session")]
    pub scale_by_session: bool,
    #[serde(default)]
    pub scale_by_bitrate: bool,

    #[serde(default = "Config::max_upfs")]
    pub max_upfs: u32,
    #[serde(default = "Config::min_upfs")]
    pub min_upfs: u32,

    #[serde(default)]
    pub log_level: LogLevel,

    /// N4 endpoint facing the SMF.
    #[serde(default = "Config::up_addr")]
    pub up_addr: SocketAddr,

    /// Local endpoint the Down plane sends from; an ephemeral port by
    /// default since the proxy is the client side toward the UPFs.
    #[serde(default = "Config::down_addr")]
    pub down_addr: SocketAddr,
}

impl Config {
    fn max_req_retries() -> u8 {
        3
    }

    fn resp_timeout() -> Duration {
        Duration::from_secs(2)
    }

    fn read_timeout() -> Duration {
        Duration::from_secs(15)
    }

    fn heart_beat_interval() -> Duration {
        Duration::from_secs(5)
    }

    fn enable_hb_timer() -> bool {
        true
    }

    fn max_sessions_threshold() -> u32 {
        50
    }

    fn max_cpu_threshold() -> u32 {
        80
    }

    fn max_bitrate_threshold() -> u64 {
        u64::MAX
    }

    fn reconciliation_interval() -> Duration {
        Duration::from_secs(10)
    }

    fn scale_by_session() -> bool {
        true
    }

    fn max_upfs() -> u32 {
        4
    }

    fn min_upfs() -> u32 {
        1
    }

    fn up_addr() -> SocketAddr {
        "0.0.0.0:8805".parse().unwrap()
    }

    fn down_addr() -> SocketAddr {
        "0.0.0.0:0".parse().unwrap()
    }

    /// Reads and parses a JSON configuration file. Any error here is
    /// fatal at startup.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    }
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// path to the proxy configuration file.
    #[arg(long, default_value = "upf.json")]
    pub config: String,

    /// create|delete|create_continue simulated sessions.
    #[arg(long, value_enum)]
    pub simulate: Option<SimMode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let cfg = Config::default();
        assert_eq!(cfg.max_req_retries, 3);
        assert_eq!(cfg.resp_timeout, Duration::from_secs(2));
        assert_eq!(cfg.heart_beat_interval, Duration::from_secs(5));
        assert!(cfg.enable_hb_timer);
        assert_eq!(cfg.max_upfs, 4);
        assert_eq!(cfg.min_upfs, 1);
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert_eq!(cfg.up_addr.port(), 8805);
    }

    #[test]
    fn parses_documented_json_shape() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "cpiface": {"dnn": "internet", "node_id": "10.0.0.9", "use_fqdn": false},
                "max_req_retries": 5,
                "resp_timeout": 1,
                "heart_beat_interval": 3,
                "enable_hb_timer": true,
                "max_sessions_threshold": 100,
                "reconciliation_interval": 2,
                "auto_scale_out": true,
                "scale_by_session": true,
                "max_upfs": 8,
                "min_upfs": 2,
                "log_level": "Debug"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.cpiface.dnn, "internet");
        assert_eq!(cfg.max_req_retries, 5);
        assert_eq!(cfg.resp_timeout, Duration::from_secs(1));
        assert_eq!(cfg.max_upfs, 8);
        assert!(cfg.auto_scale_out);
        assert_eq!(cfg.log_level.as_level(), log::Level::Debug);
    }
}
