//! Configuration: a JSON config file, CLI flags layered over it, and the
//! IP allow/blocklist filter.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::DEFAULT_PROBE_CACHE_BUDGET;

/// An IPv4/IPv6 network in CIDR form; bare addresses get a full-length
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr
                    .parse()
                    .with_context(|| format!("bad network address {addr:?}"))?;
                let prefix: u8 = prefix
                    .parse()
                    .with_context(|| format!("bad network prefix {prefix:?}"))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().with_context(|| format!("bad address {s:?}"))?;
                let prefix = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (addr, prefix)
            }
        };
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            bail!("network prefix /{prefix} too long for {addr}");
        }
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        fn masked(ip: IpAddr, prefix: u8) -> Option<u128> {
            let (bits, width) = match ip {
                IpAddr::V4(v4) => (u32::from(v4) as u128, 32u8),
                IpAddr::V6(v6) => (u128::from(v6), 128u8),
            };
            if prefix > width {
                return None;
            }
            let shift = width - prefix;
            Some(if shift >= 128 { 0 } else { bits >> shift })
        }
        if self.addr.is_ipv4() != ip.is_ipv4() {
            return false;
        }
        masked(self.addr, self.prefix) == masked(ip, self.prefix)
    }
}

/// Address admission: an address passes when it is in no blacklisted net
/// and the allowlist is empty or matches it.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    pub allowed: Vec<IpNet>,
    pub blacklisted: Vec<IpNet>,
}

impl IpFilter {
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.blacklisted.iter().any(|net| net.contains(ip)) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|net| net.contains(ip))
    }
}

fn parse_net_list(nets: &[String]) -> Result<Vec<IpNet>> {
    nets.iter().map(|s| IpNet::parse(s.trim())).collect()
}

fn default_http() -> String {
    ":1338".to_string()
}

fn default_notify_interval() -> u64 {
    30
}

fn default_friendly_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("dlnacast on {host}")
}

fn default_ffprobe_cache_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".dms").join("cache"))
}

fn default_transcode_log_pattern() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dms")
        .join("log")
        .join("%p")
        .join("%b")
        .to_string_lossy()
        .into_owned()
}

/// The JSON configuration schema. Field names stay PascalCase so existing
/// config files keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    /// Content root directory.
    pub path: PathBuf,
    /// Restrict SSDP to one interface; empty means all usable interfaces.
    pub if_name: String,
    /// HTTP bind address, e.g. `:1338` or `192.168.1.2:1338`.
    pub http: String,
    pub friendly_name: String,
    pub log_headers: bool,
    pub ffprobe_cache_path: Option<PathBuf>,
    pub probe_cache_budget: u64,
    pub no_transcode: bool,
    pub force_transcode_to: Option<String>,
    pub no_probe: bool,
    /// Seconds between SSDP alive announcements.
    pub notify_interval: u64,
    pub ignore_hidden: bool,
    pub ignore_unreadable: bool,
    pub ignore_paths: Vec<PathBuf>,
    pub allowed_ip_nets: Vec<String>,
    pub blacklisted_ip_nets: Vec<String>,
    pub allow_dynamic_streams: bool,
    /// Transcode stderr log path pattern; `%p` is the profile key, `%b`
    /// the media base name.
    pub transcode_log_pattern: String,
    /// Respond 501 to event subscriptions instead of handling them; some
    /// renderers behave better that way.
    pub stall_event_subscribe: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            if_name: String::new(),
            http: default_http(),
            friendly_name: default_friendly_name(),
            log_headers: false,
            ffprobe_cache_path: default_ffprobe_cache_path(),
            probe_cache_budget: DEFAULT_PROBE_CACHE_BUDGET,
            no_transcode: false,
            force_transcode_to: None,
            no_probe: false,
            notify_interval: default_notify_interval(),
            ignore_hidden: false,
            ignore_unreadable: false,
            ignore_paths: Vec::new(),
            allowed_ip_nets: Vec::new(),
            blacklisted_ip_nets: Vec::new(),
            allow_dynamic_streams: false,
            transcode_log_pattern: default_transcode_log_pattern(),
            stall_event_subscribe: false,
        }
    }
}

/// Parses a duration given as seconds (`90`) or with a unit suffix
/// (`90s`, `5m`, `1h`).
pub fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("bad interval {s:?}"))?;
    let secs = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => bail!("bad interval unit {unit:?} in {s:?}"),
    };
    Ok(Duration::from_secs(secs))
}

#[derive(Parser, Debug, Default)]
#[command(name = "dlnacast", version, about = "DLNA/UPnP-AV media server")]
pub struct Args {
    /// Content root directory (default: current directory)
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// HTTP bind address, e.g. ":1338"
    #[arg(long)]
    pub http: Option<String>,

    /// Restrict SSDP to this network interface
    #[arg(long)]
    pub ifname: Option<String>,

    /// Device friendly name
    #[arg(long)]
    pub friendly_name: Option<String>,

    /// Disable transcoding and the resources it implies
    #[arg(long)]
    pub no_transcode: bool,

    /// Disable media probing
    #[arg(long)]
    pub no_probe: bool,

    /// Hide hidden files and directories
    #[arg(long)]
    pub ignore_hidden: bool,

    /// Hide unreadable files and directories
    #[arg(long)]
    pub ignore_unreadable: bool,

    /// Comma-separated allowed CIDR networks or addresses
    #[arg(long)]
    pub allowed_ips: Option<String>,

    /// Comma-separated blacklisted CIDR networks or addresses
    #[arg(long)]
    pub blacklisted_ips: Option<String>,

    /// Surface .dms.json dynamic stream descriptors as items
    #[arg(long)]
    pub allow_dynamic_streams: bool,

    /// Only offer this transcode profile
    #[arg(long)]
    pub force_transcode_to: Option<String>,

    /// SSDP notify interval, e.g. "30s"
    #[arg(long)]
    pub notify_interval: Option<String>,

    /// Log request and response headers
    #[arg(long)]
    pub log_headers: bool,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print a default configuration file to stdout and exit
    #[arg(long)]
    pub generate_config: bool,
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_slice(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Builds the effective configuration: file values first, CLI flags on
    /// top.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => {
                let config = Self::load_from_file(path)?;
                info!(config = %path.display(), "loaded configuration file");
                config
            }
            None => Self::default(),
        };

        if let Some(path) = &args.path {
            config.path = path.clone();
        }
        if let Some(http) = &args.http {
            config.http = http.clone();
        }
        if let Some(ifname) = &args.ifname {
            config.if_name = ifname.clone();
        }
        if let Some(name) = &args.friendly_name {
            config.friendly_name = name.clone();
        }
        if args.no_transcode {
            config.no_transcode = true;
        }
        if args.no_probe {
            config.no_probe = true;
        }
        if args.ignore_hidden {
            config.ignore_hidden = true;
        }
        if args.ignore_unreadable {
            config.ignore_unreadable = true;
        }
        if args.allow_dynamic_streams {
            config.allow_dynamic_streams = true;
        }
        if args.log_headers {
            config.log_headers = true;
        }
        if let Some(profile) = &args.force_transcode_to {
            config.force_transcode_to = Some(profile.clone());
        }
        if let Some(interval) = &args.notify_interval {
            config.notify_interval = parse_interval(interval)?.as_secs();
        }
        if let Some(list) = &args.allowed_ips {
            config.allowed_ip_nets = split_list(list);
        }
        if let Some(list) = &args.blacklisted_ips {
            config.blacklisted_ip_nets = split_list(list);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let path = &self.path;
        if !path.exists() {
            bail!("content root does not exist: {}", path.display());
        }
        if !path.is_dir() {
            bail!("content root is not a directory: {}", path.display());
        }
        self.http_addr()
            .with_context(|| format!("bad http bind address {:?}", self.http))?;
        if self.notify_interval == 0 {
            bail!("notify interval must be positive");
        }
        self.ip_filter()?;
        if let Some(profile) = &self.force_transcode_to {
            if crate::transcode::lookup(profile).is_none() {
                bail!("unknown transcode profile {profile:?}");
            }
        }
        Ok(())
    }

    /// The HTTP bind address; a bare `:port` binds the wildcard address.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        let s = self.http.trim();
        if let Some(port) = s.strip_prefix(':') {
            let port: u16 = port.parse().with_context(|| format!("bad port {port:?}"))?;
            return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
        }
        s.parse()
            .with_context(|| format!("bad socket address {s:?}"))
    }

    pub fn ip_filter(&self) -> Result<IpFilter> {
        Ok(IpFilter {
            allowed: parse_net_list(&self.allowed_ip_nets)?,
            blacklisted: parse_net_list(&self.blacklisted_ip_nets)?,
        })
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_secs(self.notify_interval)
    }

    /// Serialises the default configuration as pretty JSON, for
    /// `--generate-config`.
    pub fn generate_default() -> Result<String> {
        serde_json::to_string_pretty(&Config::default()).context("serialising default config")
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_net_parsing() {
        let net = IpNet::parse("192.168.0.0/16").unwrap();
        assert!(net.contains("192.168.4.7".parse().unwrap()));
        assert!(!net.contains("10.0.0.1".parse().unwrap()));

        let host = IpNet::parse("10.1.2.3").unwrap();
        assert_eq!(host.prefix, 32);
        assert!(host.contains("10.1.2.3".parse().unwrap()));
        assert!(!host.contains("10.1.2.4".parse().unwrap()));

        let v6 = IpNet::parse("fd00::/8").unwrap();
        assert!(v6.contains("fd12::1".parse().unwrap()));
        assert!(!v6.contains("fe80::1".parse().unwrap()));
        assert!(!v6.contains("10.0.0.1".parse().unwrap()));

        assert!(IpNet::parse("192.168.0.0/33").is_err());
        assert!(IpNet::parse("not-an-ip").is_err());
    }

    #[test]
    fn ip_filter_logic() {
        let open = IpFilter::default();
        assert!(open.allows("192.168.1.1".parse().unwrap()));

        let filter = IpFilter {
            allowed: vec![IpNet::parse("192.168.0.0/16").unwrap()],
            blacklisted: vec![IpNet::parse("192.168.13.0/24").unwrap()],
        };
        assert!(filter.allows("192.168.1.1".parse().unwrap()));
        assert!(!filter.allows("192.168.13.7".parse().unwrap()));
        assert!(!filter.allows("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(parse_interval("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_interval("5x").is_err());
        assert!(parse_interval("").is_err());
    }

    #[test]
    fn http_addr_forms() {
        let mut config = Config::default();
        config.http = ":1338".into();
        assert_eq!(
            config.http_addr().unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 1338))
        );
        config.http = "127.0.0.1:9000".into();
        assert_eq!(
            config.http_addr().unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9000))
        );
        config.http = "nope".into();
        assert!(config.http_addr().is_err());
    }

    #[test]
    fn config_json_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"FriendlyName\""));
        assert!(json.contains("\"NotifyInterval\""));
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.http, config.http);
        assert_eq!(back.notify_interval, config.notify_interval);
    }

    #[test]
    fn partial_config_files_get_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"Http": ":9999"}"#).unwrap();
        assert_eq!(parsed.http, ":9999");
        assert_eq!(parsed.notify_interval, 30);
    }

    #[test]
    fn cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            format!(
                r#"{{"Path": {:?}, "Http": ":9999", "NoTranscode": true}}"#,
                dir.path().to_str().unwrap()
            ),
        )
        .unwrap();

        let args = Args {
            config: Some(config_path),
            http: Some(":1338".into()),
            ..Default::default()
        };
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.http, ":1338");
        assert!(config.no_transcode);
    }

    #[test]
    fn generated_config_parses_back() {
        let text = Config::generate_default().unwrap();
        let parsed: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.notify_interval, 30);
    }
}
