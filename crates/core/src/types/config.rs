use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Smallest MTU an IPv4 link may advertise (RFC 791).
const MIN_IPV4_MTU: usize = 68;

/// An IPv4 address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    /// Address still undergoing duplicate detection. Packets sent to it are
    /// dropped until it becomes valid.
    #[serde(default)]
    pub tentative: bool,
}

impl InterfaceAddress {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            addr,
            prefix_len,
            tentative: false,
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len.min(32))),
        };
        Ipv4Addr::from(bits)
    }
}

/// Configuration of one network interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    /// Link MTU in bytes.
    /// Default: 1500
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default)]
    pub addresses: Vec<InterfaceAddress>,
    /// Next hop for destinations outside every configured subnet.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// Number of distinct multicast groups the interface may join.
    /// Default: 4
    #[serde(default = "default_multicast_filter_size")]
    pub multicast_filter_size: usize,
}

fn default_mtu() -> usize {
    1500
}

fn default_multicast_filter_size() -> usize {
    4
}

impl InterfaceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mtu: default_mtu(),
            addresses: Vec::new(),
            gateway: None,
            multicast_filter_size: default_multicast_filter_size(),
        }
    }
}

/// IPv4 layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Config {
    /// TTL used when a sender does not pick one.
    pub default_ttl: u8,
    /// Reassembly slots per interface.
    pub max_frag_datagrams: usize,
    /// Largest datagram (header included) reassembly will rebuild.
    pub max_frag_datagram_size: usize,
    /// Reassembly time-to-live in milliseconds.
    pub frag_ttl_ms: u64,
    /// Period of the reassembly sweep in milliseconds.
    pub frag_tick_ms: u64,
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Self {
            default_ttl: 64,
            max_frag_datagrams: 4,
            max_frag_datagram_size: 8192,
            frag_ttl_ms: 15_000,
            frag_tick_ms: 1_000,
        }
    }
}

impl Ipv4Config {
    pub fn frag_ttl(&self) -> Duration {
        Duration::from_millis(self.frag_ttl_ms)
    }

    pub fn frag_tick(&self) -> Duration {
        Duration::from_millis(self.frag_tick_ms)
    }
}

/// TCP settings. Times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub default_mss: u16,
    pub min_mss: u16,
    pub max_mss: u16,
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub max_retries: u32,
    pub msl2_timeout_ms: u64,
    pub fin_wait2_timeout_ms: u64,
    pub default_syn_queue_size: usize,
    pub max_syn_queue_size: usize,
    pub tx_buffer_size: usize,
    pub rx_buffer_size: usize,
    /// Nagle override: unsent data older than this is pushed regardless.
    pub override_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub probe_interval_ms: u64,
    pub max_probe_interval_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            default_mss: 536,
            min_mss: 64,
            max_mss: 1430,
            initial_rto_ms: 1_000,
            min_rto_ms: 1_000,
            max_rto_ms: 60_000,
            max_retries: 5,
            msl2_timeout_ms: 4_000,
            fin_wait2_timeout_ms: 4_000,
            default_syn_queue_size: 4,
            max_syn_queue_size: 16,
            tx_buffer_size: 2860,
            rx_buffer_size: 2860,
            override_timeout_ms: 500,
            tick_interval_ms: 100,
            probe_interval_ms: 1_000,
            max_probe_interval_ms: 60_000,
        }
    }
}

impl TcpConfig {
    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn msl2_timeout(&self) -> Duration {
        Duration::from_millis(self.msl2_timeout_ms)
    }

    pub fn fin_wait2_timeout(&self) -> Duration {
        Duration::from_millis(self.fin_wait2_timeout_ms)
    }

    pub fn override_timeout(&self) -> Duration {
        Duration::from_millis(self.override_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn max_probe_interval(&self) -> Duration {
        Duration::from_millis(self.max_probe_interval_ms)
    }

    /// MSS assumed for a peer that does not send the option.
    pub fn effective_default_mss(&self) -> u16 {
        self.default_mss.min(self.max_mss)
    }

    pub fn clamp_mss(&self, mss: u16) -> u16 {
        mss.clamp(self.min_mss, self.max_mss)
    }
}

/// Socket table settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub max_sockets: usize,
    pub ephemeral_port_min: u16,
    pub ephemeral_port_max: u16,
    /// Datagrams queued per UDP or raw socket before new ones are dropped.
    pub rx_queue_len: usize,
    /// How long a blocking socket call may wait before it fails.
    pub timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_sockets: 16,
            ephemeral_port_min: 49152,
            ephemeral_port_max: 65535,
            rx_queue_len: 4,
            timeout_ms: 30_000,
        }
    }
}

impl SocketConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level stack configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub ipv4: Ipv4Config,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub sockets: SocketConfig,
}

impl NetConfig {
    /// Start building a configuration from defaults.
    pub fn builder() -> NetConfigBuilder {
        NetConfigBuilder::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: NetConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(Error::MissingConfig("interfaces".to_string()));
        }
        for iface in &self.interfaces {
            if iface.mtu < MIN_IPV4_MTU {
                return Err(Error::InvalidConfig(format!(
                    "interface {}: mtu {} below {}",
                    iface.name, iface.mtu, MIN_IPV4_MTU
                )));
            }
            if let Some(addr) = iface.addresses.iter().find(|a| a.prefix_len > 32) {
                return Err(Error::InvalidConfig(format!(
                    "interface {}: prefix length {} for {}",
                    iface.name, addr.prefix_len, addr.addr
                )));
            }
        }
        if self.ipv4.max_frag_datagram_size < 20 {
            return Err(Error::InvalidConfig(
                "max_frag_datagram_size smaller than an IPv4 header".to_string(),
            ));
        }
        let tcp = &self.tcp;
        if tcp.min_mss > tcp.max_mss {
            return Err(Error::InvalidConfig(format!(
                "min_mss {} exceeds max_mss {}",
                tcp.min_mss, tcp.max_mss
            )));
        }
        if tcp.min_rto_ms > tcp.max_rto_ms {
            return Err(Error::InvalidConfig("min_rto exceeds max_rto".to_string()));
        }
        if tcp.tx_buffer_size == 0 || tcp.rx_buffer_size == 0 {
            return Err(Error::InvalidConfig("TCP buffers must be non-empty".to_string()));
        }
        if tcp.rx_buffer_size > usize::from(u16::MAX) {
            return Err(Error::InvalidConfig(
                "rx_buffer_size exceeds the 16-bit window".to_string(),
            ));
        }
        if tcp.default_syn_queue_size == 0 || tcp.default_syn_queue_size > tcp.max_syn_queue_size
        {
            return Err(Error::InvalidConfig(
                "default_syn_queue_size must be in 1..=max_syn_queue_size".to_string(),
            ));
        }
        if tcp.tick_interval_ms == 0 || self.ipv4.frag_tick_ms == 0 {
            return Err(Error::InvalidConfig("tick intervals must be non-zero".to_string()));
        }
        let sockets = &self.sockets;
        if sockets.max_sockets == 0 {
            return Err(Error::InvalidConfig("max_sockets must be non-zero".to_string()));
        }
        if sockets.ephemeral_port_min == 0
            || sockets.ephemeral_port_min > sockets.ephemeral_port_max
        {
            return Err(Error::InvalidConfig("empty ephemeral port range".to_string()));
        }
        Ok(())
    }
}

/// Builder for NetConfig.
#[derive(Debug, Clone, Default)]
pub struct NetConfigBuilder {
    config: NetConfig,
}

impl NetConfigBuilder {
    /// Add an interface with a single address (e.g., "192.0.2.1/24").
    pub fn interface(mut self, name: &str, cidr: &str) -> Self {
        let mut iface = InterfaceConfig::new(name);
        if let Some((base, prefix)) = cidr.split_once('/')
            && let Ok(addr) = base.parse::<Ipv4Addr>()
            && let Ok(prefix_len) = prefix.parse::<u8>()
        {
            iface.addresses.push(InterfaceAddress::new(addr, prefix_len));
        }
        self.config.interfaces.push(iface);
        self
    }

    /// Set the MTU of the most recently added interface.
    pub fn mtu(mut self, mtu: usize) -> Self {
        if let Some(iface) = self.config.interfaces.last_mut() {
            iface.mtu = mtu;
        }
        self
    }

    /// Set the default gateway of the most recently added interface.
    pub fn gateway(mut self, gateway: Ipv4Addr) -> Self {
        if let Some(iface) = self.config.interfaces.last_mut() {
            iface.gateway = Some(gateway);
        }
        self
    }

    pub fn max_sockets(mut self, count: usize) -> Self {
        self.config.sockets.max_sockets = count;
        self
    }

    pub fn tcp_buffers(mut self, tx: usize, rx: usize) -> Self {
        self.config.tcp.tx_buffer_size = tx;
        self.config.tcp.rx_buffer_size = rx;
        self
    }

    pub fn tcp(mut self, tcp: TcpConfig) -> Self {
        self.config.tcp = tcp;
        self
    }

    pub fn ipv4(mut self, ipv4: Ipv4Config) -> Self {
        self.config.ipv4 = ipv4;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<NetConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stack_constants() {
        let tcp = TcpConfig::default();
        assert_eq!(tcp.effective_default_mss(), 536);
        assert_eq!(tcp.clamp_mss(1460), 1430);
        assert_eq!(tcp.clamp_mss(10), 64);
        assert_eq!(tcp.msl2_timeout(), Duration::from_secs(4));

        let ipv4 = Ipv4Config::default();
        assert_eq!(ipv4.default_ttl, 64);
        assert_eq!(ipv4.frag_ttl(), Duration::from_secs(15));
    }

    #[test]
    fn builder_parses_cidr() {
        let config = NetConfig::builder()
            .interface("eth0", "192.0.2.1/24")
            .gateway(Ipv4Addr::new(192, 0, 2, 254))
            .build()
            .unwrap();

        let iface = &config.interfaces[0];
        assert_eq!(iface.addresses[0].addr, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(iface.addresses[0].netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(iface.gateway, Some(Ipv4Addr::new(192, 0, 2, 254)));
    }

    #[test]
    fn build_without_interfaces_fails() {
        let err = NetConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::MissingConfig(_)));
    }

    #[test]
    fn small_mtu_rejected() {
        let err = NetConfig::builder()
            .interface("eth0", "192.0.2.1/24")
            .mtu(40)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn netmask_edges() {
        let any = InterfaceAddress::new(Ipv4Addr::UNSPECIFIED, 0);
        assert_eq!(any.netmask(), Ipv4Addr::UNSPECIFIED);
        let host = InterfaceAddress::new(Ipv4Addr::new(10, 0, 0, 1), 32);
        assert_eq!(host.netmask(), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn from_toml() {
        let config = NetConfig::from_toml_str(
            r#"
            [[interfaces]]
            name = "eth0"
            mtu = 576
            addresses = [{ addr = "192.0.2.1", prefix_len = 24 }]

            [tcp]
            max_syn_queue_size = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.interfaces[0].mtu, 576);
        assert!(!config.interfaces[0].addresses[0].tentative);
        assert_eq!(config.tcp.max_syn_queue_size, 8);
        assert_eq!(config.tcp.default_mss, 536);
        assert_eq!(config.sockets.max_sockets, 16);
    }

    #[test]
    fn serde_json_roundtrip() {
        let config = NetConfig::builder()
            .interface("eth0", "10.0.0.2/8")
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: NetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
