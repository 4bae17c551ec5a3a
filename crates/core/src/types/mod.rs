mod addr;
mod config;

pub use addr::IpAddress;
pub use config::{
    InterfaceAddress, InterfaceConfig, Ipv4Config, NetConfig, NetConfigBuilder, SocketConfig,
    TcpConfig,
};
