pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    InterfaceAddress, InterfaceConfig, IpAddress, Ipv4Config, NetConfig, NetConfigBuilder,
    SocketConfig, TcpConfig,
};
