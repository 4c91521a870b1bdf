/// Chain Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod chain;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod server;
pub mod stream;
pub mod tunnel;

// 重新导出常用类型
pub use chain::{AccessPolicy, TunnelChain};
pub use config::ServerConfig;
pub use endpoint::{TunnelAddress, TunnelUrl};
pub use error::{Result, TunnelError};
pub use stream::{TunnelStream, TunnelTransport};
pub use tunnel::{HttpsTunnel, TcpTunnel, Tunnel, TunnelRef, TunnelScheme, TunnelState};
