//! 设备传输实现

pub mod tcp;

pub use tcp::TcpConnector;
