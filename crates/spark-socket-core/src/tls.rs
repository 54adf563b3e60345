use crate::error::{Result, SocketError};
use std::fmt;
use std::sync::Arc;

/// TLS 协作方边界：提供“可直接发起协商”的 rustls 上下文。
///
/// 核心层不解析证书，只在每次握手前向实现方索取配置；实现方可以在两次握手之间
/// 替换配置（证书轮换）。未实现的一侧返回 [`SocketError::TlsConfig`]。
pub trait TlsConfigProvider: Send + Sync + fmt::Debug + 'static {
    fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        Err(SocketError::TlsConfig(
            "provider does not offer a client context".into(),
        ))
    }

    fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        Err(SocketError::TlsConfig(
            "provider does not offer a server context".into(),
        ))
    }
}
