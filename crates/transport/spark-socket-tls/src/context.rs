use arc_swap::ArcSwapOption;
use rustls::{ClientConfig, ServerConfig};
use spark_socket_core::{Result, SocketError, TlsConfigProvider};
use std::fmt;
use std::sync::Arc;

/// 可热更新的 TLS 上下文，实现 [`TlsConfigProvider`]。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书轮换不应要求重建客户端或重启服务端：每次握手前读取最新配置即可；
/// - 同一上下文可以同时持有客户端与服务端配置，测试中常用一份上下文覆盖两端。
///
/// ## 逻辑（How）
/// - 两侧配置各存放在一个 `ArcSwapOption` 中，读取为无锁的 `load_full`；
/// - `replace_*` 只影响之后发起的握手，已建立的会话继续使用旧配置。
///
/// ## 契约（What）
/// - 未设置的一侧在握手时返回 [`SocketError::TlsConfig`]；
/// - 克隆体共享同一份存储，任一克隆上的替换对所有持有者可见。
#[derive(Clone, Default)]
pub struct ReloadableTlsConfig {
    client: Arc<ArcSwapOption<ClientConfig>>,
    server: Arc<ArcSwapOption<ServerConfig>>,
}

impl ReloadableTlsConfig {
    pub fn new(client: Option<Arc<ClientConfig>>, server: Option<Arc<ServerConfig>>) -> Self {
        Self {
            client: Arc::new(ArcSwapOption::new(client)),
            server: Arc::new(ArcSwapOption::new(server)),
        }
    }

    pub fn client(config: Arc<ClientConfig>) -> Self {
        Self::new(Some(config), None)
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self::new(None, Some(config))
    }

    /// 替换客户端配置，通常用于更新信任根。
    pub fn replace_client_config(&self, config: Arc<ClientConfig>) {
        self.client.store(Some(config));
    }

    /// 替换服务端配置，通常用于证书热更新。
    pub fn replace_server_config(&self, config: Arc<ServerConfig>) {
        self.server.store(Some(config));
    }

    pub fn client_snapshot(&self) -> Option<Arc<ClientConfig>> {
        self.client.load_full()
    }

    pub fn server_snapshot(&self) -> Option<Arc<ServerConfig>> {
        self.server.load_full()
    }

    /// 以 trait 对象形式交给 [`spark_socket_core::ClientConfigBuilder::tls`] 等构造器。
    pub fn into_provider(self) -> Arc<dyn TlsConfigProvider> {
        Arc::new(self)
    }
}

impl TlsConfigProvider for ReloadableTlsConfig {
    fn client_config(&self) -> Result<Arc<ClientConfig>> {
        self.client_snapshot()
            .ok_or_else(|| SocketError::TlsConfig("no client tls context installed".into()))
    }

    fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.server_snapshot()
            .ok_or_else(|| SocketError::TlsConfig("no server tls context installed".into()))
    }
}

impl fmt::Debug for ReloadableTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableTlsConfig")
            .field("client", &self.client.load().is_some())
            .field("server", &self.server.load().is_some())
            .finish()
    }
}
