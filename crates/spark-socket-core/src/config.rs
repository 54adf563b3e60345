use crate::addr::validate_address;
use crate::error::{MAX_GID, Result, SocketError};
use crate::protocol::NetworkProtocol;
use crate::tls::TlsConfigProvider;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// `once` 拷贝请求、读取响应时使用的块大小。
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
/// 数据报接收缓冲区大小（IPv4 UDP 的最大有效载荷）。
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
/// 套接字文件的默认权限。
pub const DEFAULT_FILE_MODE: u32 = 0o770;
/// 低于该值的空闲超时会被忽略。
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// 本地路径套接字的组 ID，构造时校验 `gid <= 32767`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct GroupId(u32);

impl GroupId {
    pub fn new(gid: u32) -> Result<Self> {
        if gid > MAX_GID {
            return Err(SocketError::InvalidGroup(gid));
        }
        Ok(Self(gid))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for GroupId {
    type Error = SocketError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<GroupId> for u32 {
    fn from(value: GroupId) -> Self {
        value.0
    }
}

/// 套接字文件权限位，只保留低 12 位。
///
/// 反序列化同时接受整数与八进制字符串（`"0600"`、`"0o600"`）。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u32")]
pub struct FileMode(u32);

impl FileMode {
    pub const fn new(mode: u32) -> Self {
        Self(mode & 0o7777)
    }

    pub fn from_octal_str(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .map(Self)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl Default for FileMode {
    fn default() -> Self {
        Self(DEFAULT_FILE_MODE)
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMode({:#o})", self.0)
    }
}

impl From<FileMode> for u32 {
    fn from(value: FileMode) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(mode) if mode <= 0o7777 => Ok(FileMode(mode)),
            Raw::Number(mode) => Err(serde::de::Error::custom(format!(
                "file mode {mode:#o} exceeds 0o7777"
            ))),
            Raw::Text(text) => FileMode::from_octal_str(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("`{text}` is not an octal file mode"))
            }),
        }
    }
}

/// 以整数毫秒序列化可选时长。
mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_some(&(duration.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// 客户端 TLS 设置。`provider` 属于代码而非数据，不参与序列化。
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip)]
    pub provider: Option<Arc<dyn TlsConfigProvider>>,
}

impl fmt::Debug for ClientTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTlsConfig")
            .field("enabled", &self.enabled)
            .field("server_name", &self.server_name)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

/// 服务端 TLS 设置。
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip)]
    pub provider: Option<Arc<dyn TlsConfigProvider>>,
}

impl fmt::Debug for ServerTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTlsConfig")
            .field("enabled", &self.enabled)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

/// 客户端配置。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 由调用方一次性构造，连接存续期间只读；
/// - [`ClientConfig::validate`] 在工厂构造与 `connect` 时各执行一次：
///   数据报协议开启 TLS → [`SocketError::TlsUnsupported`]；地址形态非法 → [`SocketError::Address`]；
///   开启 TLS 却缺少上下文提供方 → [`SocketError::TlsConfig`]；
/// - `read_timeout`/`write_timeout` 作用于每一次读写，与调用上下文的截止时间取较早者。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub network: NetworkProtocol,
    pub address: String,
    #[serde(default)]
    pub tls: ClientTlsConfig,
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<Duration>,
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub write_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(network: NetworkProtocol, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            tls: ClientTlsConfig::default(),
            read_timeout: None,
            write_timeout: None,
        }
    }

    pub fn builder(network: NetworkProtocol, address: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::new(network, address),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tls.enabled && !self.network.supports_tls() {
            return Err(SocketError::TlsUnsupported(self.network));
        }
        validate_address(self.network, &self.address, false)?;
        if self.tls.enabled {
            if self.tls.provider.is_none() {
                return Err(SocketError::TlsConfig(
                    "tls is enabled but no context provider is configured".into(),
                ));
            }
            if self.tls_server_name().is_none() {
                return Err(SocketError::TlsConfig(
                    "tls over a socket path requires an explicit server name".into(),
                ));
            }
        }
        Ok(())
    }

    /// 握手使用的服务器名：显式配置优先，否则取网络地址的主机部分。
    pub fn tls_server_name(&self) -> Option<String> {
        if let Some(name) = self.tls.server_name.as_ref().filter(|name| !name.is_empty()) {
            return Some(name.clone());
        }
        if self.network.is_local() {
            return None;
        }
        let (host, _) = self.address.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        (!host.is_empty()).then(|| host.to_owned())
    }

    /// 开启 TLS 时返回提供方。
    pub fn tls_provider(&self) -> Option<&Arc<dyn TlsConfigProvider>> {
        if self.tls.enabled {
            self.tls.provider.as_ref()
        } else {
            None
        }
    }
}

/// [`ClientConfig`] 构造器，`build` 时执行全部构造期校验。
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn tls(mut self, provider: Arc<dyn TlsConfigProvider>) -> Self {
        self.config.tls.enabled = true;
        self.config.tls.provider = Some(provider);
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.tls.server_name = Some(name.into());
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// 服务端配置。
///
/// - `perm_file`/`group_perm` 仅对本地路径协议生效；
/// - `idle_timeout` 限制服务端会话单次读取的等待时长，低于一秒时忽略；
/// - 连接处理函数属于代码，随配置一起交给工厂而不放进本结构。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub network: NetworkProtocol,
    pub address: String,
    #[serde(default)]
    pub tls: ServerTlsConfig,
    #[serde(default)]
    pub perm_file: FileMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_perm: Option<GroupId>,
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(network: NetworkProtocol, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            tls: ServerTlsConfig::default(),
            perm_file: FileMode::default(),
            group_perm: None,
            idle_timeout: None,
        }
    }

    pub fn builder(network: NetworkProtocol, address: impl Into<String>) -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::new(network, address),
            group: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tls.enabled && !self.network.supports_tls() {
            return Err(SocketError::TlsUnsupported(self.network));
        }
        validate_address(self.network, &self.address, true)?;
        if let Some(group) = self.group_perm {
            GroupId::new(group.get())?;
        }
        if self.tls.enabled && self.tls.provider.is_none() {
            return Err(SocketError::TlsConfig(
                "tls is enabled but no context provider is configured".into(),
            ));
        }
        Ok(())
    }

    pub fn tls_provider(&self) -> Option<&Arc<dyn TlsConfigProvider>> {
        if self.tls.enabled {
            self.tls.provider.as_ref()
        } else {
            None
        }
    }

    /// 生效的空闲超时；未配置或低于一秒时为 `None`。
    pub fn effective_idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
            .filter(|timeout| *timeout >= MIN_IDLE_TIMEOUT)
    }
}

/// [`ServerConfig`] 构造器。
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
    group: Option<u32>,
}

impl ServerConfigBuilder {
    pub fn tls(mut self, provider: Arc<dyn TlsConfigProvider>) -> Self {
        self.config.tls.enabled = true;
        self.config.tls.provider = Some(provider);
        self
    }

    pub fn permissions(mut self, mode: u32) -> Self {
        self.config.perm_file = FileMode::new(mode);
        self
    }

    /// 设置套接字文件的属组；超过 32767 时 `build` 返回 [`SocketError::InvalidGroup`]。
    pub fn group(mut self, gid: u32) -> Self {
        self.group = Some(gid);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn build(mut self) -> Result<ServerConfig> {
        if let Some(gid) = self.group {
            self.config.group_perm = Some(GroupId::new(gid)?);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoopProvider;
    impl TlsConfigProvider for NoopProvider {}

    #[test]
    fn group_ceiling_is_enforced_at_construction() {
        let err = ServerConfig::builder(NetworkProtocol::Unix, "/tmp/spark.sock")
            .group(32_768)
            .build()
            .unwrap_err();
        assert!(matches!(err, SocketError::InvalidGroup(32_768)), "实际错误：{err:?}");

        let config = ServerConfig::builder(NetworkProtocol::Unix, "/tmp/spark.sock")
            .group(32_767)
            .build()
            .expect("32767 是允许的最大组 ID");
        assert_eq!(config.group_perm.map(GroupId::get), Some(32_767));
    }

    #[test]
    fn tls_on_datagram_is_rejected() {
        for network in [NetworkProtocol::Udp, NetworkProtocol::Unixgram] {
            let address = if network.is_local() { "/tmp/a.sock" } else { "127.0.0.1:1" };
            let err = ClientConfig::builder(network, address)
                .tls(Arc::new(NoopProvider))
                .build()
                .unwrap_err();
            assert!(matches!(err, SocketError::TlsUnsupported(n) if n == network));
            let err = ServerConfig::builder(network, address)
                .tls(Arc::new(NoopProvider))
                .build()
                .unwrap_err();
            assert!(matches!(err, SocketError::TlsUnsupported(_)));
        }
    }

    #[test]
    fn tls_server_name_falls_back_to_host() {
        let config = ClientConfig::builder(NetworkProtocol::Tcp, "localhost:443")
            .tls(Arc::new(NoopProvider))
            .build()
            .unwrap();
        assert_eq!(config.tls_server_name().as_deref(), Some("localhost"));

        let err = ClientConfig::builder(NetworkProtocol::Unix, "/tmp/tls.sock")
            .tls(Arc::new(NoopProvider))
            .build()
            .unwrap_err();
        assert!(matches!(err, SocketError::TlsConfig(_)), "Unix 上的 TLS 必须显式给出服务器名");
    }

    #[test]
    fn deserializes_from_toml_with_octal_mode() {
        let config: ServerConfig = toml::from_str(
            r#"
            network = "UNIX"
            address = "/run/spark/app.sock"
            permFile = "0600"
            groupPerm = 100
            idleTimeout = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.network, NetworkProtocol::Unix);
        assert_eq!(config.perm_file.bits(), 0o600);
        assert_eq!(config.group_perm.map(GroupId::get), Some(100));
        assert_eq!(config.effective_idle_timeout(), None, "低于一秒的空闲超时应被忽略");
        config.validate().unwrap();

        let err = toml::from_str::<ServerConfig>(
            r#"
            network = "unix"
            address = "/run/spark/app.sock"
            groupPerm = 40000
            "#,
        );
        assert!(err.is_err(), "反序列化同样需要校验组 ID 上限");
    }

    #[test]
    fn client_config_json_round_trip_keeps_camel_case() {
        let raw = r#"{"network":"tcp4","address":"127.0.0.1:80","tls":{"enabled":false,"serverName":"api"},"readTimeout":1500}"#;
        let config: ClientConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.read_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.tls.server_name.as_deref(), Some("api"));
        let encoded = serde_json::to_value(&config).unwrap();
        assert_eq!(encoded["network"], "tcp4");
        assert_eq!(encoded["readTimeout"], 1500);
        assert!(encoded.get("writeTimeout").is_none());
    }

    #[test]
    fn rejects_malformed_addresses() {
        let err = ClientConfig::builder(NetworkProtocol::Udp, "no-port")
            .build()
            .unwrap_err();
        assert!(matches!(err, SocketError::Address { .. }));
        assert!(ServerConfig::builder(NetworkProtocol::Tcp, ":0").build().is_ok());
    }

    proptest::proptest! {
        #[test]
        fn group_ids_accepted_exactly_up_to_ceiling(gid in 0u32..=70_000) {
            let built = ServerConfig::builder(NetworkProtocol::Unix, "/tmp/spark.sock")
                .group(gid)
                .build();
            proptest::prop_assert_eq!(built.is_ok(), gid <= MAX_GID);
            proptest::prop_assert_eq!(GroupId::new(gid).is_ok(), gid <= MAX_GID);
        }

        #[test]
        fn octal_strings_match_integer_modes(mode in 0u32..0o7777) {
            let parsed = FileMode::from_octal_str(&format!("0{mode:o}"));
            proptest::prop_assert_eq!(parsed, Some(FileMode::new(mode)));
        }
    }
}
