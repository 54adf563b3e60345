#![doc = r#"
# spark-socket

## 设计动机（Why）
- 调用方只持有一个网络描述符（`tcp`、`udp4`、`unix` 等）与配置，不应关心具体由哪个传输 crate 实现；
- 本地路径套接字并非所有平台都具备，工厂需要给出明确的“不支持”信号，而不是配置错误或 panic。

## 核心契约（What）
- [`capability`]：查询描述符在当前编译目标上是否可用；
- [`new_client`]/[`new_server`]：校验配置并返回 [`SocketClient`]/[`SocketServer`]；
  本地路径协议在不支持的平台上返回 `Ok(None)`，调用方可据此回退到网络协议；
- [`SocketClient`]/[`SocketServer`]：四种协议实现上的封闭枚举，方法逐一转发，匹配保持穷尽；
- 构造阶段不打开任何套接字，直到 `connect`/`listen` 才发生 IO。

## 风险与考量（Trade-offs）
- 枚举转发放弃了各实现的具体类型（如弱句柄），需要时通过 `as_*` 访问器取回内部值；
- 连接处理函数与 [`ServerConfig`] 一同传入工厂，配置本身保持可序列化。
"#]
#![deny(unsafe_code)]

use spark_socket_core::{Client, Server};
use spark_socket_tcp::{TcpBinder, TcpClient, TcpDialer, TcpServer};
use spark_socket_udp::{UdpBinder, UdpClient, UdpDialer, UdpServer};
#[cfg(unix)]
use spark_socket_unix::{
    UnixBinder, UnixClient, UnixDialer, UnixServer, UnixgramBinder, UnixgramClient,
    UnixgramDialer, UnixgramServer,
};
use std::sync::Arc;
use tokio::io::AsyncRead;

pub use spark_socket_core::{
    CallContext, ClientConfig, ConnectionHandler, ConnectionState, ListenerState,
    NetworkProtocol, RawConn, Registry, Result, ServerConfig, Session, SocketError, TransportAddr,
};

/// 描述符在当前编译目标上的可用性。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Available,
    /// 平台缺少该协议所需的套接字能力（例如非 Unix 平台上的 `unix`/`unixgram`）。
    Unsupported,
}

impl Capability {
    pub fn is_available(self) -> bool {
        matches!(self, Capability::Available)
    }
}

/// 查询描述符是否可由工厂构造。
pub fn capability(protocol: NetworkProtocol) -> Capability {
    if protocol.is_available() {
        Capability::Available
    } else {
        Capability::Unsupported
    }
}

/// 解析描述符字符串并查询可用性；无法识别的描述符返回 [`SocketError::UnsupportedProtocol`]。
pub fn capability_of(descriptor: &str) -> Result<Capability> {
    Ok(capability(descriptor.parse()?))
}

/// 按协议选择实现的客户端。
#[derive(Clone, Debug)]
pub enum SocketClient {
    Tcp(TcpClient),
    Udp(UdpClient),
    #[cfg(unix)]
    Unix(UnixClient),
    #[cfg(unix)]
    Unixgram(UnixgramClient),
}

/// 按协议选择实现的服务端。
#[derive(Clone, Debug)]
pub enum SocketServer {
    Tcp(TcpServer),
    Udp(UdpServer),
    #[cfg(unix)]
    Unix(UnixServer),
    #[cfg(unix)]
    Unixgram(UnixgramServer),
}

macro_rules! dispatch_client {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            SocketClient::Tcp($inner) => $body,
            SocketClient::Udp($inner) => $body,
            #[cfg(unix)]
            SocketClient::Unix($inner) => $body,
            #[cfg(unix)]
            SocketClient::Unixgram($inner) => $body,
        }
    };
}

macro_rules! dispatch_server {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            SocketServer::Tcp($inner) => $body,
            SocketServer::Udp($inner) => $body,
            #[cfg(unix)]
            SocketServer::Unix($inner) => $body,
            #[cfg(unix)]
            SocketServer::Unixgram($inner) => $body,
        }
    };
}

/// 构造客户端，使用独立的连接登记表。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 配置校验失败时同步返回错误（`TlsUnsupported`、`Address`、`TlsConfig` 等），不做任何重试；
/// - 平台不支持该描述符时返回 `Ok(None)`；
/// - 不会发起连接。
pub fn new_client(config: ClientConfig) -> Result<Option<SocketClient>> {
    new_client_in(config, Arc::new(Registry::new()))
}

/// 构造客户端，并把连接登记到调用方提供的共享登记表中。
pub fn new_client_in(
    config: ClientConfig,
    registry: Arc<Registry>,
) -> Result<Option<SocketClient>> {
    if !capability(config.network).is_available() {
        tracing::debug!(
            target: "spark_socket::factory",
            network = %config.network,
            "protocol unsupported on this platform"
        );
        return Ok(None);
    }
    let client = match config.network {
        NetworkProtocol::Tcp | NetworkProtocol::Tcp4 | NetworkProtocol::Tcp6 => {
            SocketClient::Tcp(Client::with_registry(config, TcpDialer, registry)?)
        }
        NetworkProtocol::Udp | NetworkProtocol::Udp4 | NetworkProtocol::Udp6 => {
            SocketClient::Udp(Client::with_registry(config, UdpDialer, registry)?)
        }
        #[cfg(unix)]
        NetworkProtocol::Unix => {
            SocketClient::Unix(Client::with_registry(config, UnixDialer, registry)?)
        }
        #[cfg(unix)]
        NetworkProtocol::Unixgram => {
            SocketClient::Unixgram(Client::with_registry(config, UnixgramDialer, registry)?)
        }
        #[cfg(not(unix))]
        NetworkProtocol::Unix | NetworkProtocol::Unixgram => return Ok(None),
    };
    Ok(Some(client))
}

/// 构造服务端；`handler` 处理每条入站连接（数据报协议为每个报文）。
///
/// 契约与 [`new_client`] 一致：校验失败同步报错，平台不支持返回 `Ok(None)`，不会绑定任何地址。
pub fn new_server<H>(config: ServerConfig, handler: H) -> Result<Option<SocketServer>>
where
    H: ConnectionHandler,
{
    if !capability(config.network).is_available() {
        tracing::debug!(
            target: "spark_socket::factory",
            network = %config.network,
            "protocol unsupported on this platform"
        );
        return Ok(None);
    }
    let server = match config.network {
        NetworkProtocol::Tcp | NetworkProtocol::Tcp4 | NetworkProtocol::Tcp6 => {
            SocketServer::Tcp(Server::new(config, TcpBinder, handler)?)
        }
        NetworkProtocol::Udp | NetworkProtocol::Udp4 | NetworkProtocol::Udp6 => {
            SocketServer::Udp(Server::new(config, UdpBinder, handler)?)
        }
        #[cfg(unix)]
        NetworkProtocol::Unix => SocketServer::Unix(Server::new(config, UnixBinder, handler)?),
        #[cfg(unix)]
        NetworkProtocol::Unixgram => {
            SocketServer::Unixgram(Server::new(config, UnixgramBinder, handler)?)
        }
        #[cfg(not(unix))]
        NetworkProtocol::Unix | NetworkProtocol::Unixgram => return Ok(None),
    };
    Ok(Some(server))
}

impl SocketClient {
    pub fn protocol(&self) -> NetworkProtocol {
        self.config().network
    }

    pub fn config(&self) -> &ClientConfig {
        dispatch_client!(self, inner => inner.config())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        dispatch_client!(self, inner => inner.registry())
    }

    pub fn register_func_error<F>(&self, f: F)
    where
        F: Fn(&[SocketError]) + Send + Sync + 'static,
    {
        dispatch_client!(self, inner => inner.register_func_error(f))
    }

    pub fn register_func_info<F>(&self, f: F)
    where
        F: Fn(&TransportAddr, &TransportAddr, ConnectionState) + Send + Sync + 'static,
    {
        dispatch_client!(self, inner => inner.register_func_info(f))
    }

    pub fn is_connected(&self) -> bool {
        dispatch_client!(self, inner => inner.is_connected())
    }

    pub fn state(&self) -> Option<ConnectionState> {
        dispatch_client!(self, inner => inner.state())
    }

    pub fn local_addr(&self) -> Option<TransportAddr> {
        dispatch_client!(self, inner => inner.local_addr())
    }

    pub fn peer_addr(&self) -> Option<TransportAddr> {
        dispatch_client!(self, inner => inner.peer_addr())
    }

    pub async fn connect(&self, ctx: &CallContext) -> Result<()> {
        dispatch_client!(self, inner => inner.connect(ctx).await)
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        dispatch_client!(self, inner => inner.read(buf).await)
    }

    pub async fn read_with(&self, ctx: &CallContext, buf: &mut [u8]) -> Result<usize> {
        dispatch_client!(self, inner => inner.read_with(ctx, buf).await)
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        dispatch_client!(self, inner => inner.write(buf).await)
    }

    pub async fn write_with(&self, ctx: &CallContext, buf: &[u8]) -> Result<usize> {
        dispatch_client!(self, inner => inner.write_with(ctx, buf).await)
    }

    pub async fn half_close(&self) -> Result<()> {
        dispatch_client!(self, inner => inner.half_close().await)
    }

    pub async fn half_close_with(&self, ctx: &CallContext) -> Result<()> {
        dispatch_client!(self, inner => inner.half_close_with(ctx).await)
    }

    pub async fn close(&self) -> Result<()> {
        dispatch_client!(self, inner => inner.close().await)
    }

    /// 一次性请求/响应：拨号、写出请求、（字节流）半关闭、读完响应、回调、无条件关闭。
    pub async fn once<R, F>(&self, ctx: &CallContext, request: R, on_response: F) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        F: FnOnce(&[u8]) + Send,
    {
        dispatch_client!(self, inner => inner.once(ctx, request, on_response).await)
    }

    pub fn as_tcp(&self) -> Option<&TcpClient> {
        match self {
            SocketClient::Tcp(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_udp(&self) -> Option<&UdpClient> {
        match self {
            SocketClient::Udp(inner) => Some(inner),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub fn as_unix(&self) -> Option<&UnixClient> {
        match self {
            SocketClient::Unix(inner) => Some(inner),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub fn as_unixgram(&self) -> Option<&UnixgramClient> {
        match self {
            SocketClient::Unixgram(inner) => Some(inner),
            _ => None,
        }
    }
}

impl SocketServer {
    pub fn protocol(&self) -> NetworkProtocol {
        self.config().network
    }

    pub fn config(&self) -> &ServerConfig {
        dispatch_server!(self, inner => inner.config())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        dispatch_server!(self, inner => inner.registry())
    }

    pub fn register_func_error<F>(&self, f: F)
    where
        F: Fn(&[SocketError]) + Send + Sync + 'static,
    {
        dispatch_server!(self, inner => inner.register_func_error(f))
    }

    pub fn register_func_info<F>(&self, f: F)
    where
        F: Fn(&TransportAddr, &TransportAddr, ConnectionState) + Send + Sync + 'static,
    {
        dispatch_server!(self, inner => inner.register_func_info(f))
    }

    pub fn register_func_info_server<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        dispatch_server!(self, inner => inner.register_func_info_server(f))
    }

    /// 见 [`Server::register_update_conn`]。
    pub fn register_update_conn<F>(&self, f: F)
    where
        F: Fn(RawConn<'_>) + Send + Sync + 'static,
    {
        dispatch_server!(self, inner => inner.register_update_conn(f))
    }

    pub fn state(&self) -> ListenerState {
        dispatch_server!(self, inner => inner.state())
    }

    pub fn is_running(&self) -> bool {
        dispatch_server!(self, inner => inner.is_running())
    }

    pub fn is_gone(&self) -> bool {
        dispatch_server!(self, inner => inner.is_gone())
    }

    pub fn open_connections(&self) -> usize {
        dispatch_server!(self, inner => inner.open_connections())
    }

    pub fn local_addr(&self) -> Option<TransportAddr> {
        dispatch_server!(self, inner => inner.local_addr())
    }

    pub async fn wait_listening(&self) -> Result<TransportAddr> {
        dispatch_server!(self, inner => inner.wait_listening().await)
    }

    pub async fn done(&self) {
        dispatch_server!(self, inner => inner.done().await)
    }

    /// 绑定并运行 accept 循环，直到 `shutdown`/`close` 或 `ctx` 取消。
    pub async fn listen(&self, ctx: &CallContext) -> Result<()> {
        dispatch_server!(self, inner => inner.listen(ctx).await)
    }

    /// 优雅停机：停止接入并等待连接排空，`ctx` 到期后强制关闭剩余连接。
    pub async fn shutdown(&self, ctx: &CallContext) -> Result<()> {
        dispatch_server!(self, inner => inner.shutdown(ctx).await)
    }

    pub fn close(&self) -> Result<()> {
        dispatch_server!(self, inner => inner.close())
    }

    pub fn as_tcp(&self) -> Option<&TcpServer> {
        match self {
            SocketServer::Tcp(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_udp(&self) -> Option<&UdpServer> {
        match self {
            SocketServer::Udp(inner) => Some(inner),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub fn as_unix(&self) -> Option<&UnixServer> {
        match self {
            SocketServer::Unix(inner) => Some(inner),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub fn as_unixgram(&self) -> Option<&UnixgramServer> {
        match self {
            SocketServer::Unixgram(inner) => Some(inner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_protocols_are_available_except_local_paths_off_unix() {
        for protocol in NetworkProtocol::ALL {
            let expected = if protocol.is_local() && !cfg!(unix) {
                Capability::Unsupported
            } else {
                Capability::Available
            };
            assert_eq!(capability(protocol), expected, "协议 {protocol} 的可用性不符");
        }
    }

    #[test]
    fn unknown_descriptor_is_an_error_not_a_capability() {
        let err = capability_of("sctp").unwrap_err();
        assert!(matches!(err, SocketError::UnsupportedProtocol(ref raw) if raw == "sctp"));
        assert_eq!(capability_of(" TCP6 ").unwrap(), Capability::Available);
    }

    #[test]
    fn factory_selects_variant_by_descriptor() {
        let tcp = new_client(ClientConfig::new(NetworkProtocol::Tcp4, "127.0.0.1:80"))
            .unwrap()
            .expect("tcp4 总是可用");
        assert!(tcp.as_tcp().is_some());
        assert_eq!(tcp.protocol(), NetworkProtocol::Tcp4);
        assert!(!tcp.is_connected(), "工厂构造不得发起连接");

        let udp = new_server(
            ServerConfig::new(NetworkProtocol::Udp, "127.0.0.1:0"),
            |_session: Session| async {},
        )
        .unwrap()
        .expect("udp 总是可用");
        assert!(udp.as_udp().is_some());
        assert_eq!(udp.state(), ListenerState::Idle, "工厂构造不得绑定地址");
    }

    #[cfg(not(unix))]
    #[test]
    fn local_paths_yield_none_without_unix_sockets() {
        let client = new_client(ClientConfig::new(NetworkProtocol::Unix, "spark.sock")).unwrap();
        assert!(client.is_none());
        let server = new_server(
            ServerConfig::new(NetworkProtocol::Unixgram, "spark.sock"),
            |_session: Session| async {},
        )
        .unwrap();
        assert!(server.is_none());
    }
}
