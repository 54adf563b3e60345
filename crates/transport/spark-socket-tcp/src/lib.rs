#![doc = r#"
# spark-socket-tcp

## 设计动机（Why）
- 为 `tcp`、`tcp4`、`tcp6` 三种描述符提供拨号与监听能力，客户端/服务端运行时完全复用
  `spark-socket-core`；
- TLS 通过 `spark-socket-tls` 在字节流之上按配置叠加，明文与加密路径共享同一套读写实现。

## 核心契约（What）
- [`TcpClient`]/[`TcpServer`]：核心运行时在 TCP 上的具体化；
- [`new_client`]/[`new_server`]：校验描述符属于 TCP 家族并完成构造期校验；
- 半关闭即 `shutdown(Write)`，对端随后读到 EOF，本端仍可继续读取。

## 风险与考量（Trade-offs）
- 每条连接默认开启 `TCP_NODELAY`；
- 服务端 TLS 握手在连接任务中完成，受固定时限约束，失败的握手计入错误回调但不影响监听。
"#]
#![deny(unsafe_code)]

mod dialer;
mod listener;

pub use dialer::TcpDialer;
pub use listener::{TcpAcceptor, TcpBinder};

use spark_socket_core::{
    Client, ClientConfig, ConnectionHandler, NetworkProtocol, Result, Server, ServerConfig,
    SocketError,
};

pub type TcpClient = Client<TcpDialer>;
pub type TcpServer = Server<TcpBinder>;

fn ensure_tcp(network: NetworkProtocol) -> Result<()> {
    if network.is_stream() && !network.is_local() {
        Ok(())
    } else {
        Err(SocketError::UnsupportedProtocol(network.as_str().to_owned()))
    }
}

/// 构造 TCP 客户端；不会发起连接。
pub fn new_client(config: ClientConfig) -> Result<TcpClient> {
    ensure_tcp(config.network)?;
    Client::new(config, TcpDialer)
}

/// 构造 TCP 服务端；不会绑定端口。
pub fn new_server<H>(config: ServerConfig, handler: H) -> Result<TcpServer>
where
    H: ConnectionHandler,
{
    ensure_tcp(config.network)?;
    Server::new(config, TcpBinder, handler)
}
