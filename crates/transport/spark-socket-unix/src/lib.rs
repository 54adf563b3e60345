#![doc = r#"
# spark-socket-unix

## 设计动机（Why）
- 为 `unix`（字节流）与 `unixgram`（数据报）描述符提供本地套接字能力，运行时完全复用 `spark-socket-core`；
- 本地套接字以文件系统路径寻址，监听端必须管理套接字文件的整个生命周期。

## 核心契约（What）
- 监听前删除路径上的遗留文件，绑定后设置配置的权限位（默认 `0o770`）与属组，监听器释放时删除文件；
- `unixgram` 客户端在临时目录绑定唯一路径以便接收回复，连接释放时删除；
- `unix` 字节流支持 TLS，握手使用配置中显式给出的服务器名；
- 仅在 `cfg(unix)` 平台编译，其他平台上的描述符由工厂报告为不支持。

## 风险与考量（Trade-offs）
- 修改属组要求进程属于目标组（或具有相应特权），失败时监听返回 `spark.socket.configure_failed`；
- 数据报服务端无法回复未绑定路径的发送方，回复写入返回 `AddrNotAvailable`。
"#]
#![cfg(unix)]
#![deny(unsafe_code)]

mod datagram;
mod file;
mod stream;

pub use datagram::{UnixgramAcceptor, UnixgramBinder, UnixgramDialer, UnixgramIo};
pub use stream::{UnixAcceptor, UnixBinder, UnixDialer};

use spark_socket_core::{
    Client, ClientConfig, ConnectionHandler, NetworkProtocol, Result, Server, ServerConfig,
    SocketError,
};

pub type UnixClient = Client<UnixDialer>;
pub type UnixServer = Server<UnixBinder>;
pub type UnixgramClient = Client<UnixgramDialer>;
pub type UnixgramServer = Server<UnixgramBinder>;

fn ensure(network: NetworkProtocol, expected: NetworkProtocol) -> Result<()> {
    if network == expected {
        Ok(())
    } else {
        Err(SocketError::UnsupportedProtocol(network.as_str().to_owned()))
    }
}

pub fn new_stream_client(config: ClientConfig) -> Result<UnixClient> {
    ensure(config.network, NetworkProtocol::Unix)?;
    Client::new(config, UnixDialer)
}

pub fn new_stream_server<H>(config: ServerConfig, handler: H) -> Result<UnixServer>
where
    H: ConnectionHandler,
{
    ensure(config.network, NetworkProtocol::Unix)?;
    Server::new(config, UnixBinder, handler)
}

pub fn new_datagram_client(config: ClientConfig) -> Result<UnixgramClient> {
    ensure(config.network, NetworkProtocol::Unixgram)?;
    Client::new(config, UnixgramDialer)
}

pub fn new_datagram_server<H>(config: ServerConfig, handler: H) -> Result<UnixgramServer>
where
    H: ConnectionHandler,
{
    ensure(config.network, NetworkProtocol::Unixgram)?;
    Server::new(config, UnixgramBinder, handler)
}
