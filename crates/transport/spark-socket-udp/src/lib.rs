#![doc = r#"
# spark-socket-udp

## 模块使命（Why）
- 为 `udp`、`udp4`、`udp6` 三种描述符提供数据报客户端与服务端，运行时完全复用 `spark-socket-core`；
- 无连接传输也遵循与字节流相同的状态机、回调与停机语义，调用方无需区分协议编写两套逻辑。

## 核心契约（What）
- 客户端：绑定同地址族的临时端口后 `connect` 到目标，`write` 即一次独立发送，`read` 接收一个报文；
  `half_close` 为空操作；
- 服务端：每个入站报文分发为一个 [`Session`](spark_socket_core::Session)，首次读取得到报文内容，
  此后读取返回 `0`；`write` 以 `send_to` 回复给发送方；
- 报文上限为 [`MAX_DATAGRAM_SIZE`](spark_socket_core::MAX_DATAGRAM_SIZE)，超出接收缓冲区的部分被截断；
- 不支持 TLS，配置校验阶段即被拒绝。

## 实现策略（How）
- 收发直接委托给 Tokio `UdpSocket`；服务端套接字以 `Arc` 在各报文会话之间共享，用于回复。
"#]
#![deny(unsafe_code)]

mod dialer;
mod listener;

pub use dialer::{UdpDialer, UdpIo};
pub use listener::{UdpAcceptor, UdpBinder};

use spark_socket_core::{
    Client, ClientConfig, ConnectionHandler, NetworkProtocol, Result, Server, ServerConfig,
    SocketError,
};

pub type UdpClient = Client<UdpDialer>;
pub type UdpServer = Server<UdpBinder>;

fn ensure_udp(network: NetworkProtocol) -> Result<()> {
    if network.is_datagram() && !network.is_local() {
        Ok(())
    } else {
        Err(SocketError::UnsupportedProtocol(network.as_str().to_owned()))
    }
}

/// 构造 UDP 客户端；不会绑定任何端口。
pub fn new_client(config: ClientConfig) -> Result<UdpClient> {
    ensure_udp(config.network)?;
    Client::new(config, UdpDialer)
}

/// 构造 UDP 服务端；不会绑定任何端口。
pub fn new_server<H>(config: ServerConfig, handler: H) -> Result<UdpServer>
where
    H: ConnectionHandler,
{
    ensure_udp(config.network)?;
    Server::new(config, UdpBinder, handler)
}
