#![doc = r#"
# spark-socket-core

## 设计动机（Why）
- **协议无关**：TCP、UDP、Unix Stream、Unix Datagram 共用一套客户端/服务端运行时，
  传输 crate 只需实现拨号、绑定与原始读写；
- **可观测**：连接状态迁移、监听器生命周期与错误均可通过回调异步投递，调用方路径不被回调拖慢；
- **可控停机**：服务端区分优雅停机与立即关闭，超时后强制回收剩余连接并报告数量。

## 核心契约（What）
- [`NetworkProtocol`]：八种网络描述符及其族群（字节流/数据报）与寻址方式；
- [`ClientConfig`]/[`ServerConfig`]：构造期校验的配置，支持 serde（camelCase 字段）；
- [`Client`]：单条出站连接，`connect`/`read`/`write`/`half_close`/`close`/`once`；
- [`Server`]：`listen`/`shutdown`/`close`，每条入站连接（或每个数据报）交给 [`ConnectionHandler`]；
- [`Registry`]：连接登记与 `open_connections` 计数，终态连接恰好移除一次；
- [`SocketError`]：可克隆的统一错误，带稳定错误码与 [`ErrorCategory`]。

## 实现策略（How）
- 所有阻塞操作经 [`util::run_with_context`] 与 [`CallContext`] 的取消、截止以及连接级关闭信号竞争；
- 连接状态以原子状态机维护（[`AtomicConnectionState`]），终态不可逆；
- 回调由 [`Dispatcher`] 在独立投递任务中按 FIFO 执行，panic 被截获并转为错误事件。

## 风险与考量（Trade-offs）
- 数据报服务端按“每个报文一个会话”分发，`open_connections` 统计的是仍在处理中的报文；
- 关闭时半关闭写出最多等待一个短暂宽限期，对端不读时不会无限阻塞。
"#]
#![deny(unsafe_code)]

pub mod addr;
pub mod callback;
pub mod client;
pub mod config;
pub mod contract;
pub mod datagram;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod stream;
pub mod tls;
pub mod util;

pub use addr::{TransportAddr, resolve_inet, validate_address};
pub use callback::Dispatcher;
pub use client::{Client, ClientHandle, Dialer};
pub use config::{
    ClientConfig, ClientConfigBuilder, ClientTlsConfig, DEFAULT_BUFFER_SIZE, DEFAULT_FILE_MODE,
    FileMode, GroupId, MAX_DATAGRAM_SIZE, MIN_IDLE_TIMEOUT, ServerConfig, ServerConfigBuilder,
    ServerTlsConfig,
};
pub use contract::{CallContext, CallContextBuilder, Cancellation, Deadline};
pub use datagram::DatagramPayload;
pub use error::{ErrorCategory, MAX_GID, Operation, Result, SecurityClass, SocketError};
pub use protocol::{Addressing, NetworkProtocol, SocketFamily};
pub use registry::{ConnectionEntry, ConnectionId, Registry};
pub use server::{
    Acceptor, Binder, FORCE_CLOSE_GRACE, Incoming, RawConn, Server, ServerHandle, UpdateConnFn,
};
pub use session::{ConnectionHandler, Session, SessionIo};
pub use state::{AtomicConnectionState, ConnectionState, ListenerState};
pub use stream::StreamIo;
pub use tls::TlsConfigProvider;
