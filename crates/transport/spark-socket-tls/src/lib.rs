#![doc = r#"
# spark-socket-tls

## 设计动机（Why）
- **安全入口**：为 TCP 与 Unix Stream 两类字节流提供 TLS 包装，客户端与服务端共用同一套握手入口；
- **热更新**：[`ReloadableTlsConfig`] 依托 `ArcSwapOption` 在不中断现有连接的情况下替换证书或信任根。

## 核心契约（What）
- [`connect`]/[`accept`]：在 [`CallContext`](spark_socket_core::CallContext) 约束下完成握手，返回 [`MaybeTls`]；
- [`MaybeTls`]：明文与加密流的统一载体，`shutdown` 发送 `close_notify` 后仍可继续读取；
- 握手失败统一为 `spark.socket.tls_handshake_failed`，内嵌的 `rustls::Error` 决定 Security/Retryable 等分类。

## 实现策略（How）
- 使用 `rustls` + `tokio-rustls` 完成异步握手与数据加解密；
- 每次握手都从 [`TlsConfigProvider`](spark_socket_core::TlsConfigProvider) 重新读取配置。

## 风险与考量（Trade-offs）
- 数据报协议不支持 TLS，配置校验阶段即被拒绝，本 crate 不做处理；
- Unix 套接字没有主机名，握手必须显式提供服务器名。
"#]
#![deny(unsafe_code)]

mod context;
mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::ReloadableTlsConfig;
pub use stream::{
    HANDSHAKE_TIMEOUT, MaybeTls, accept, connect, upgrade_client, upgrade_server,
};
