use rustls::pki_types::ServerName;
use spark_socket_core::util::run_with_context;
use spark_socket_core::{
    CallContext, ClientConfig, Deadline, Operation, Result, SocketError, TlsConfigProvider,
};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

/// 明文或已完成握手的 TLS 字节流。
///
/// 传输 crate 以同一类型承载两种情况，`StreamIo<MaybeTls<S>>` 即可覆盖
/// “TCP/Unix ± TLS”的全部组合。
pub enum MaybeTls<S> {
    Plain(S),
    Client(Box<client::TlsStream<S>>),
    Server(Box<server::TlsStream<S>>),
}

impl<S> MaybeTls<S> {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, MaybeTls::Plain(_))
    }
}

impl<S> AsyncRead for MaybeTls<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTls::Client(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            MaybeTls::Server(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for MaybeTls<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTls::Client(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            MaybeTls::Server(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTls::Client(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            MaybeTls::Server(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    /// TLS 一侧先发送 `close_notify` 再关闭底层写方向，读方向保持可用。
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTls::Client(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            MaybeTls::Server(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// 客户端握手。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. 从提供方取得当前客户端配置（每次握手都重新读取，证书轮换即时生效）；
/// 2. 将服务器名解析为 SNI，非法名称视为配置错误；
/// 3. 握手受 `ctx` 的取消与截止约束，失败包装为 `Operation::HANDSHAKE` 的 IO 错误，
///    其中内嵌的 `rustls::Error` 决定错误分类。
///
/// ## 契约（What）
/// - 取消或超时时底层流随 Future 一同释放，不会遗留半握手连接。
pub async fn connect<S>(
    ctx: &CallContext,
    provider: &dyn TlsConfigProvider,
    server_name: &str,
    stream: S,
) -> Result<MaybeTls<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = provider.client_config()?;
    let name = ServerName::try_from(server_name.to_owned()).map_err(|err| {
        SocketError::TlsConfig(format!("invalid tls server name `{server_name}`: {err}").into())
    })?;
    let connector = TlsConnector::from(config);
    let stream = run_with_context(
        ctx,
        None,
        Deadline::none(),
        Operation::HANDSHAKE,
        connector.connect(name, stream),
    )
    .await?;
    tracing::debug!(
        target: "spark_socket::tls",
        server_name,
        version = ?stream.get_ref().1.protocol_version(),
        "client handshake completed"
    );
    Ok(MaybeTls::Client(Box::new(stream)))
}

/// 服务端握手，语义与 [`connect`] 对称。
pub async fn accept<S>(
    ctx: &CallContext,
    provider: &dyn TlsConfigProvider,
    stream: S,
) -> Result<MaybeTls<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let acceptor = TlsAcceptor::from(provider.server_config()?);
    let stream = run_with_context(
        ctx,
        None,
        Deadline::none(),
        Operation::HANDSHAKE,
        acceptor.accept(stream),
    )
    .await?;
    let connection = stream.get_ref().1;
    tracing::debug!(
        target: "spark_socket::tls",
        sni = connection.server_name().unwrap_or("-"),
        version = ?connection.protocol_version(),
        "server handshake completed"
    );
    Ok(MaybeTls::Server(Box::new(stream)))
}

/// 服务端握手的默认时限；握手在连接任务中进行，不阻塞 accept 循环。
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 按客户端配置决定是否发起握手；未开启 TLS 时原样返回明文流。
pub async fn upgrade_client<S>(
    ctx: &CallContext,
    config: &ClientConfig,
    stream: S,
) -> Result<MaybeTls<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(provider) = config.tls_provider() else {
        return Ok(MaybeTls::Plain(stream));
    };
    let server_name = config.tls_server_name().ok_or_else(|| {
        SocketError::TlsConfig("tls over a socket path requires an explicit server name".into())
    })?;
    connect(ctx, provider.as_ref(), &server_name, stream).await
}

/// 服务端对应入口：有提供方时在 [`HANDSHAKE_TIMEOUT`] 内完成握手。
pub async fn upgrade_server<S>(
    provider: Option<&Arc<dyn TlsConfigProvider>>,
    stream: S,
) -> Result<MaybeTls<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match provider {
        Some(provider) => {
            accept(
                &CallContext::with_timeout(HANDSHAKE_TIMEOUT),
                provider.as_ref(),
                stream,
            )
            .await
        }
        None => Ok(MaybeTls::Plain(stream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ReloadableTlsConfig;
    use crate::testing;
    use spark_socket_core::{ErrorCategory, SecurityClass};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_then_half_close_still_reads_reply() {
        let identity = testing::SelfSigned::generate("localhost").unwrap();
        let server_ctx = ReloadableTlsConfig::server(identity.server_config());
        let client_ctx = ReloadableTlsConfig::client(identity.client_config().unwrap());
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut stream = accept(&CallContext::background(), &server_ctx, server_io)
                .await
                .unwrap();
            assert!(stream.is_encrypted());
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            stream.write_all(&request).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = connect(
            &CallContext::background(),
            &client_ctx,
            "localhost",
            client_io,
        )
        .await
        .unwrap();
        stream.write_all(b"hello tls").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"hello tls", "半关闭后仍应读到对端回写");
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn untrusted_certificate_is_a_security_error() {
        let served = testing::SelfSigned::generate("localhost").unwrap();
        let other = testing::SelfSigned::generate("localhost").unwrap();
        let server_ctx = ReloadableTlsConfig::server(served.server_config());
        let client_ctx = ReloadableTlsConfig::client(other.client_config().unwrap());
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let _ = accept(&CallContext::background(), &server_ctx, server_io).await;
        });
        let err = match connect(
            &CallContext::background(),
            &client_ctx,
            "localhost",
            client_io,
        )
        .await
        {
            Ok(_) => panic!("不受信任的证书必须握手失败"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "spark.socket.tls_handshake_failed");
        assert!(matches!(
            err.category(),
            ErrorCategory::Security(SecurityClass::Authentication)
        ));
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_honours_deadline() {
        let identity = testing::SelfSigned::generate("localhost").unwrap();
        let client_ctx = ReloadableTlsConfig::client(identity.client_config().unwrap());
        // 对端从不应答。
        let (client_io, _silent) = tokio::io::duplex(1024);
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let err = match connect(&ctx, &client_ctx, "localhost", client_io).await {
            Ok(_) => panic!("对端沉默时握手不应成功"),
            Err(err) => err,
        };
        assert!(matches!(err, SocketError::Timeout { op } if op == Operation::HANDSHAKE));
    }

    #[tokio::test]
    async fn invalid_server_name_is_rejected_before_io() {
        let identity = testing::SelfSigned::generate("localhost").unwrap();
        let client_ctx = ReloadableTlsConfig::client(identity.client_config().unwrap());
        let (client_io, _peer) = tokio::io::duplex(1024);
        let err = match connect(&CallContext::background(), &client_ctx, "bad name!", client_io)
            .await
        {
            Ok(_) => panic!("非法 SNI 应被拒绝"),
            Err(err) => err,
        };
        assert!(matches!(err, SocketError::TlsConfig(_)));
    }
}
