use futures::future::BoxFuture;
use spark_socket_core::util::{race, run_with_context};
use spark_socket_core::{
    CallContext, ClientConfig, Deadline, Dialer, Operation, Result, SessionIo, SocketError,
    StreamIo, TransportAddr, resolve_inet,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// TCP 拨号器：解析地址、依次尝试候选地址，按配置完成 TLS 握手。
///
/// # 契约（What）
/// - `tcp4`/`tcp6` 只尝试对应地址族的候选，解析不到时返回地址错误；
/// - 取消与截止作用于解析、建连与握手全过程，触发后立即返回且不再尝试后续候选；
/// - 所有候选都失败时返回最后一个建连错误。
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpDialer;

impl TcpDialer {
    async fn connect_any(ctx: &CallContext, candidates: Vec<SocketAddr>) -> Result<TcpStream> {
        let mut last_error = None;
        for candidate in candidates {
            match run_with_context(
                ctx,
                None,
                Deadline::none(),
                Operation::DIAL,
                TcpStream::connect(candidate),
            )
            .await
            {
                Ok(stream) => return Ok(stream),
                Err(error @ (SocketError::Cancelled { .. } | SocketError::Timeout { .. })) => {
                    return Err(error);
                }
                Err(error) => {
                    tracing::debug!(
                        target: "spark_socket::tcp",
                        %candidate,
                        %error,
                        "tcp candidate refused, trying next"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or(SocketError::NotConnected))
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        ctx: &'a CallContext,
        config: &'a ClientConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn SessionIo>>> {
        Box::pin(async move {
            let candidates = race(
                ctx,
                None,
                Deadline::none(),
                Operation::DIAL,
                resolve_inet(config.network, &config.address),
            )
            .await??;
            let stream = Self::connect_any(ctx, candidates).await?;
            // 请求/响应场景下小包延迟比吞吐更敏感。
            let _ = stream.set_nodelay(true);
            let local = stream
                .local_addr()
                .map_err(|err| SocketError::io(Operation::DIAL, err))?;
            let peer = stream
                .peer_addr()
                .map_err(|err| SocketError::io(Operation::DIAL, err))?;
            let stream = spark_socket_tls::upgrade_client(ctx, config, stream).await?;
            let io: Arc<dyn SessionIo> = Arc::new(StreamIo::new(
                stream,
                TransportAddr::Inet(local),
                TransportAddr::Inet(peer),
            ));
            Ok(io)
        })
    }
}
