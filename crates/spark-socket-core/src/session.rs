use crate::addr::TransportAddr;
use crate::callback::Dispatcher;
use crate::contract::{CallContext, Deadline};
use crate::error::{Operation, Result, SocketError};
use crate::registry::{ConnectionEntry, ConnectionId, Registry};
use crate::state::ConnectionState;
use crate::util::{deadline_from, run_with_context};
use bytes::BytesMut;
use futures::future::BoxFuture;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// 关闭时等待半关闭（TLS `close_notify`、FIN）写出的上限。
const CLOSE_FLUSH_GRACE: Duration = Duration::from_millis(250);

/// 已建立连接的原始 IO 能力，由各传输实现。
///
/// - 字节流：`write` 写满整个缓冲区后返回，`half_close` 关闭写方向；
/// - 数据报：`write` 对应一次独立发送，`half_close` 为空操作；
/// - 实现不需要处理取消与超时，调用方会统一竞争上下文。
pub trait SessionIo: Send + Sync + 'static {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;
    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;
    fn half_close(&self) -> BoxFuture<'_, io::Result<()>>;
    fn local_addr(&self) -> TransportAddr;
    fn peer_addr(&self) -> TransportAddr;

    /// 每次写出一个完整报文；被打断的写入不会留下半个报文。
    fn is_datagram(&self) -> bool {
        false
    }
}

/// 一条已登记连接：IO 句柄、Registry 记录与事件分发的绑定。
///
/// 客户端与服务端会话共享这一实现，因此四种协议在状态迁移、故障上报与
/// “终态即移除”上的行为完全一致。
pub(crate) struct Link {
    io: Arc<dyn SessionIo>,
    entry: Arc<ConnectionEntry>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
}

impl Link {
    pub(crate) fn new(
        io: Arc<dyn SessionIo>,
        entry: Arc<ConnectionEntry>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            io,
            entry,
            dispatcher,
            registry,
        }
    }

    pub(crate) fn entry(&self) -> &Arc<ConnectionEntry> {
        &self.entry
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.entry.state()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.entry.state().is_usable() && !self.entry.closer().is_cancelled()
    }

    fn transition(&self, next: ConnectionState) -> bool {
        match self.entry.transition(next) {
            Ok(_) => {
                self.dispatcher
                    .emit_info(self.entry.local(), self.entry.remote(), next);
                true
            }
            Err(_) => false,
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SocketError::NotConnected)
        }
    }

    /// 释放登记：发出关闭信号并从 Registry 移除（幂等）。
    fn release(&self) {
        self.entry.force_close();
        if self.registry.remove(self.entry.id()).is_some() {
            tracing::debug!(
                target: "spark_socket::registry",
                id = %self.entry.id(),
                state = %self.entry.state(),
                open = self.registry.len(),
                "connection released"
            );
        }
    }

    /// 处理读写期间的错误：本端关闭引起的噪声直接转为 `NotConnected`，
    /// 超时与取消只上报不终结（字节流写超时除外，见 [`Link::write`]），其余一律视为故障并终结连接。
    fn on_error(&self, error: SocketError) -> SocketError {
        match error {
            SocketError::Cancelled { .. } => error,
            SocketError::NotConnected => SocketError::NotConnected,
            SocketError::Timeout { .. } => {
                self.dispatcher.emit_error(error.clone());
                error
            }
            error if error.is_closed_connection() && self.entry.closer().is_cancelled() => {
                SocketError::NotConnected
            }
            error => {
                self.fault(error.clone());
                error
            }
        }
    }

    /// 将连接迁移到 `Faulted`，上报错误并释放登记。
    pub(crate) fn fault(&self, error: SocketError) {
        if self.transition(ConnectionState::Faulted) {
            self.dispatcher.emit_error(error);
        }
        self.release();
    }

    pub(crate) async fn read(
        &self,
        ctx: &CallContext,
        deadline: Deadline,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.ensure_usable()?;
        self.transition(ConnectionState::Reading);
        let outcome = run_with_context(
            ctx,
            Some(self.entry.closer()),
            deadline,
            Operation::READ,
            self.io.read(buf),
        )
        .await;
        outcome.map_err(|error| self.on_error(error))
    }

    pub(crate) async fn write(
        &self,
        ctx: &CallContext,
        deadline: Deadline,
        buf: &[u8],
    ) -> Result<usize> {
        self.ensure_usable()?;
        self.transition(ConnectionState::Writing);
        let outcome = run_with_context(
            ctx,
            Some(self.entry.closer()),
            deadline,
            Operation::WRITE,
            self.io.write(buf),
        )
        .await;
        outcome.map_err(|error| match error {
            // 字节流上被截止打断的写入可能已送出一部分，后续字节无法再对齐。
            SocketError::Timeout { .. } if !self.io.is_datagram() => {
                self.fault(error.clone());
                error
            }
            error => self.on_error(error),
        })
    }

    pub(crate) async fn half_close(&self, ctx: &CallContext, deadline: Deadline) -> Result<()> {
        self.ensure_usable()?;
        let outcome = run_with_context(
            ctx,
            Some(self.entry.closer()),
            deadline,
            Operation::HALF_CLOSE,
            self.io.half_close(),
        )
        .await;
        outcome.map_err(|error| self.on_error(error))
    }

    /// 读到对端结束为止。
    pub(crate) async fn read_to_end(
        &self,
        ctx: &CallContext,
        timeout: Option<Duration>,
        chunk_size: usize,
    ) -> Result<BytesMut> {
        let mut chunk = vec![0u8; chunk_size];
        let mut collected = BytesMut::with_capacity(chunk_size);
        loop {
            let read = self.read(ctx, deadline_from(timeout), &mut chunk).await?;
            if read == 0 {
                return Ok(collected);
            }
            collected.extend_from_slice(&chunk[..read]);
        }
    }

    /// 关闭连接。
    ///
    /// - 已处于终态：仅释放登记，`Faulted` 保持不变；
    /// - 正常路径：`Closing` → 尽力写出半关闭 → `Closed`；
    /// - 已被强制回收（`closer` 先被触发）：跳过写出，直接 `Closed`。
    pub(crate) async fn close(&self) -> Result<()> {
        if self.state().is_terminal() {
            self.release();
            return Ok(());
        }
        let forced = self.entry.closer().is_cancelled();
        if self.transition(ConnectionState::Closing) {
            self.entry.force_close();
            if !forced
                && let Ok(Err(error)) =
                    tokio::time::timeout(CLOSE_FLUSH_GRACE, self.io.half_close()).await
            {
                tracing::trace!(
                    target: "spark_socket::registry",
                    id = %self.entry.id(),
                    %error,
                    "half-close during close failed"
                );
            }
            self.transition(ConnectionState::Closed);
        }
        self.release();
        Ok(())
    }
}

/// 服务端单条连接（或单个数据报）的会话，处理函数通过它读写。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 克隆体共享同一连接；处理函数返回后连接会被自动关闭；
/// - 关闭之后（无论本端、对端还是服务端强制回收）读写返回 [`SocketError::NotConnected`]；
/// - 读取受服务端 `idle_timeout` 约束；读写故障会终结连接并经错误回调上报；
/// - 数据报会话：`read` 先返回报文内容，随后返回 `0`；`write` 回复给发送方。
#[derive(Clone)]
pub struct Session {
    link: Arc<Link>,
    idle_timeout: Option<Duration>,
}

impl Session {
    pub(crate) fn new(link: Arc<Link>, idle_timeout: Option<Duration>) -> Self {
        Self { link, idle_timeout }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.entry().id()
    }

    pub fn local_addr(&self) -> TransportAddr {
        self.link.io.local_addr()
    }

    pub fn peer_addr(&self) -> TransportAddr {
        self.link.io.peer_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_with(&CallContext::background(), buf).await
    }

    pub async fn read_with(&self, ctx: &CallContext, buf: &mut [u8]) -> Result<usize> {
        self.link
            .read(ctx, deadline_from(self.idle_timeout), buf)
            .await
    }

    /// 读到对端半关闭（或数据报结束）为止。
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let collected = self
            .link
            .read_to_end(
                &CallContext::background(),
                self.idle_timeout,
                crate::config::DEFAULT_BUFFER_SIZE,
            )
            .await?;
        Ok(collected.to_vec())
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.write_with(&CallContext::background(), buf).await
    }

    pub async fn write_with(&self, ctx: &CallContext, buf: &[u8]) -> Result<usize> {
        self.link.write(ctx, Deadline::none(), buf).await
    }

    pub async fn half_close(&self) -> Result<()> {
        self.link
            .half_close(&CallContext::background(), Deadline::none())
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.link.close().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("local", &self.link.entry().local())
            .field("remote", &self.link.entry().remote())
            .field("state", &self.state())
            .finish()
    }
}

/// 连接处理函数。闭包 `Fn(Session) -> impl Future<Output = ()>` 自动实现该 trait。
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, session: Session) -> BoxFuture<'static, ()>;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, session: Session) -> BoxFuture<'static, ()> {
        Box::pin(self(session))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::DuplexIo;
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn link(registry: &Arc<Registry>) -> (Arc<Link>, tokio::io::DuplexStream) {
        let (io, peer) = DuplexIo::pair();
        let entry = Arc::new(ConnectionEntry::new(
            io.local_addr(),
            io.peer_addr(),
            ConnectionState::Established,
        ));
        registry.insert(Arc::clone(&entry));
        let link = Link::new(
            io,
            entry,
            Arc::new(Dispatcher::new("test")),
            Arc::clone(registry),
        );
        (Arc::new(link), peer)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_and_releases_once() {
        let registry = Arc::new(Registry::new());
        let (link, mut peer) = link(&registry);
        link.write(&CallContext::background(), Deadline::none(), b"hi")
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        link.close().await.unwrap();
        link.close().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Closed);
        assert_eq!(registry.len(), 0);

        let err = link
            .read(&CallContext::background(), Deadline::none(), &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, SocketError::NotConnected), "关闭后读取应返回 NotConnected");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_close_interrupts_pending_read() {
        let registry = Arc::new(Registry::new());
        let (link, _peer) = link(&registry);
        let reader = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                link.read(&CallContext::background(), Deadline::none(), &mut buf)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.force_close_all(), 1);
        let outcome = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("强制关闭必须唤醒挂起的读取")
            .unwrap();
        assert!(matches!(outcome, Err(SocketError::NotConnected)));
        link.close().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn faulted_connection_stays_faulted_after_close() {
        let registry = Arc::new(Registry::new());
        let (link, _peer) = link(&registry);
        link.fault(SocketError::io(
            Operation::READ,
            io::Error::from(io::ErrorKind::ConnectionReset),
        ));
        assert_eq!(registry.len(), 0, "故障终态同样需要释放登记");
        link.close().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Faulted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_to_end_collects_until_eof() {
        let registry = Arc::new(Registry::new());
        let (link, mut peer) = link(&registry);
        peer.write_all(b"hello ").await.unwrap();
        peer.write_all(b"world").await.unwrap();
        peer.shutdown().await.unwrap();
        drop(peer);
        let body = link
            .read_to_end(&CallContext::background(), None, 4)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello world");
        assert_eq!(link.state(), ConnectionState::Reading);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stream_write_timeout_faults_connection() {
        let registry = Arc::new(Registry::new());
        let (link, _peer) = link(&registry);
        // 对端不读，内存管道写满后挂起。
        let payload = vec![7u8; 8 * 1024];
        let err = link
            .write(
                &CallContext::background(),
                Deadline::after(Duration::from_millis(50)),
                &payload,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SocketError::Timeout { .. }), "实际错误：{err:?}");
        assert_eq!(link.state(), ConnectionState::Faulted, "部分写出的字节流不可再用");
        assert!(registry.is_empty(), "故障后必须释放登记");
        assert!(matches!(
            link.write(&CallContext::background(), Deadline::none(), b"x")
                .await,
            Err(SocketError::NotConnected)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_timeout_keeps_stream_usable() {
        let registry = Arc::new(Registry::new());
        let (link, mut peer) = link(&registry);
        let mut buf = [0u8; 4];
        let err = link
            .read(
                &CallContext::background(),
                Deadline::after(Duration::from_millis(30)),
                &mut buf,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SocketError::Timeout { .. }));
        assert!(link.is_connected(), "读超时不会丢失任何字节");
        peer.write_all(b"late").await.unwrap();
        link.read(&CallContext::background(), Deadline::none(), &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"late");
    }
}
