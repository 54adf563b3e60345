use crate::addr::TransportAddr;
use crate::callback::Dispatcher;
use crate::config::ServerConfig;
use crate::contract::{CallContext, Cancellation, Deadline};
use crate::error::{ErrorCategory, Operation, Result, SocketError};
use crate::registry::{ConnectionEntry, Registry};
use crate::session::{ConnectionHandler, Link, Session, SessionIo};
use crate::state::{ConnectionState, ListenerState};
use crate::util::race;
use arc_swap::ArcSwapOption;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// 排空等待时检查连接计数的间隔。
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// 停机超时强制关闭后，等待连接任务退出的上限。
pub const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);
/// 非重试类 accept 错误后的退避。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 交给连接调整回调的原始套接字，用于设置协议特有的套接字选项。
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum RawConn<'a> {
    Tcp(&'a tokio::net::TcpStream),
    Udp(&'a tokio::net::UdpSocket),
    #[cfg(unix)]
    Unix(&'a tokio::net::UnixStream),
    #[cfg(unix)]
    Unixgram(&'a tokio::net::UnixDatagram),
}

/// 连接调整回调：字节流协议对每条入站连接调用一次，数据报协议在绑定后对监听套接字调用一次。
pub type UpdateConnFn = dyn Fn(RawConn<'_>) + Send + Sync;

struct UpdateConn(Box<UpdateConnFn>);

/// 一次接受得到的入站连接（或数据报），握手等收尾工作在连接自己的任务中完成。
pub trait Incoming: Send + 'static {
    fn local_addr(&self) -> TransportAddr;
    fn peer_addr(&self) -> TransportAddr;

    /// 在握手与处理函数之前把原始连接交给调整回调；没有独立连接的传输保持默认空实现。
    fn update_conn(&self, _hook: &UpdateConnFn) {}

    fn establish(self: Box<Self>) -> BoxFuture<'static, Result<Arc<dyn SessionIo>>>;
}

/// 已绑定的监听端点；被丢弃时释放监听资源（包括删除套接字文件）。
pub trait Acceptor: Send + Sync + 'static {
    fn local_addr(&self) -> TransportAddr;

    /// 绑定后、开始接受前调用一次；数据报传输借此调整共享的监听套接字。
    fn update_conn(&self, _hook: &UpdateConnFn) {}

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn Incoming>>>;
}

/// 传输层绑定能力。
pub trait Binder: Send + Sync + 'static {
    type Acceptor: Acceptor;

    fn bind<'a>(&'a self, config: &'a ServerConfig) -> BoxFuture<'a, Result<Self::Acceptor>>;
}

/// 协议无关的服务端。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 字节流与数据报服务端共用同一套“接受 → 分发 → 排空”流程，协议差异只在 [`Binder`]/[`Acceptor`] 中；
/// - 优雅停机（[`Server::shutdown`]）与立即关闭（[`Server::close`]）是两个独立的终止操作，
///   监听器状态机的终态迁移因此没有歧义。
///
/// ## 状态机（What）
/// `Idle → Listening → Draining → Stopped`；`Idle` 上直接停机会跳到 `Stopped`。停止后的服务端不能再次监听。
///
/// ## 状态存储
/// - 构造后只读：`config`、`binder`、`handler`；
/// - 运行期可变：监听器状态（`watch`）、accept 循环是否存活（原子布尔）、绑定地址（`ArcSwapOption`）、
///   Registry（分片映射 + 原子计数）、回调（`Dispatcher`）。
///
/// ## 契约
/// - 每条入站连接在独立任务中交给处理函数，服务端不等待处理函数即可继续接受；
/// - `open_connections` 在接受时加一，在连接进入终态时恰好减一；
/// - 处理函数 panic 会被截获，连接转为 `Faulted` 并经错误回调上报，不影响其它连接。
pub struct Server<B: Binder> {
    inner: Arc<ServerInner<B>>,
}

struct ServerInner<B: Binder> {
    config: ServerConfig,
    binder: B,
    handler: Arc<dyn ConnectionHandler>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    state: watch::Sender<ListenerState>,
    running: AtomicBool,
    stop: Cancellation,
    local: ArcSwapOption<TransportAddr>,
    update: ArcSwapOption<UpdateConn>,
}

impl<B: Binder> Clone for Server<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Binder> Server<B> {
    /// 校验配置并构造服务端；此时不会绑定任何端口或文件。
    pub fn new<H>(config: ServerConfig, binder: B, handler: H) -> Result<Self>
    where
        H: ConnectionHandler,
    {
        config.validate()?;
        let (state, _) = watch::channel(ListenerState::Idle);
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                binder,
                handler: Arc::new(handler),
                dispatcher: Arc::new(Dispatcher::new("server")),
                registry: Arc::new(Registry::new()),
                state,
                running: AtomicBool::new(false),
                stop: Cancellation::new(),
                local: ArcSwapOption::empty(),
                update: ArcSwapOption::empty(),
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn register_func_error<F>(&self, f: F)
    where
        F: Fn(&[SocketError]) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_func_error(f);
    }

    pub fn register_func_info<F>(&self, f: F)
    where
        F: Fn(&TransportAddr, &TransportAddr, ConnectionState) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_func_info(f);
    }

    /// 注册监听器生命周期消息回调。
    pub fn register_func_info_server<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_func_info_server(f);
    }

    /// 注册连接调整回调（例如设置 TTL、缓冲区大小等套接字选项）。
    ///
    /// 字节流协议对之后接受的每条连接生效；数据报协议只在绑定时调用，需在 `listen` 之前注册。
    /// 回调 panic 时对应连接转为 `Faulted` 并经错误回调上报。
    pub fn register_update_conn<F>(&self, f: F)
    where
        F: Fn(RawConn<'_>) + Send + Sync + 'static,
    {
        self.inner
            .update
            .store(Some(Arc::new(UpdateConn(Box::new(f)))));
    }

    pub fn handle(&self) -> ServerHandle<B> {
        ServerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.inner.state.borrow()
    }

    /// accept 循环是否存活。
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// 已启动过、accept 循环已停止且没有存活连接。
    pub fn is_gone(&self) -> bool {
        self.inner.is_gone()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.registry.len()
    }

    /// 实际绑定的地址（端口 0 时为系统分配的端口）。
    pub fn local_addr(&self) -> Option<TransportAddr> {
        self.inner.local.load_full().map(|addr| (*addr).clone())
    }

    /// 等待 accept 循环启动并返回绑定地址；服务端已停止时返回 [`SocketError::ServerClosed`]。
    pub async fn wait_listening(&self) -> Result<TransportAddr> {
        loop {
            if self.is_running()
                && let Some(addr) = self.local_addr()
            {
                return Ok(addr);
            }
            if matches!(
                self.state(),
                ListenerState::Draining | ListenerState::Stopped
            ) {
                return Err(SocketError::ServerClosed);
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// 完成信号：服务端进入 `Stopped` 且全部连接已释放后返回。
    pub async fn done(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            if *state.borrow_and_update() == ListenerState::Stopped && self.inner.is_gone() {
                return;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }

    /// 绑定并运行 accept 循环，直到服务端停止或 `ctx` 被取消后返回。
    ///
    /// # 逻辑（How）
    /// 1. `Idle → Listening`，重复监听返回 [`SocketError::AlreadyListening`]，
    ///    已停止的服务端返回 [`SocketError::ServerClosed`]；
    /// 2. 绑定受 `ctx`（取消与截止）约束，失败时回到 `Idle` 并经错误回调上报；
    /// 3. accept 循环响应停机、`ctx` 取消与 `ctx` 截止；每条连接在独立任务中处理；
    /// 4. 循环结束（包括 `listen` 的 future 被丢弃）后先释放监听端点（Unix 套接字文件随之删除），
    ///    再由收尾守卫标记循环停止；
    /// 5. 若不是由停机触发，进入 `Draining`，剩余连接在后台自然排空后转为 `Stopped`。
    pub async fn listen(&self, ctx: &CallContext) -> Result<()> {
        let inner = &self.inner;
        let mut previous = ListenerState::Idle;
        let claimed = inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == ListenerState::Idle {
                *state = ListenerState::Listening;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match previous {
                ListenerState::Listening => SocketError::AlreadyListening,
                _ => SocketError::ServerClosed,
            });
        }

        let bound = race(
            ctx,
            Some(&inner.stop),
            Deadline::none(),
            Operation::BIND,
            inner.binder.bind(&inner.config),
        )
        .await;
        let acceptor = match bound {
            Ok(Ok(acceptor)) => acceptor,
            Ok(Err(error)) | Err(error) => {
                let error = if inner.stop.is_cancelled() {
                    SocketError::ServerClosed
                } else {
                    error
                };
                inner.state.send_if_modified(|state| {
                    if *state == ListenerState::Listening {
                        *state = ListenerState::Idle;
                        true
                    } else {
                        false
                    }
                });
                if !matches!(
                    error,
                    SocketError::Cancelled { .. } | SocketError::ServerClosed
                ) {
                    inner.dispatcher.emit_error(error.clone());
                }
                return Err(error);
            }
        };

        let local = acceptor.local_addr();
        if let Some(hook) = inner.update.load_full()
            && let Err(payload) = catch_unwind(AssertUnwindSafe(|| acceptor.update_conn(&*hook.0)))
        {
            inner.dispatcher.emit_error(SocketError::panicked(payload));
        }
        inner.local.store(Some(Arc::new(local.clone())));
        inner.running.store(true, Ordering::Release);
        inner.dispatcher.emit_server_info(format!(
            "{} server listening on {local}",
            inner.config.network
        ));
        let guard = ListenGuard {
            inner: Arc::clone(inner),
            acceptor: Some(acceptor),
            local,
        };
        if let Some(acceptor) = guard.acceptor.as_ref() {
            Arc::clone(inner).accept_loop(ctx, acceptor).await;
        }
        drop(guard);
        Ok(())
    }

    /// 优雅停机：立即停止接受，等待连接计数归零或 `ctx` 到期。
    ///
    /// - 排空完成返回 `Ok(())`；
    /// - `ctx` 截止到期：强制关闭剩余连接，在 [`FORCE_CLOSE_GRACE`] 内等待它们退出，
    ///   返回 [`SocketError::ShutdownTimeout`]；
    /// - `ctx` 被取消：同样强制关闭，返回取消错误。
    pub async fn shutdown(&self, ctx: &CallContext) -> Result<()> {
        let inner = &self.inner;
        inner.begin_stop();
        let drained = race(
            ctx,
            None,
            Deadline::none(),
            Operation::SHUTDOWN,
            inner.wait_drained(),
        )
        .await;
        match drained {
            Ok(()) => {
                inner.mark_stopped();
                Ok(())
            }
            Err(error) => {
                let remaining = inner.registry.len();
                let forced = inner.registry.force_close_all();
                tracing::warn!(
                    target: "spark_socket::server",
                    network = %inner.config.network,
                    remaining,
                    forced,
                    "graceful shutdown interrupted, forcing remaining connections closed"
                );
                inner.dispatcher.emit_server_info(format!(
                    "{} server forcing {remaining} connection(s) closed",
                    inner.config.network
                ));
                if tokio::time::timeout(FORCE_CLOSE_GRACE, inner.wait_drained())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        target: "spark_socket::server",
                        remaining = inner.registry.len(),
                        "connections still open after forced close grace period"
                    );
                }
                inner.mark_stopped();
                Err(match error {
                    SocketError::Timeout { .. } => SocketError::ShutdownTimeout { remaining },
                    other => other,
                })
            }
        }
    }

    /// 立即关闭：停止接受并强制关闭全部连接，不等待其退出。
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.begin_stop();
        let forced = inner.registry.force_close_all();
        tracing::debug!(
            target: "spark_socket::server",
            network = %inner.config.network,
            forced,
            "server closed"
        );
        inner.mark_stopped();
        Ok(())
    }
}

impl<B: Binder> ServerInner<B> {
    fn is_gone(&self) -> bool {
        *self.state.borrow() != ListenerState::Idle
            && !self.running.load(Ordering::Acquire)
            && self.registry.is_empty()
    }

    /// 停止接受：`Idle → Stopped`，`Listening → Draining`。
    fn begin_stop(&self) {
        self.stop.cancel();
        self.state.send_if_modified(|state| match *state {
            ListenerState::Idle => {
                *state = ListenerState::Stopped;
                true
            }
            ListenerState::Listening => {
                *state = ListenerState::Draining;
                true
            }
            _ => false,
        });
    }

    fn mark_stopped(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ListenerState::Stopped {
                false
            } else {
                *state = ListenerState::Stopped;
                true
            }
        });
        if changed {
            self.dispatcher.emit_server_info(format!(
                "{} server stopped with {} open connection(s)",
                self.config.network,
                self.registry.len()
            ));
        }
    }

    async fn wait_drained(&self) {
        while self.running.load(Ordering::Acquire) || !self.registry.is_empty() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn accept_loop(self: Arc<Self>, ctx: &CallContext, acceptor: &B::Acceptor) {
        let expired = async {
            match ctx.deadline().instant() {
                Some(target) => tokio::time::sleep_until(target.into()).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ctx.cancellation().cancelled() => break,
                _ = &mut expired => {
                    tracing::debug!(
                        target: "spark_socket::server",
                        network = %self.config.network,
                        "listen deadline expired, stop accepting"
                    );
                    break;
                }
                accepted = acceptor.accept() => accepted,
            };
            match accepted {
                Ok(incoming) => self.spawn_connection(incoming),
                Err(error) => {
                    let error = SocketError::io(Operation::ACCEPT, error);
                    tracing::warn!(
                        target: "spark_socket::server",
                        network = %self.config.network,
                        code = error.code(),
                        %error,
                        "accept failed"
                    );
                    self.dispatcher.emit_error(error.clone());
                    let pause = match error.category() {
                        ErrorCategory::Retryable(advice) => advice,
                        _ => ACCEPT_BACKOFF,
                    };
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = ctx.cancellation().cancelled() => break,
                        _ = &mut expired => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
    }

    fn spawn_connection(self: &Arc<Self>, incoming: Box<dyn Incoming>) {
        let entry = Arc::new(ConnectionEntry::new(
            incoming.local_addr(),
            incoming.peer_addr(),
            ConnectionState::Established,
        ));
        self.registry.insert(Arc::clone(&entry));
        self.dispatcher
            .emit_info(entry.local(), entry.remote(), ConnectionState::Established);
        tracing::debug!(
            target: "spark_socket::server",
            id = %entry.id(),
            remote = %entry.remote(),
            open = self.registry.len(),
            "connection accepted"
        );
        tokio::spawn(Arc::clone(self).serve(entry, incoming));
    }

    /// 单条连接的任务：完成握手 → 运行处理函数 → 关闭并释放登记。
    async fn serve(self: Arc<Self>, entry: Arc<ConnectionEntry>, incoming: Box<dyn Incoming>) {
        let closer = entry.closer().clone();
        let updated = match self.update.load_full() {
            Some(hook) => catch_unwind(AssertUnwindSafe(|| incoming.update_conn(&*hook.0)))
                .map_err(SocketError::panicked),
            None => Ok(()),
        };
        let established = match updated {
            Ok(()) => tokio::select! {
                biased;
                _ = closer.cancelled() => Err(SocketError::NotConnected),
                established = incoming.establish() => established,
            },
            Err(error) => Err(error),
        };
        let link = match established {
            Ok(io) => Arc::new(Link::new(
                io,
                entry,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.registry),
            )),
            Err(error) => {
                if entry.transition(ConnectionState::Faulted).is_ok() {
                    self.dispatcher
                        .emit_info(entry.local(), entry.remote(), ConnectionState::Faulted);
                    if !closer.is_cancelled() {
                        self.dispatcher.emit_error(error);
                    }
                }
                self.registry.remove(entry.id());
                return;
            }
        };

        let session = Session::new(Arc::clone(&link), self.config.effective_idle_timeout());
        let handler = Arc::clone(&self.handler);
        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.handle(session))) {
            Ok(future) => tokio::select! {
                biased;
                _ = closer.cancelled() => Ok(()),
                outcome = AssertUnwindSafe(future).catch_unwind() => outcome,
            },
            Err(payload) => Err(payload),
        };
        if let Err(payload) = outcome {
            let error = SocketError::panicked(payload);
            tracing::error!(
                target: "spark_socket::server",
                id = %link.entry().id(),
                %error,
                "connection handler panicked"
            );
            link.fault(error);
        }
        // 关闭本身不会失败；强制回收时跳过写出。
        let _ = link.close().await;
    }
}

/// accept 循环的收尾守卫。
///
/// `listen` 正常返回与其 future 被中途丢弃（任务被 abort）走同一条路径：清除运行标记、
/// 停止接受，并在后台等待连接排空后转为 `Stopped`。
struct ListenGuard<B: Binder> {
    inner: Arc<ServerInner<B>>,
    acceptor: Option<B::Acceptor>,
    local: TransportAddr,
}

impl<B: Binder> Drop for ListenGuard<B> {
    fn drop(&mut self) {
        // 先释放监听端点（Unix 套接字文件随之删除），再清除运行标记。
        drop(self.acceptor.take());
        let inner = &self.inner;
        inner.running.store(false, Ordering::Release);
        inner.dispatcher.emit_server_info(format!(
            "{} server stopped accepting on {}",
            inner.config.network, self.local
        ));
        inner.begin_stop();

        let monitor = Arc::clone(inner);
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    monitor.wait_drained().await;
                    monitor.mark_stopped();
                });
            }
            Err(_) => {
                if monitor.registry.is_empty() {
                    monitor.mark_stopped();
                }
            }
        }
    }
}

impl<B: Binder> fmt::Debug for Server<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("network", &self.inner.config.network)
            .field("address", &self.inner.config.address)
            .field("state", &self.state())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

/// [`Server`] 的弱句柄；服务端被丢弃后操作返回 [`SocketError::Instance`]。
pub struct ServerHandle<B: Binder> {
    inner: Weak<ServerInner<B>>,
}

impl<B: Binder> Clone for ServerHandle<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<B: Binder> ServerHandle<B> {
    pub fn upgrade(&self) -> Result<Server<B>> {
        self.inner
            .upgrade()
            .map(|inner| Server { inner })
            .ok_or(SocketError::Instance)
    }

    pub fn close(&self) -> Result<()> {
        self.upgrade()?.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NetworkProtocol;
    use crate::session::testing::DuplexIo;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::{Mutex, mpsc};
    use tracing_test::traced_test;

    /// 以通道模拟 accept：测试把内存管道的一端送进来，服务端即“接受”一条连接。
    struct ChannelBinder {
        incoming: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn SessionIo>>>>,
    }

    struct ChannelAcceptor {
        incoming: Mutex<mpsc::UnboundedReceiver<Arc<dyn SessionIo>>>,
    }

    struct Ready(Arc<dyn SessionIo>);

    impl Incoming for Ready {
        fn local_addr(&self) -> TransportAddr {
            self.0.local_addr()
        }
        fn peer_addr(&self) -> TransportAddr {
            self.0.peer_addr()
        }
        fn establish(self: Box<Self>) -> BoxFuture<'static, Result<Arc<dyn SessionIo>>> {
            Box::pin(async move { Ok(self.0) })
        }
    }

    impl Acceptor for ChannelAcceptor {
        fn local_addr(&self) -> TransportAddr {
            TransportAddr::Unnamed
        }
        fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn Incoming>>> {
            Box::pin(async move {
                match self.incoming.lock().await.recv().await {
                    Some(io) => Ok(Box::new(Ready(io)) as Box<dyn Incoming>),
                    None => std::future::pending().await,
                }
            })
        }
    }

    impl Binder for ChannelBinder {
        type Acceptor = ChannelAcceptor;
        fn bind<'a>(&'a self, _config: &'a ServerConfig) -> BoxFuture<'a, Result<ChannelAcceptor>> {
            Box::pin(async move {
                let receiver = self.incoming.lock().await.take().ok_or_else(|| {
                    SocketError::io(Operation::BIND, io::Error::from(io::ErrorKind::AddrInUse))
                })?;
                Ok(ChannelAcceptor {
                    incoming: Mutex::new(receiver),
                })
            })
        }
    }

    fn server<H: ConnectionHandler>(
        handler: H,
    ) -> (Server<ChannelBinder>, mpsc::UnboundedSender<Arc<dyn SessionIo>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let binder = ChannelBinder {
            incoming: Mutex::new(Some(rx)),
        };
        let config = ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0");
        (Server::new(config, binder, handler).unwrap(), tx)
    }

    async fn start<B: Binder>(server: &Server<B>) -> tokio::task::JoinHandle<Result<()>> {
        let listener = server.clone();
        let task = tokio::spawn(async move { listener.listen(&CallContext::background()).await });
        server.wait_listening().await.unwrap();
        task
    }

    fn connect(tx: &mpsc::UnboundedSender<Arc<dyn SessionIo>>) -> DuplexStream {
        let (io, peer) = DuplexIo::pair();
        tx.send(io).unwrap();
        peer
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_and_drain_on_shutdown() {
        let (server, tx) = server(|session: Session| async move {
            let request = session.read_to_end().await.unwrap();
            session.write(&request).await.unwrap();
        });
        let listener = start(&server).await;
        assert_eq!(server.state(), ListenerState::Listening);

        let mut peer = connect(&tx);
        peer.write_all(b"ping").await.unwrap();
        peer.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");

        server
            .shutdown(&CallContext::with_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        listener.await.unwrap().unwrap();
        assert_eq!(server.open_connections(), 0);
        assert!(server.is_gone());
        assert!(!server.is_running());
        assert_eq!(server.state(), ListenerState::Stopped);
        server.done().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn shutdown_timeout_forces_connections_closed() {
        let (server, tx) = server(|session: Session| async move {
            // 永不结束的处理函数，只能被强制回收。
            let mut buf = [0u8; 16];
            while session.read(&mut buf).await.is_ok_and(|n| n > 0) {}
            std::future::pending::<()>().await;
        });
        let _listener = start(&server).await;
        let _peers: Vec<_> = (0..3).map(|_| connect(&tx)).collect();
        while server.open_connections() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = server
            .shutdown(&CallContext::with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(
            matches!(err, SocketError::ShutdownTimeout { remaining: 3 }),
            "实际错误：{err:?}"
        );
        assert_eq!(server.open_connections(), 0, "强制关闭后连接必须在宽限期内释放");
        assert!(server.is_gone());
        assert!(logs_contain("forcing remaining connections closed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_immediate() {
        let (server, tx) = server(|session: Session| async move {
            let _ = session.read_to_end().await;
        });
        let listener = start(&server).await;
        let _peer = connect(&tx);
        while server.open_connections() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.close().unwrap();
        assert_eq!(server.state(), ListenerState::Stopped);
        listener.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.done())
            .await
            .expect("关闭后连接应很快全部释放");
        assert!(matches!(
            server.listen(&CallContext::background()).await,
            Err(SocketError::ServerClosed)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_panic_is_contained() {
        let served = Arc::new(AtomicUsize::new(0));
        let (server, tx) = {
            let served = Arc::clone(&served);
            server(move |session: Session| {
                let served = Arc::clone(&served);
                async move {
                    if served.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first handler explodes");
                    }
                    session.write(b"ok").await.unwrap();
                }
            })
        };
        let (errors_tx, mut errors) = mpsc::unbounded_channel();
        server.register_func_error(move |batch| {
            for error in batch {
                let _ = errors_tx.send(error.code());
            }
        });
        let _listener = start(&server).await;

        let mut first = connect(&tx);
        let mut buf = Vec::new();
        first.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        let code = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, "spark.socket.panicked");

        let mut second = connect(&tx);
        let mut reply = [0u8; 2];
        second.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok", "panic 不得影响后续连接");
        server.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listen_twice_is_rejected() {
        let (server, _tx) = server(|_session: Session| async {});
        let _listener = start(&server).await;
        assert!(matches!(
            server.listen(&CallContext::background()).await,
            Err(SocketError::AlreadyListening)
        ));
        server.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_listen_drains_in_background() {
        let (server, tx) = server(|session: Session| async move {
            let _ = session.read_to_end().await;
        });
        let ctx = CallContext::background();
        let listener = {
            let server = server.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { server.listen(&ctx).await })
        };
        server.wait_listening().await.unwrap();
        let mut peer = connect(&tx);
        while server.open_connections() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ctx.cancel();
        listener.await.unwrap().unwrap();
        assert!(!server.is_running());
        assert_eq!(server.state(), ListenerState::Draining);
        assert!(!server.is_gone(), "仍有连接时不算完全拆除");

        peer.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.done())
            .await
            .unwrap();
        assert_eq!(server.state(), ListenerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aborted_listen_still_tears_down() {
        let (server, tx) = server(|session: Session| async move {
            let _ = session.read_to_end().await;
        });
        let listener = start(&server).await;
        let mut peer = connect(&tx);
        while server.open_connections() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        listener.abort();
        assert!(listener.await.unwrap_err().is_cancelled());
        assert!(!server.is_running(), "listen 被中止后不得仍报告运行中");
        assert_eq!(server.state(), ListenerState::Draining);

        peer.shutdown().await.unwrap();
        server
            .shutdown(&CallContext::with_timeout(Duration::from_millis(500)))
            .await
            .unwrap();
        assert!(server.is_gone());
        tokio::time::timeout(Duration::from_secs(1), server.done())
            .await
            .expect("中止 listen 后 done 仍应完成");
        assert_eq!(server.state(), ListenerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listen_returns_when_deadline_expires() {
        let (server, _tx) = server(|_session: Session| async {});
        let started = tokio::time::Instant::now();
        tokio::time::timeout(
            Duration::from_secs(2),
            server.listen(&CallContext::with_timeout(Duration::from_millis(100))),
        )
        .await
        .expect("截止到期后 listen 必须返回")
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!server.is_running());
        tokio::time::timeout(Duration::from_secs(1), server.done())
            .await
            .unwrap();
        assert_eq!(server.state(), ListenerState::Stopped);
    }

    #[test]
    fn handle_reports_instance_after_drop() {
        let (server, _tx) = server(|_session: Session| async {});
        let handle = server.handle();
        drop(server);
        assert!(matches!(handle.close(), Err(SocketError::Instance)));
    }
}
