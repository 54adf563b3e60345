use crate::addr::TransportAddr;
use crate::callback::Dispatcher;
use crate::config::{ClientConfig, DEFAULT_BUFFER_SIZE};
use crate::contract::{CallContext, Deadline};
use crate::error::{Operation, Result, SocketError};
use crate::registry::{ConnectionEntry, Registry};
use crate::session::{Link, SessionIo};
use crate::state::ConnectionState;
use crate::util::{deadline_from, run_with_context};
use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt};

/// 传输层拨号能力：完成建连（含 TLS 握手）并交出 IO 句柄。
///
/// 实现方应以 `ctx` 约束全部挂起点；取消时返回 [`SocketError::Cancelled`] 且不得遗留已打开的套接字。
pub trait Dialer: Send + Sync + 'static {
    fn dial<'a>(
        &'a self,
        ctx: &'a CallContext,
        config: &'a ClientConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn SessionIo>>>;
}

/// 协议无关的客户端。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 四种协议共享同一套“拨号 → 读写 → 关闭”状态机，差异只留在 [`Dialer`] 中；
/// - 客户端句柄可克隆并跨任务共享，内部状态以原子方式替换。
///
/// ## 状态存储（What）
/// - 构造后只读：`config`、`dialer`、`registry`、`dispatcher` 本身；
/// - 运行期可变：当前连接（`ArcSwapOption`，整条替换）、已注册回调（`Dispatcher` 内部的 `ArcSwapOption`）、
///   Registry 中的记录与计数；
/// - 所有可变状态都通过原子替换或分片映射修改，任何锁都不会跨越 IO 持有。
///
/// ## 契约
/// - `connect` 成功后登记一条新记录并发出 `Established`；对已连接的客户端再次 `connect`
///   会替换传输句柄并关闭旧连接；
/// - `read`/`write` 在连接前或关闭后返回 [`SocketError::NotConnected`]；
/// - `close` 幂等；`once` 无论成败都会关闭连接。
pub struct Client<D> {
    inner: Arc<ClientInner<D>>,
}

struct ClientInner<D> {
    config: ClientConfig,
    dialer: D,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    current: ArcSwapOption<Link>,
}

impl<D> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> Client<D> {
    /// 校验配置并构造客户端；此时不会打开任何套接字。
    pub fn new(config: ClientConfig, dialer: D) -> Result<Self> {
        Self::with_registry(config, dialer, Arc::new(Registry::new()))
    }

    /// 与其它客户端共享同一个 Registry。
    pub fn with_registry(config: ClientConfig, dialer: D, registry: Arc<Registry>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                dialer,
                dispatcher: Arc::new(Dispatcher::new("client")),
                registry,
                current: ArcSwapOption::empty(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
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

    /// 不延长客户端生命周期的弱句柄，适合在回调中捕获。
    pub fn handle(&self) -> ClientHandle<D> {
        ClientHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .current
            .load()
            .as_ref()
            .is_some_and(|link| link.is_connected())
    }

    /// 当前连接的状态；未连接时为 `None`。
    pub fn state(&self) -> Option<ConnectionState> {
        self.inner.current.load().as_ref().map(|link| link.state())
    }

    pub fn local_addr(&self) -> Option<TransportAddr> {
        self.inner
            .current
            .load()
            .as_ref()
            .map(|link| link.entry().local().clone())
    }

    pub fn peer_addr(&self) -> Option<TransportAddr> {
        self.inner
            .current
            .load()
            .as_ref()
            .map(|link| link.entry().remote().clone())
    }

    /// 拨号：`Dialing → Established`。
    ///
    /// # 逻辑（How）
    /// 1. 再次校验配置，发出 `Dialing` 事件；
    /// 2. 交由 [`Dialer`] 完成建连与握手，全程受 `ctx` 约束；
    /// 3. 失败：取消视为 `Closed`，其余视为 `Faulted` 并经错误回调上报，Registry 不留记录；
    /// 4. 成功：登记新记录、发出 `Established`，原连接（如有）随后关闭。
    pub async fn connect(&self, ctx: &CallContext) -> Result<()> {
        let inner = &self.inner;
        inner.config.validate()?;
        inner.dispatcher.emit_info(
            &TransportAddr::Unnamed,
            &TransportAddr::Unnamed,
            ConnectionState::Dialing,
        );

        let io = match inner.dialer.dial(ctx, &inner.config).await {
            Ok(io) => io,
            Err(error) => {
                let cancelled = matches!(error, SocketError::Cancelled { .. });
                let terminal = if cancelled {
                    ConnectionState::Closed
                } else {
                    ConnectionState::Faulted
                };
                inner.dispatcher.emit_info(
                    &TransportAddr::Unnamed,
                    &TransportAddr::Unnamed,
                    terminal,
                );
                if !cancelled {
                    inner.dispatcher.emit_error(error.clone());
                }
                return Err(error);
            }
        };

        let entry = Arc::new(ConnectionEntry::new(
            io.local_addr(),
            io.peer_addr(),
            ConnectionState::Established,
        ));
        inner.registry.insert(Arc::clone(&entry));
        inner.dispatcher.emit_info(
            entry.local(),
            entry.remote(),
            ConnectionState::Established,
        );
        tracing::debug!(
            target: "spark_socket::client",
            id = %entry.id(),
            network = %inner.config.network,
            local = %entry.local(),
            remote = %entry.remote(),
            "connection established"
        );
        let link = Arc::new(Link::new(
            io,
            entry,
            Arc::clone(&inner.dispatcher),
            Arc::clone(&inner.registry),
        ));
        if let Some(previous) = inner.current.swap(Some(link)) {
            previous.close().await?;
        }
        Ok(())
    }

    fn current(&self) -> Result<Arc<Link>> {
        self.inner
            .current
            .load_full()
            .ok_or(SocketError::NotConnected)
    }

    /// 连接进入终态后从当前槽位摘除，后续调用直接得到 `NotConnected`。
    fn detach_if_terminal(&self, link: &Arc<Link>) {
        if link.state().is_terminal() {
            let expected = Some(Arc::clone(link));
            let _ = self
                .inner
                .current
                .compare_and_swap(&expected, None::<Arc<Link>>);
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_with(&CallContext::background(), buf).await
    }

    /// 读取数据；返回 `0` 表示对端已结束输出。
    pub async fn read_with(&self, ctx: &CallContext, buf: &mut [u8]) -> Result<usize> {
        let link = self.current()?;
        let outcome = link
            .read(ctx, deadline_from(self.inner.config.read_timeout), buf)
            .await;
        self.detach_if_terminal(&link);
        outcome
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.write_with(&CallContext::background(), buf).await
    }

    /// 写入数据。字节流写满后返回；数据报为一次独立、尽力而为的发送。
    pub async fn write_with(&self, ctx: &CallContext, buf: &[u8]) -> Result<usize> {
        let link = self.current()?;
        let outcome = link
            .write(ctx, deadline_from(self.inner.config.write_timeout), buf)
            .await;
        self.detach_if_terminal(&link);
        outcome
    }

    /// 关闭写方向，对端随后读到 EOF；数据报协议上为空操作。
    pub async fn half_close(&self) -> Result<()> {
        self.half_close_with(&CallContext::background()).await
    }

    pub async fn half_close_with(&self, ctx: &CallContext) -> Result<()> {
        let link = self.current()?;
        let outcome = link
            .half_close(ctx, deadline_from(self.inner.config.write_timeout))
            .await;
        self.detach_if_terminal(&link);
        outcome
    }

    /// 关闭当前连接；重复调用或未连接时直接返回 `Ok(())`。
    pub async fn close(&self) -> Result<()> {
        match self.inner.current.swap(None) {
            Some(link) => link.close().await,
            None => Ok(()),
        }
    }

    /// 一次性请求/响应。
    ///
    /// # 逻辑（How）
    /// 1. 拨号；
    /// 2. 以 [`DEFAULT_BUFFER_SIZE`] 为块把 `request` 全部写出；
    /// 3. 字节流协议半关闭，使对端读到 EOF；
    /// 4. 字节流读到 EOF 为止，数据报读取一个报文；
    /// 5. 以完整响应调用 `on_response`；
    /// 6. 无论前面哪一步失败都关闭连接。
    ///
    /// # 契约（What）
    /// - 任一步骤的错误都会短路后续步骤并同步返回；传输错误同时经错误回调上报；
    /// - 步骤与关闭都失败时返回步骤的错误；
    /// - 数据报协议在对端不回复时会一直等待，调用方应通过 `ctx` 设置截止时间。
    pub async fn once<R, F>(&self, ctx: &CallContext, request: R, on_response: F) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        F: FnOnce(&[u8]) + Send,
    {
        let outcome = self.exchange(ctx, request, on_response).await;
        let closed = self.close().await;
        outcome.and(closed)
    }

    async fn exchange<R, F>(&self, ctx: &CallContext, mut request: R, on_response: F) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        F: FnOnce(&[u8]) + Send,
    {
        self.connect(ctx).await?;
        let mut chunk = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let read = match run_with_context(
                ctx,
                None,
                Deadline::none(),
                Operation::REQUEST,
                request.read(&mut chunk),
            )
            .await
            {
                Ok(read) => read,
                Err(error) => {
                    if !matches!(error, SocketError::Cancelled { .. }) {
                        self.inner.dispatcher.emit_error(error.clone());
                    }
                    return Err(error);
                }
            };
            if read == 0 {
                break;
            }
            self.write_with(ctx, &chunk[..read]).await?;
        }

        let response = if self.inner.config.network.is_stream() {
            self.half_close_with(ctx).await?;
            let link = self.current()?;
            let collected = link
                .read_to_end(ctx, self.inner.config.read_timeout, DEFAULT_BUFFER_SIZE)
                .await;
            self.detach_if_terminal(&link);
            collected?
        } else {
            let mut datagram = vec![0u8; crate::config::MAX_DATAGRAM_SIZE];
            let read = self.read_with(ctx, &mut datagram).await?;
            datagram.truncate(read);
            datagram.as_slice().into()
        };
        on_response(&response);
        Ok(())
    }
}

impl<D> fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.inner.current.load();
        f.debug_struct("Client")
            .field("network", &self.inner.config.network)
            .field("address", &self.inner.config.address)
            .field("state", &current.as_ref().map(|link| link.state()))
            .finish()
    }
}

/// [`Client`] 的弱句柄；客户端被丢弃后操作返回 [`SocketError::Instance`]。
pub struct ClientHandle<D> {
    inner: Weak<ClientInner<D>>,
}

impl<D> Clone for ClientHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<D: Dialer> ClientHandle<D> {
    pub fn upgrade(&self) -> Result<Client<D>> {
        self.inner
            .upgrade()
            .map(|inner| Client { inner })
            .ok_or(SocketError::Instance)
    }

    pub async fn close(&self) -> Result<()> {
        self.upgrade()?.close().await
    }
}
