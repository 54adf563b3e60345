use crate::addr::TransportAddr;
use crate::error::SocketError;
use crate::state::ConnectionState;
use arc_swap::ArcSwapOption;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

type ErrorFn = dyn Fn(&[SocketError]) + Send + Sync;
type InfoFn = dyn Fn(&TransportAddr, &TransportAddr, ConnectionState) + Send + Sync;
type ServerInfoFn = dyn Fn(&str) + Send + Sync;

// arc-swap 只能存放定长类型，闭包需要再包一层。
struct ErrorCallback(Box<ErrorFn>);
struct InfoCallback(Box<InfoFn>);
struct ServerInfoCallback(Box<ServerInfoFn>);

#[derive(Default)]
struct Callbacks {
    on_error: ArcSwapOption<ErrorCallback>,
    on_info: ArcSwapOption<InfoCallback>,
    on_server: ArcSwapOption<ServerInfoCallback>,
}

enum Event {
    Error(Arc<ErrorCallback>, Vec<SocketError>),
    Info(
        Arc<InfoCallback>,
        TransportAddr,
        TransportAddr,
        ConnectionState,
    ),
    Server(Arc<ServerInfoCallback>, String),
}

/// 回调分发器：把错误事件与状态迁移事件异步投递给调用方注册的函数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 拨号、接受与读写路径绝不能被缓慢或发生 panic 的回调拖住；
/// - 同一连接的状态事件必须按发生顺序送达，调用方才能据此重建连接时间线。
///
/// ## 逻辑（How）
/// 1. 回调以 `ArcSwapOption` 保存，注册/替换无锁，事件发出时即刻捕获当前回调；
/// 2. 首次发事件时在当前 Tokio 运行时上启动唯一的投递任务，事件经无界通道 FIFO 排队；
/// 3. 投递任务对每个事件调用 `spawn_blocking` 并等待其完成，回调永远不在调用方栈上执行，
///    同时保证全局（因而也是单连接内）的先后顺序；
/// 4. 回调 panic 由 `catch_unwind` 截获，状态/服务端回调的 panic 会转成
///    [`SocketError::Panicked`] 送往错误回调；
/// 5. 不在运行时内（例如在同步上下文里关闭客户端）时退化为独立线程投递。
///
/// ## 契约（What）
/// - 未注册回调时事件直接丢弃，不产生排队开销；
/// - 回调捕获其所属的客户端/服务端会形成引用环，应改为捕获
///   [`ClientHandle`](crate::client::ClientHandle) 或 [`ServerHandle`](crate::server::ServerHandle)。
pub struct Dispatcher {
    callbacks: Arc<Callbacks>,
    queue: OnceLock<mpsc::UnboundedSender<Event>>,
    label: &'static str,
}

impl Dispatcher {
    pub fn new(label: &'static str) -> Self {
        Self {
            callbacks: Arc::new(Callbacks::default()),
            queue: OnceLock::new(),
            label,
        }
    }

    /// 注册错误回调，替换已有回调。
    pub fn register_func_error<F>(&self, f: F)
    where
        F: Fn(&[SocketError]) + Send + Sync + 'static,
    {
        self.callbacks
            .on_error
            .store(Some(Arc::new(ErrorCallback(Box::new(f)))));
    }

    /// 注册状态迁移回调：`(本地地址, 对端地址, 新状态)`。
    pub fn register_func_info<F>(&self, f: F)
    where
        F: Fn(&TransportAddr, &TransportAddr, ConnectionState) + Send + Sync + 'static,
    {
        self.callbacks
            .on_info
            .store(Some(Arc::new(InfoCallback(Box::new(f)))));
    }

    /// 注册监听器生命周期消息回调。
    pub fn register_func_info_server<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks
            .on_server
            .store(Some(Arc::new(ServerInfoCallback(Box::new(f)))));
    }

    /// 注销全部回调。
    pub fn clear(&self) {
        self.callbacks.on_error.store(None);
        self.callbacks.on_info.store(None);
        self.callbacks.on_server.store(None);
    }

    pub fn emit_error(&self, error: SocketError) {
        self.emit_errors(vec![error]);
    }

    pub fn emit_errors(&self, errors: Vec<SocketError>) {
        if errors.is_empty() {
            return;
        }
        for error in &errors {
            tracing::debug!(
                target: "spark_socket::callback",
                dispatcher = self.label,
                code = error.code(),
                %error,
                "socket error"
            );
        }
        if let Some(callback) = self.callbacks.on_error.load_full() {
            self.send(Event::Error(callback, errors));
        }
    }

    pub fn emit_info(&self, local: &TransportAddr, remote: &TransportAddr, state: ConnectionState) {
        tracing::trace!(
            target: "spark_socket::state",
            dispatcher = self.label,
            %local,
            %remote,
            %state,
            "connection state changed"
        );
        if let Some(callback) = self.callbacks.on_info.load_full() {
            self.send(Event::Info(callback, local.clone(), remote.clone(), state));
        }
    }

    pub fn emit_server_info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "spark_socket::server", dispatcher = self.label, "{message}");
        if let Some(callback) = self.callbacks.on_server.load_full() {
            self.send(Event::Server(callback, message));
        }
    }

    fn send(&self, event: Event) {
        let sender = match self.queue.get() {
            Some(sender) => sender,
            None => match Handle::try_current() {
                Ok(handle) => self
                    .queue
                    .get_or_init(|| spawn_worker(&handle, Arc::clone(&self.callbacks))),
                Err(_) => {
                    deliver_detached(Arc::clone(&self.callbacks), event);
                    return;
                }
            },
        };
        if let Err(mpsc::error::SendError(event)) = sender.send(event) {
            // 投递任务所在的运行时已经退出。
            deliver_detached(Arc::clone(&self.callbacks), event);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("label", &self.label)
            .field("worker_started", &self.queue.get().is_some())
            .finish()
    }
}

fn spawn_worker(handle: &Handle, callbacks: Arc<Callbacks>) -> mpsc::UnboundedSender<Event> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
    handle.spawn(async move {
        while let Some(event) = receiver.recv().await {
            let callbacks = Arc::clone(&callbacks);
            if let Err(join_error) =
                tokio::task::spawn_blocking(move || deliver(&callbacks, event)).await
            {
                tracing::error!(
                    target: "spark_socket::callback",
                    error = %join_error,
                    "callback delivery task failed"
                );
            }
        }
    });
    sender
}

fn deliver_detached(callbacks: Arc<Callbacks>, event: Event) {
    let spawned = std::thread::Builder::new()
        .name("spark-socket-callback".into())
        .spawn(move || deliver(&callbacks, event));
    if let Err(error) = spawned {
        tracing::error!(
            target: "spark_socket::callback",
            %error,
            "unable to spawn callback thread, event dropped"
        );
    }
}

fn deliver(callbacks: &Callbacks, event: Event) {
    let outcome = match event {
        Event::Error(callback, errors) => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (callback.0)(&errors))) {
                tracing::error!(
                    target: "spark_socket::callback",
                    panic = %SocketError::panicked(payload),
                    "error callback panicked"
                );
            }
            return;
        }
        Event::Info(callback, local, remote, state) => {
            catch_unwind(AssertUnwindSafe(|| (callback.0)(&local, &remote, state)))
        }
        Event::Server(callback, message) => {
            catch_unwind(AssertUnwindSafe(|| (callback.0)(&message)))
        }
    };
    if let Err(payload) = outcome {
        let error = SocketError::panicked(payload);
        tracing::error!(target: "spark_socket::callback", %error, "info callback panicked");
        if let Some(on_error) = callbacks.on_error.load_full() {
            let errors = [error];
            if catch_unwind(AssertUnwindSafe(|| (on_error.0)(&errors))).is_err() {
                tracing::error!(target: "spark_socket::callback", "error callback panicked");
            }
        }
    }
}
