use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// 取消原语，统一表达拨号、监听、读写与停机的可中断性契约。
///
/// # 设计背景（Why）
/// - 所有可能挂起的套接字操作都必须在外部取消后及时返回，避免悬挂任务占用文件描述符；
/// - 服务端还以同一原语强制关闭单条连接，使“调用方取消”与“停机强关”走同一条路径。
///
/// # 逻辑解析（How）
/// - 原子位记录取消状态，`Notify` 负责唤醒正在等待的任务；
/// - `cancel` 仅在首次成功置位时返回 `true`，并唤醒全部等待者；
/// - `cancelled` 先登记等待再复查原子位，不会错过并发发生的取消。
///
/// # 契约说明（What）
/// - 克隆体共享同一状态；取消不可撤销。
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待取消发生；若已取消则立即返回。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// 截止原语，描述操作的最迟完成时间（单调时钟）。
///
/// - `Deadline::none()` 表示调用方未施加硬超时；
/// - 多个截止时间叠加时以较早者为准，见 [`Deadline::min`]。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { instant: None }
    }

    pub const fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时刻为起点生成截止时间。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    pub fn is_expired(&self) -> bool {
        self.instant.is_some_and(|target| target <= Instant::now())
    }

    /// 距离截止的剩余时长；未设置时返回 `None`。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|target| target.saturating_duration_since(Instant::now()))
    }

    /// 取两个截止时间中较早的一个。
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.instant, other.instant) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

/// 调用上下文：取消令牌与截止时间的组合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `connect`、`listen`、`shutdown`、`once` 等入口统一接收 `&CallContext`，
///   使“取消即中止、超时即返回”的语义在四种协议间完全一致；
/// - 克隆成本为一次 `Arc` 计数递增，可随任务下发。
///
/// ## 契约（What）
/// - 取消返回 [`SocketError::Cancelled`](crate::SocketError::Cancelled)，
///   截止到期返回 [`SocketError::Timeout`](crate::SocketError::Timeout)；
/// - 上下文只读，派生新上下文请使用 [`CallContext::builder`]。
#[derive(Clone, Debug)]
pub struct CallContext {
    inner: Arc<CallContextInner>,
}

#[derive(Debug)]
struct CallContextInner {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// 无截止时间、独立取消令牌的上下文。
    pub fn background() -> Self {
        Self::builder().build()
    }

    /// 从现在起 `timeout` 后到期的上下文。
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::builder().with_timeout(timeout).build()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.inner.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// 取消该上下文（以及所有共享该令牌的上下文）。
    pub fn cancel(&self) -> bool {
        self.inner.cancellation.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

/// [`CallContext`] 构造器。
#[derive(Debug, Default)]
pub struct CallContextBuilder {
    cancellation: Option<Cancellation>,
    deadline: Deadline,
}

impl CallContextBuilder {
    /// 共享外部取消令牌。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Deadline::after(timeout);
        self
    }

    pub fn build(self) -> CallContext {
        CallContext {
            inner: Arc::new(CallContextInner {
                cancellation: self.cancellation.unwrap_or_default(),
                deadline: self.deadline,
            }),
        }
    }
}
