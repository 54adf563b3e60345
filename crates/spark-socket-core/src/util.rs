use crate::contract::{CallContext, Cancellation, Deadline};
use crate::error::{Operation, Result, SocketError};
use std::future::Future;
use std::io;
use std::time::Duration;

/// 在保留取消/超时语义的前提下执行 IO Future。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. 进入前先检查截止与取消，已失效的上下文不再触发任何 IO；
/// 2. 以 `biased` 的 `select!` 依次竞争：调用方取消、连接级取消（`closer`）、截止时间、IO 本身；
/// 3. `closer` 被触发意味着连接已被本端关闭或强制回收，统一映射为 [`SocketError::NotConnected`]。
///
/// ## 契约（What）
/// - `deadline` 为调用上下文与连接级超时合并后的结果，见 [`Deadline::min`]；
/// - IO 错误经 [`SocketError::io`] 包装并带上 `op`。
pub async fn run_with_context<F, T>(
    ctx: &CallContext,
    closer: Option<&Cancellation>,
    deadline: Deadline,
    op: Operation,
    future: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let outcome = race(ctx, closer, deadline, op, future).await?;
    outcome.map_err(|err| SocketError::io(op, err))
}

/// 与 [`run_with_context`] 相同的竞争逻辑，但 Future 自身已产出 [`SocketError`]。
pub async fn race<F, T>(
    ctx: &CallContext,
    closer: Option<&Cancellation>,
    deadline: Deadline,
    op: Operation,
    future: F,
) -> Result<T>
where
    F: Future<Output = T>,
{
    let deadline = ctx.deadline().min(deadline);
    if deadline.is_expired() {
        return Err(SocketError::Timeout { op });
    }
    if ctx.is_cancelled() {
        return Err(SocketError::Cancelled { op });
    }
    if closer.is_some_and(Cancellation::is_cancelled) {
        return Err(SocketError::NotConnected);
    }

    let closed = async {
        match closer {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    let expired = async {
        match deadline.instant() {
            Some(target) => tokio::time::sleep_until(target.into()).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(future);

    tokio::select! {
        biased;
        _ = ctx.cancellation().cancelled() => Err(SocketError::Cancelled { op }),
        _ = closed => Err(SocketError::NotConnected),
        _ = expired => Err(SocketError::Timeout { op }),
        output = &mut future => Ok(output),
    }
}

/// 将可选的超时时长转换为截止时间。
pub(crate) fn deadline_from(timeout: Option<Duration>) -> Deadline {
    timeout.map(Deadline::after).unwrap_or_default()
}
