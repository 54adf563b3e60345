use crate::addr::TransportAddr;
use crate::contract::Cancellation;
use crate::state::{AtomicConnectionState, ConnectionState};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 进程内唯一的连接标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry 中的一条记录：连接的地址、状态与强制关闭句柄。
///
/// 地址在构造后只读；状态通过 [`AtomicConnectionState`] 原子迁移；
/// `closer` 被取消时，持有该连接的任务必须尽快释放传输句柄。
#[derive(Debug)]
pub struct ConnectionEntry {
    id: ConnectionId,
    local: TransportAddr,
    remote: TransportAddr,
    state: AtomicConnectionState,
    closer: Cancellation,
}

impl ConnectionEntry {
    pub fn new(local: TransportAddr, remote: TransportAddr, initial: ConnectionState) -> Self {
        Self {
            id: ConnectionId::next(),
            local,
            remote,
            state: AtomicConnectionState::new(initial),
            closer: Cancellation::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local(&self) -> &TransportAddr {
        &self.local
    }

    pub fn remote(&self) -> &TransportAddr {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        self.state.transition(next)
    }

    pub fn closer(&self) -> &Cancellation {
        &self.closer
    }

    /// 触发强制关闭；返回是否为首次触发。
    pub fn force_close(&self) -> bool {
        self.closer.cancel()
    }
}

/// Runtime Registry：连接标识到连接记录的并发映射。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 停机排空与连接计数是唯一跨任务共享的状态，需要在慢连接存在时依旧保持准确；
/// - 采用分片哈希表 `DashMap`，锁只在插入/删除的瞬间持有，绝不跨越 IO。
///
/// ## 契约（What）
/// - `insert` 使计数加一；`remove` 仅在记录确实存在时减一，因此同一连接被多条路径
///   （调用方关闭、对端断开、强制回收）并发移除时计数也只减一次；
/// - `len` 为实时计数，与映射大小保持一致；
/// - `force_close_all` 只发出关闭信号，不等待连接退出。
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    open: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<ConnectionEntry>) -> ConnectionId {
        let id = entry.id();
        // 先计数再发布，并发的 remove 不会让计数下溢。
        self.open.fetch_add(1, Ordering::AcqRel);
        if self.entries.insert(id, entry).is_some() {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
        id
    }

    /// 移除记录；返回 `None` 表示已被其它路径移除。
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        let (_, entry) = self.entries.remove(&id)?;
        self.open.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 对全部记录发出强制关闭信号，返回本次新触发的数量。
    pub fn force_close_all(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().force_close())
            .count()
    }

    /// 诊断用快照。
    pub fn snapshot(&self) -> Vec<(ConnectionId, ConnectionState)> {
        let mut items: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().state()))
            .collect();
        items.sort_by_key(|(id, _)| *id);
        items
    }
}
