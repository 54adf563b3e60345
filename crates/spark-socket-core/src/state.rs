use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 单条连接的生命周期状态。
///
/// ```text
/// Dialing → Established → Active(Reading | Writing) → Closing → Closed
///     └──────────────┴───────────────┴──────────────────┴──→ Faulted
/// ```
///
/// - 客户端初始为 `Dialing`，服务端接受后初始为 `Established`；
/// - `Closed` 与 `Faulted` 为终态，进入终态后不再发生任何迁移。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Dialing = 0,
    Established = 1,
    Reading = 2,
    Writing = 3,
    Closing = 4,
    Closed = 5,
    Faulted = 6,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Dialing,
            1 => ConnectionState::Established,
            2 => ConnectionState::Reading,
            3 => ConnectionState::Writing,
            4 => ConnectionState::Closing,
            5 => ConnectionState::Closed,
            _ => ConnectionState::Faulted,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Dialing => "dialing",
            ConnectionState::Established => "established",
            ConnectionState::Reading => "reading",
            ConnectionState::Writing => "writing",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Faulted => "faulted",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Faulted)
    }

    /// `Reading`/`Writing` 合称 Active。
    pub const fn is_active(self) -> bool {
        matches!(self, ConnectionState::Reading | ConnectionState::Writing)
    }

    /// 连接是否允许读写。
    pub const fn is_usable(self) -> bool {
        matches!(
            self,
            ConnectionState::Established | ConnectionState::Reading | ConnectionState::Writing
        )
    }

    /// 判定迁移是否合法；同态迁移视为不合法（不产生事件）。
    pub const fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) | (Faulted, _) => false,
            (_, Faulted) => true,
            (Dialing, Established) | (Dialing, Closing) | (Dialing, Closed) => true,
            (Established | Reading | Writing, Reading) => !matches!(self, Reading),
            (Established | Reading | Writing, Writing) => !matches!(self, Writing),
            (Established | Reading | Writing, Closing) => true,
            (Established | Reading | Writing, Closed) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 以单个原子字节保存 [`ConnectionState`]，迁移通过 CAS 完成。
#[derive(Debug)]
pub struct AtomicConnectionState {
    raw: AtomicU8,
}

impl AtomicConnectionState {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            raw: AtomicU8::new(initial as u8),
        }
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// 尝试迁移到 `next`。
    ///
    /// 成功时返回迁移前的状态；当前状态不允许该迁移时返回 `Err(当前状态)`，
    /// 调用方据此决定是否发出状态事件。
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        let mut current = self.load();
        loop {
            if !current.can_transition_to(next) {
                return Err(current);
            }
            match self.raw.compare_exchange_weak(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(observed) => current = ConnectionState::from_u8(observed),
            }
        }
    }
}

/// 监听器状态：`Idle → Listening → Draining → Stopped`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Idle,
    Listening,
    Draining,
    Stopped,
}

impl ListenerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ListenerState::Idle => "idle",
            ListenerState::Listening => "listening",
            ListenerState::Draining => "draining",
            ListenerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
