use crate::protocol::NetworkProtocol;
use rustls::{AlertDescription, Error as RustlsError};
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 本地路径套接字允许设置的最大组 ID。
pub const MAX_GID: u32 = 32_767;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Operation {
    pub code: &'static str,
    pub name: &'static str,
}

impl Operation {
    pub const DIAL: Operation = Operation {
        code: "spark.socket.dial_failed",
        name: "socket dial",
    };
    pub const BIND: Operation = Operation {
        code: "spark.socket.bind_failed",
        name: "socket bind",
    };
    pub const ACCEPT: Operation = Operation {
        code: "spark.socket.accept_failed",
        name: "socket accept",
    };
    pub const HANDSHAKE: Operation = Operation {
        code: "spark.socket.tls_handshake_failed",
        name: "tls handshake",
    };
    pub const READ: Operation = Operation {
        code: "spark.socket.read_failed",
        name: "socket read",
    };
    pub const WRITE: Operation = Operation {
        code: "spark.socket.write_failed",
        name: "socket write",
    };
    pub const HALF_CLOSE: Operation = Operation {
        code: "spark.socket.half_close_failed",
        name: "socket half-close",
    };
    pub const CLOSE: Operation = Operation {
        code: "spark.socket.close_failed",
        name: "socket close",
    };
    pub const CONFIGURE: Operation = Operation {
        code: "spark.socket.configure_failed",
        name: "socket file configure",
    };
    pub const SHUTDOWN: Operation = Operation {
        code: "spark.socket.shutdown_failed",
        name: "server shutdown",
    };
    pub const REQUEST: Operation = Operation {
        code: "spark.socket.request_failed",
        name: "request source read",
    };
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 安全类错误的细分。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityClass {
    /// 证书缺失、过期或不受信任。
    Authentication,
    /// 报文完整性或协议约定被破坏。
    Integrity,
    /// 对端拒绝授权。
    Authorization,
}

/// 错误分类，供调用方决定是否重试、告警或直接放弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 可在建议的退避时间后重试。
    Retryable(Duration),
    NonRetryable,
    Security(SecurityClass),
    ProtocolViolation,
    ResourceExhausted,
    Cancelled,
    Timeout,
}

/// 套接字层统一错误。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“构造期校验失败”“状态误用”“传输故障”收敛为一个可 `Clone` 的枚举，
///   使同一错误既能同步返回给调用方，又能异步投递给错误回调；
/// - 每个变体都可以通过 [`SocketError::code`] 取得稳定错误码，便于日志检索与告警规则编写。
///
/// ## 契约（What）
/// - `Io` 保留底层 `io::Error`（握手失败时内嵌 `rustls::Error`），并以 [`Operation`] 标识出错环节；
/// - `Cancelled`/`Timeout` 只由调用上下文触发，与传输错误区分；
/// - 构造期错误（`Address`、`InvalidGroup`、`TlsUnsupported`、`TlsConfig`）永不在内部重试。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum SocketError {
    #[error("socket handle is not initialized or its owner has been dropped")]
    Instance,
    #[error("unsupported network protocol `{0}`")]
    UnsupportedProtocol(String),
    #[error("connection is not established")]
    NotConnected,
    #[error("invalid address `{address}`: {reason}")]
    Address {
        address: String,
        reason: Cow<'static, str>,
    },
    #[error("group id {0} exceeds the maximum allowed value {max}", max = MAX_GID)]
    InvalidGroup(u32),
    #[error("tls is not supported on datagram protocol `{0}`")]
    TlsUnsupported(NetworkProtocol),
    #[error("invalid tls configuration: {0}")]
    TlsConfig(Cow<'static, str>),
    #[error("server is already listening")]
    AlreadyListening,
    #[error("server has been stopped and cannot listen again")]
    ServerClosed,
    #[error("graceful shutdown timed out with {remaining} open connection(s)")]
    ShutdownTimeout { remaining: usize },
    #[error("{op} cancelled")]
    Cancelled { op: Operation },
    #[error("{op} timed out")]
    Timeout { op: Operation },
    #[error("{op} failed: {source}")]
    Io {
        op: Operation,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("task panicked: {0}")]
    Panicked(Cow<'static, str>),
}

/// 套接字层统一的 `Result` 别名。
pub type Result<T, E = SocketError> = std::result::Result<T, E>;

impl SocketError {
    /// 将 IO 错误包装为带操作上下文的传输错误。
    pub fn io(op: Operation, error: io::Error) -> Self {
        SocketError::Io {
            op,
            source: Arc::new(error),
        }
    }

    pub fn address(address: impl Into<String>, reason: impl Into<Cow<'static, str>>) -> Self {
        SocketError::Address {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            Cow::Borrowed(*text)
        } else if let Some(text) = payload.downcast_ref::<String>() {
            Cow::Owned(text.clone())
        } else {
            Cow::Borrowed("non-string panic payload")
        };
        SocketError::Panicked(message)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::Instance => "spark.socket.instance",
            SocketError::UnsupportedProtocol(_) => "spark.socket.unsupported_protocol",
            SocketError::NotConnected => "spark.socket.not_connected",
            SocketError::Address { .. } => "spark.socket.invalid_address",
            SocketError::InvalidGroup(_) => "spark.socket.invalid_group",
            SocketError::TlsUnsupported(_) => "spark.socket.tls_unsupported",
            SocketError::TlsConfig(_) => "spark.socket.tls_config",
            SocketError::AlreadyListening => "spark.socket.already_listening",
            SocketError::ServerClosed => "spark.socket.server_closed",
            SocketError::ShutdownTimeout { .. } => "spark.socket.shutdown_timeout",
            SocketError::Cancelled { .. } => "spark.socket.cancelled",
            SocketError::Timeout { .. } => "spark.socket.timeout",
            SocketError::Io { op, .. } => op.code,
            SocketError::Panicked(_) => "spark.socket.panicked",
        }
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SocketError::Cancelled { .. } => ErrorCategory::Cancelled,
            SocketError::Timeout { .. } | SocketError::ShutdownTimeout { .. } => {
                ErrorCategory::Timeout
            }
            SocketError::Io { source, .. } => categorize_with_rustls(source),
            SocketError::NotConnected => ErrorCategory::Retryable(Duration::from_millis(50)),
            SocketError::TlsConfig(_) => ErrorCategory::Security(SecurityClass::Authentication),
            _ => ErrorCategory::NonRetryable,
        }
    }

    /// 底层 IO 错误的种类（仅 `Io` 变体）。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SocketError::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    /// 是否属于“连接已被本端关闭”引起的竞态噪声。
    ///
    /// 本端 `close` 与进行中的读写交错时，读写会观察到这些错误；它们不代表故障，
    /// 不应再经由错误回调上报。
    pub fn is_closed_connection(&self) -> bool {
        match self {
            SocketError::NotConnected => true,
            SocketError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

fn categorize_with_rustls(error: &io::Error) -> ErrorCategory {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    categorize_io_error(error)
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => ErrorCategory::Security(SecurityClass::Integrity),
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => {
            ErrorCategory::Security(SecurityClass::Authentication)
        }
        AlertReceived(alert) => alert_to_category(alert),
        PeerIncompatible(_) | HandshakeNotComplete | General(_) => {
            ErrorCategory::Retryable(Duration::from_millis(80))
        }
        _ => ErrorCategory::ProtocolViolation,
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA => ErrorCategory::Security(SecurityClass::Authentication),
        AccessDenied => ErrorCategory::Security(SecurityClass::Authorization),
        CloseNotify | UserCanceled => ErrorCategory::Retryable(Duration::from_millis(30)),
        _ => ErrorCategory::Security(SecurityClass::Integrity),
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(Duration::from_millis(5))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::Retryable(Duration::from_millis(50)),
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => ErrorCategory::ProtocolViolation,
        ErrorKind::OutOfMemory | ErrorKind::WriteZero => ErrorCategory::ResourceExhausted,
        _ => ErrorCategory::NonRetryable,
    }
}
