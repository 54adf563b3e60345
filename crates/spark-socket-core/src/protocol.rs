use crate::error::SocketError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 套接字族：面向连接的字节流或无连接的数据报。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketFamily {
    /// 有序、可靠的字节流（TCP、Unix Stream）。
    Stream,
    /// 无序、尽力而为的数据报（UDP、Unixgram）。
    Datagram,
}

/// 地址族约束。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Addressing {
    /// 由解析结果决定 IPv4 或 IPv6。
    Unspecified,
    Ipv4,
    Ipv6,
    /// 文件系统路径（Unix Domain Socket）。
    LocalPath,
}

/// 协议描述符：`tcp`、`tcp4`、`tcp6`、`udp`、`udp4`、`udp6`、`unix`、`unixgram`。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以闭合枚举替代字符串分支，让工厂、配置与运行时共享同一份“族 × 地址”语义；
/// - 平台可用性集中在 [`NetworkProtocol::is_available`]，调用方无需自行编写 `cfg`。
///
/// ## 契约（What）
/// - 解析大小写不敏感且忽略首尾空白，未知取值返回 [`SocketError::UnsupportedProtocol`]；
/// - 描述符一经解析即不可变，`Display`/`serde` 输出稳定的小写字符串；
/// - 本地路径协议在不支持文件系统套接字的平台上依旧可以解析，仅
///   `is_available` 返回 `false`，由工厂给出“不支持”信号而非报错。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkProtocol {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
    Unixgram,
}

impl NetworkProtocol {
    /// 全部已识别的描述符，按字符串形式的声明顺序排列。
    pub const ALL: [NetworkProtocol; 8] = [
        NetworkProtocol::Tcp,
        NetworkProtocol::Tcp4,
        NetworkProtocol::Tcp6,
        NetworkProtocol::Udp,
        NetworkProtocol::Udp4,
        NetworkProtocol::Udp6,
        NetworkProtocol::Unix,
        NetworkProtocol::Unixgram,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            NetworkProtocol::Tcp => "tcp",
            NetworkProtocol::Tcp4 => "tcp4",
            NetworkProtocol::Tcp6 => "tcp6",
            NetworkProtocol::Udp => "udp",
            NetworkProtocol::Udp4 => "udp4",
            NetworkProtocol::Udp6 => "udp6",
            NetworkProtocol::Unix => "unix",
            NetworkProtocol::Unixgram => "unixgram",
        }
    }

    pub const fn family(self) -> SocketFamily {
        match self {
            NetworkProtocol::Tcp
            | NetworkProtocol::Tcp4
            | NetworkProtocol::Tcp6
            | NetworkProtocol::Unix => SocketFamily::Stream,
            NetworkProtocol::Udp
            | NetworkProtocol::Udp4
            | NetworkProtocol::Udp6
            | NetworkProtocol::Unixgram => SocketFamily::Datagram,
        }
    }

    pub const fn addressing(self) -> Addressing {
        match self {
            NetworkProtocol::Tcp | NetworkProtocol::Udp => Addressing::Unspecified,
            NetworkProtocol::Tcp4 | NetworkProtocol::Udp4 => Addressing::Ipv4,
            NetworkProtocol::Tcp6 | NetworkProtocol::Udp6 => Addressing::Ipv6,
            NetworkProtocol::Unix | NetworkProtocol::Unixgram => Addressing::LocalPath,
        }
    }

    pub const fn is_stream(self) -> bool {
        matches!(self.family(), SocketFamily::Stream)
    }

    pub const fn is_datagram(self) -> bool {
        matches!(self.family(), SocketFamily::Datagram)
    }

    pub const fn is_local(self) -> bool {
        matches!(self.addressing(), Addressing::LocalPath)
    }

    /// TLS 仅能附着在字节流之上。
    pub const fn supports_tls(self) -> bool {
        self.is_stream()
    }

    /// 当前编译目标是否具备该协议所需的套接字能力。
    pub const fn is_available(self) -> bool {
        !self.is_local() || cfg!(unix)
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkProtocol {
    type Err = SocketError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        NetworkProtocol::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == normalized)
            .ok_or_else(|| SocketError::UnsupportedProtocol(raw.to_owned()))
    }
}

impl TryFrom<String> for NetworkProtocol {
    type Error = SocketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkProtocol> for String {
    fn from(value: NetworkProtocol) -> Self {
        value.as_str().to_owned()
    }
}
