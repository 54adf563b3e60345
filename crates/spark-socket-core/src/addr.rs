use crate::error::{Operation, Result, SocketError};
use crate::protocol::{Addressing, NetworkProtocol};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// 统一的传输地址：网络地址、文件系统路径，或未命名端点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 状态回调需要以同一签名同时描述 TCP/UDP 与 Unix 套接字的两端地址；
/// - `Unnamed` 覆盖未绑定的 Unix 客户端以及拨号尚未完成时的占位。
///
/// ## 契约（What）
/// - `Display` 对网络地址输出 `ip:port`，对路径输出原始路径，未命名端点输出 `-`；
/// - 值不可变，可在线程间自由克隆。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportAddr {
    Inet(SocketAddr),
    Path(PathBuf),
    Unnamed,
}

impl TransportAddr {
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TransportAddr::Inet(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            TransportAddr::Path(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddr::Inet(addr) => write!(f, "{addr}"),
            TransportAddr::Path(path) => write!(f, "{}", path.display()),
            TransportAddr::Unnamed => f.write_str("-"),
        }
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(addr: SocketAddr) -> Self {
        TransportAddr::Inet(addr)
    }
}

impl From<PathBuf> for TransportAddr {
    fn from(path: PathBuf) -> Self {
        TransportAddr::Path(path)
    }
}

/// 校验地址字符串的形态（不做 DNS 解析）。
///
/// - 网络协议要求 `host:port`，端口必须是合法的 `u16`；IPv6 主机需要方括号；
/// - `allow_empty_host` 为 `true` 时允许 `:port`（服务端监听全部地址）；
/// - 本地路径协议要求非空且不含 NUL 字节的路径。
pub fn validate_address(
    protocol: NetworkProtocol,
    address: &str,
    allow_empty_host: bool,
) -> Result<()> {
    if address.trim().is_empty() {
        return Err(SocketError::address(address, "address must not be empty"));
    }
    if protocol.is_local() {
        if address.contains('\0') {
            return Err(SocketError::address(address, "socket path contains NUL byte"));
        }
        return Ok(());
    }
    let (host, port) = split_host_port(address)?;
    port.parse::<u16>()
        .map_err(|_| SocketError::address(address, "port must be an integer in 0..=65535"))?;
    if host.is_empty() && !allow_empty_host {
        return Err(SocketError::address(address, "host must not be empty"));
    }
    Ok(())
}

fn split_host_port(address: &str) -> Result<(&str, &str)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| SocketError::address(address, "missing port, expected host:port"))?;
    let host = if let Some(stripped) = host.strip_prefix('[') {
        stripped
            .strip_suffix(']')
            .ok_or_else(|| SocketError::address(address, "unterminated IPv6 bracket"))?
    } else if host.contains(':') {
        return Err(SocketError::address(
            address,
            "IPv6 hosts must be enclosed in brackets",
        ));
    } else {
        host
    };
    Ok((host, port))
}

/// 将 `host:port` 解析为符合描述符地址族约束的 `SocketAddr` 列表。
///
/// 监听地址省略主机时，按地址族选择 `0.0.0.0` 或 `[::]`。
pub async fn resolve_inet(protocol: NetworkProtocol, address: &str) -> Result<Vec<SocketAddr>> {
    let (host, port) = split_host_port(address)?;
    let port: u16 = port
        .parse()
        .map_err(|_| SocketError::address(address, "port must be an integer in 0..=65535"))?;
    let candidates: Vec<SocketAddr> = if host.is_empty() {
        match protocol.addressing() {
            Addressing::Ipv6 => vec![SocketAddr::from(([0u16; 8], port))],
            _ => vec![SocketAddr::from(([0u8; 4], port))],
        }
    } else {
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| SocketError::io(Operation::DIAL, err))?
            .collect()
    };
    let filtered: Vec<SocketAddr> = candidates
        .into_iter()
        .filter(|candidate| match protocol.addressing() {
            Addressing::Ipv4 => candidate.is_ipv4(),
            Addressing::Ipv6 => candidate.is_ipv6(),
            _ => true,
        })
        .collect();
    if filtered.is_empty() {
        return Err(SocketError::address(
            address,
            format!("no {protocol} address resolved"),
        ));
    }
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_network_addresses() {
        assert!(validate_address(NetworkProtocol::Tcp, "127.0.0.1:8080", false).is_ok());
        assert!(validate_address(NetworkProtocol::Tcp6, "[::1]:0", false).is_ok());
        assert!(validate_address(NetworkProtocol::Udp, ":9000", true).is_ok());

        for bad in ["", "localhost", "127.0.0.1:http", ":9000", "::1:80", "[::1:80"] {
            let err = validate_address(NetworkProtocol::Tcp, bad, false).unwrap_err();
            assert!(
                matches!(err, SocketError::Address { .. }),
                "地址 `{bad}` 应被判定为非法，实际为 {err:?}"
            );
        }
    }

    #[test]
    fn validates_socket_paths() {
        assert!(validate_address(NetworkProtocol::Unix, "/tmp/spark.sock", false).is_ok());
        assert!(validate_address(NetworkProtocol::Unixgram, "bad\0path", false).is_err());
        assert!(validate_address(NetworkProtocol::Unix, "  ", false).is_err());
    }

    #[tokio::test]
    async fn resolution_respects_address_family() {
        let v4 = resolve_inet(NetworkProtocol::Tcp4, "127.0.0.1:80").await.unwrap();
        assert!(v4.iter().all(SocketAddr::is_ipv4));

        let err = resolve_inet(NetworkProtocol::Tcp6, "127.0.0.1:80")
            .await
            .unwrap_err();
        assert!(matches!(err, SocketError::Address { .. }));

        let wildcard = resolve_inet(NetworkProtocol::Udp6, ":7000").await.unwrap();
        assert_eq!(wildcard, vec![SocketAddr::from(([0u16; 8], 7000))]);
    }

    #[test]
    fn display_is_stable() {
        let inet = TransportAddr::from(SocketAddr::from(([127, 0, 0, 1], 9)));
        assert_eq!(inet.to_string(), "127.0.0.1:9");
        assert_eq!(TransportAddr::Unnamed.to_string(), "-");
        let path = TransportAddr::from(PathBuf::from("/run/a.sock"));
        assert_eq!(path.as_path(), Some(Path::new("/run/a.sock")));
    }
}
