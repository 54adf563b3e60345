use futures::future::BoxFuture;
use spark_socket_core::util::{race, run_with_context};
use spark_socket_core::{
    CallContext, ClientConfig, Deadline, Dialer, Operation, Result, SessionIo, SocketError,
    TransportAddr, resolve_inet,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// UDP 拨号器。
///
/// “拨号”只做本地绑定与 `connect`：绑定与目标同地址族的通配地址，
/// 之后内核只投递来自该目标的报文。
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpDialer;

impl Dialer for UdpDialer {
    fn dial<'a>(
        &'a self,
        ctx: &'a CallContext,
        config: &'a ClientConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn SessionIo>>> {
        Box::pin(async move {
            let candidates = race(
                ctx,
                None,
                Deadline::none(),
                Operation::DIAL,
                resolve_inet(config.network, &config.address),
            )
            .await??;
            let mut last_error = None;
            for target in candidates {
                match run_with_context(
                    ctx,
                    None,
                    Deadline::none(),
                    Operation::DIAL,
                    connect_to(target),
                )
                .await
                {
                    Ok(io) => {
                        tracing::debug!(
                            target: "spark_socket::udp",
                            local = %io.local,
                            peer = %io.peer,
                            "udp socket connected"
                        );
                        let io: Arc<dyn SessionIo> = Arc::new(io);
                        return Ok(io);
                    }
                    Err(error @ (SocketError::Cancelled { .. } | SocketError::Timeout { .. })) => {
                        return Err(error);
                    }
                    Err(error) => last_error = Some(error),
                }
            }
            Err(last_error.unwrap_or(SocketError::NotConnected))
        })
    }
}

async fn connect_to(target: SocketAddr) -> io::Result<UdpIo> {
    let wildcard: SocketAddr = if target.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    };
    let socket = UdpSocket::bind(wildcard).await?;
    socket.connect(target).await?;
    let local = socket.local_addr()?;
    Ok(UdpIo {
        socket,
        local,
        peer: target,
    })
}

/// 已 `connect` 的 UDP 套接字。
#[derive(Debug)]
pub struct UdpIo {
    socket: UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
}

impl SessionIo for UdpIo {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.socket.recv(buf))
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.socket.send(buf))
    }

    fn half_close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.local)
    }

    fn peer_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.peer)
    }

    fn is_datagram(&self) -> bool {
        true
    }
}
