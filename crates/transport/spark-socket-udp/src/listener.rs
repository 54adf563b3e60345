use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use spark_socket_core::{
    Acceptor, Binder, DatagramPayload, Incoming, MAX_DATAGRAM_SIZE, Operation, RawConn, Result,
    ServerConfig, SessionIo, SocketError, TransportAddr, UpdateConnFn, resolve_inet,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// UDP 绑定器：绑定第一个可用的候选地址。
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpBinder;

impl Binder for UdpBinder {
    type Acceptor = UdpAcceptor;

    fn bind<'a>(&'a self, config: &'a ServerConfig) -> BoxFuture<'a, Result<UdpAcceptor>> {
        Box::pin(async move {
            let candidates = resolve_inet(config.network, &config.address).await?;
            let mut last_error = None;
            for candidate in candidates {
                match UdpSocket::bind(candidate).await {
                    Ok(socket) => {
                        let local = socket
                            .local_addr()
                            .map_err(|err| SocketError::io(Operation::BIND, err))?;
                        tracing::debug!(target: "spark_socket::udp", %local, "udp socket bound");
                        return Ok(UdpAcceptor {
                            socket: Arc::new(socket),
                            local,
                            buffer: Mutex::new(BytesMut::zeroed(MAX_DATAGRAM_SIZE)),
                        });
                    }
                    Err(err) => last_error = Some(SocketError::io(Operation::BIND, err)),
                }
            }
            Err(last_error.unwrap_or_else(|| {
                SocketError::address(config.address.clone(), "no bindable address")
            }))
        })
    }
}

/// 已绑定的 UDP 服务端套接字；每次 `accept` 接收一个报文。
pub struct UdpAcceptor {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    buffer: Mutex<BytesMut>,
}

impl Acceptor for UdpAcceptor {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.local)
    }

    fn update_conn(&self, hook: &UpdateConnFn) {
        hook(RawConn::Udp(&self.socket));
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn Incoming>>> {
        Box::pin(async move {
            let mut buffer = self.buffer.lock().await;
            let (len, peer) = self.socket.recv_from(&mut buffer[..]).await?;
            let incoming: Box<dyn Incoming> = Box::new(UdpDatagram {
                socket: Arc::clone(&self.socket),
                payload: Bytes::copy_from_slice(&buffer[..len]),
                local: self.local,
                peer,
            });
            Ok(incoming)
        })
    }
}

struct UdpDatagram {
    socket: Arc<UdpSocket>,
    payload: Bytes,
    local: SocketAddr,
    peer: SocketAddr,
}

impl Incoming for UdpDatagram {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.local)
    }

    fn peer_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.peer)
    }

    fn establish(self: Box<Self>) -> BoxFuture<'static, Result<Arc<dyn SessionIo>>> {
        let io: Arc<dyn SessionIo> = Arc::new(UdpReply {
            payload: DatagramPayload::new(self.payload),
            socket: self.socket,
            local: self.local,
            peer: self.peer,
        });
        Box::pin(async move { Ok(io) })
    }
}

/// 单个报文的会话 IO：读取报文内容，回复发往发送方。
struct UdpReply {
    socket: Arc<UdpSocket>,
    payload: DatagramPayload,
    local: SocketAddr,
    peer: SocketAddr,
}

impl SessionIo for UdpReply {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        let read = self.payload.take_into(buf);
        Box::pin(async move { Ok(read) })
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.socket.send_to(buf, self.peer))
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
