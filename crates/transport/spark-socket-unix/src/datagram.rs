use crate::file::{SocketFile, unique_temp_path};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use spark_socket_core::{
    Acceptor, Binder, CallContext, ClientConfig, DatagramPayload, Dialer, Incoming,
    MAX_DATAGRAM_SIZE, Operation, RawConn, Result, ServerConfig, SessionIo, SocketError,
    TransportAddr, UpdateConnFn,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixDatagram;
use tokio::sync::Mutex;

/// Unix Datagram 拨号器。
///
/// 未命名的数据报套接字无法收到回复，因此客户端先在临时目录绑定一个唯一路径，
/// 再 `connect` 到服务端；该文件随连接释放而删除。
#[derive(Clone, Copy, Debug, Default)]
pub struct UnixgramDialer;

impl Dialer for UnixgramDialer {
    fn dial<'a>(
        &'a self,
        ctx: &'a CallContext,
        config: &'a ClientConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn SessionIo>>> {
        Box::pin(async move {
            let peer = PathBuf::from(&config.address);
            if ctx.is_cancelled() {
                return Err(SocketError::Cancelled { op: Operation::DIAL });
            }
            if ctx.deadline().is_expired() {
                return Err(SocketError::Timeout { op: Operation::DIAL });
            }
            // 绑定与 connect 均为同步系统调用，不存在挂起点。
            let file = SocketFile::claim(unique_temp_path("client"))?;
            let socket = UnixDatagram::bind(file.path())
                .map_err(|err| SocketError::io(Operation::DIAL, err))?;
            socket
                .connect(&peer)
                .map_err(|err| SocketError::io(Operation::DIAL, err))?;
            let io = UnixgramIo { socket, peer, file };
            tracing::debug!(
                target: "spark_socket::unix",
                local = %io.file.path().display(),
                peer = %io.peer.display(),
                "unixgram socket connected"
            );
            let io: Arc<dyn SessionIo> = Arc::new(io);
            Ok(io)
        })
    }
}

/// 已 `connect` 的 Unix 数据报客户端套接字。
pub struct UnixgramIo {
    socket: UnixDatagram,
    peer: PathBuf,
    file: SocketFile,
}

impl SessionIo for UnixgramIo {
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
        TransportAddr::Path(self.file.path().to_path_buf())
    }

    fn peer_addr(&self) -> TransportAddr {
        TransportAddr::Path(self.peer.clone())
    }

    fn is_datagram(&self) -> bool {
        true
    }
}

/// Unix Datagram 绑定器，文件处理与字节流一致。
#[derive(Clone, Copy, Debug, Default)]
pub struct UnixgramBinder;

impl Binder for UnixgramBinder {
    type Acceptor = UnixgramAcceptor;

    fn bind<'a>(&'a self, config: &'a ServerConfig) -> BoxFuture<'a, Result<UnixgramAcceptor>> {
        Box::pin(async move {
            let file = SocketFile::claim(&config.address)?;
            let socket =
                UnixDatagram::bind(file.path()).map_err(|err| SocketError::io(Operation::BIND, err))?;
            file.configure(config.perm_file, config.group_perm)?;
            tracing::debug!(
                target: "spark_socket::unix",
                path = %file.path().display(),
                "unixgram socket bound"
            );
            Ok(UnixgramAcceptor {
                socket: Arc::new(socket),
                buffer: Mutex::new(BytesMut::zeroed(MAX_DATAGRAM_SIZE)),
                file,
            })
        })
    }
}

/// 已绑定的 Unix 数据报服务端套接字；每次 `accept` 接收一个报文。
pub struct UnixgramAcceptor {
    socket: Arc<UnixDatagram>,
    buffer: Mutex<BytesMut>,
    file: SocketFile,
}

impl Acceptor for UnixgramAcceptor {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Path(self.file.path().to_path_buf())
    }

    fn update_conn(&self, hook: &UpdateConnFn) {
        hook(RawConn::Unixgram(&self.socket));
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn Incoming>>> {
        Box::pin(async move {
            let mut buffer = self.buffer.lock().await;
            let (len, peer) = self.socket.recv_from(&mut buffer[..]).await?;
            let incoming: Box<dyn Incoming> = Box::new(UnixgramDatagram {
                socket: Arc::clone(&self.socket),
                payload: Bytes::copy_from_slice(&buffer[..len]),
                local: self.local_addr(),
                peer: peer.as_pathname().map(|path| path.to_path_buf()),
            });
            Ok(incoming)
        })
    }
}

struct UnixgramDatagram {
    socket: Arc<UnixDatagram>,
    payload: Bytes,
    local: TransportAddr,
    peer: Option<PathBuf>,
}

impl Incoming for UnixgramDatagram {
    fn local_addr(&self) -> TransportAddr {
        self.local.clone()
    }

    fn peer_addr(&self) -> TransportAddr {
        self.peer
            .clone()
            .map_or(TransportAddr::Unnamed, TransportAddr::Path)
    }

    fn establish(self: Box<Self>) -> BoxFuture<'static, Result<Arc<dyn SessionIo>>> {
        let io: Arc<dyn SessionIo> = Arc::new(UnixgramReply {
            payload: DatagramPayload::new(self.payload),
            socket: self.socket,
            local: self.local,
            peer: self.peer,
        });
        Box::pin(async move { Ok(io) })
    }
}

/// 单个报文的会话 IO；发送方未绑定路径时无法回复。
struct UnixgramReply {
    socket: Arc<UnixDatagram>,
    payload: DatagramPayload,
    local: TransportAddr,
    peer: Option<PathBuf>,
}

impl SessionIo for UnixgramReply {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        let read = self.payload.take_into(buf);
        Box::pin(async move { Ok(read) })
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            match &self.peer {
                Some(peer) => self.socket.send_to(buf, peer).await,
                None => Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "datagram sender is unnamed and cannot receive replies",
                )),
            }
        })
    }

    fn half_close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn local_addr(&self) -> TransportAddr {
        self.local.clone()
    }

    fn peer_addr(&self) -> TransportAddr {
        self.peer
            .clone()
            .map_or(TransportAddr::Unnamed, TransportAddr::Path)
    }

    fn is_datagram(&self) -> bool {
        true
    }
}
