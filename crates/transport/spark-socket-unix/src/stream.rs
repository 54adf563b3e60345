use crate::file::SocketFile;
use futures::future::BoxFuture;
use spark_socket_core::util::run_with_context;
use spark_socket_core::{
    Acceptor, Binder, CallContext, ClientConfig, Deadline, Dialer, Incoming, Operation, RawConn,
    Result, ServerConfig, SessionIo, SocketError, StreamIo, TlsConfigProvider, TransportAddr,
    UpdateConnFn,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::unix::SocketAddr;
use tokio::net::{UnixListener, UnixStream};

fn transport_addr(addr: io::Result<SocketAddr>) -> TransportAddr {
    match addr.ok().as_ref().and_then(SocketAddr::as_pathname) {
        Some(path) => TransportAddr::Path(path.to_path_buf()),
        None => TransportAddr::Unnamed,
    }
}

/// Unix Stream 拨号器；配置开启 TLS 时在连接上完成握手（需显式服务器名）。
#[derive(Clone, Copy, Debug, Default)]
pub struct UnixDialer;

impl Dialer for UnixDialer {
    fn dial<'a>(
        &'a self,
        ctx: &'a CallContext,
        config: &'a ClientConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn SessionIo>>> {
        Box::pin(async move {
            let path = PathBuf::from(&config.address);
            let stream = run_with_context(
                ctx,
                None,
                Deadline::none(),
                Operation::DIAL,
                UnixStream::connect(&path),
            )
            .await?;
            let local = transport_addr(stream.local_addr());
            let stream = spark_socket_tls::upgrade_client(ctx, config, stream).await?;
            let io: Arc<dyn SessionIo> =
                Arc::new(StreamIo::new(stream, local, TransportAddr::Path(path)));
            Ok(io)
        })
    }
}

/// Unix Stream 绑定器：认领路径、绑定、设置权限与属组。
#[derive(Clone, Copy, Debug, Default)]
pub struct UnixBinder;

impl Binder for UnixBinder {
    type Acceptor = UnixAcceptor;

    fn bind<'a>(&'a self, config: &'a ServerConfig) -> BoxFuture<'a, Result<UnixAcceptor>> {
        Box::pin(async move {
            let file = SocketFile::claim(&config.address)?;
            let listener =
                UnixListener::bind(file.path()).map_err(|err| SocketError::io(Operation::BIND, err))?;
            file.configure(config.perm_file, config.group_perm)?;
            tracing::debug!(
                target: "spark_socket::unix",
                path = %file.path().display(),
                mode = format_args!("{:o}", config.perm_file.bits()),
                group = ?config.group_perm.map(|group| group.get()),
                "unix listener bound"
            );
            Ok(UnixAcceptor {
                listener,
                tls: config.tls_provider().cloned(),
                file,
            })
        })
    }
}

/// 已绑定的 Unix Stream 监听器；被丢弃时删除套接字文件。
pub struct UnixAcceptor {
    listener: UnixListener,
    tls: Option<Arc<dyn TlsConfigProvider>>,
    // 最后释放：先关闭监听器再删除文件。
    file: SocketFile,
}

impl Acceptor for UnixAcceptor {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Path(self.file.path().to_path_buf())
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn Incoming>>> {
        Box::pin(async move {
            let (stream, peer) = self.listener.accept().await?;
            let incoming: Box<dyn Incoming> = Box::new(UnixIncoming {
                stream,
                local: self.local_addr(),
                peer: transport_addr(Ok(peer)),
                tls: self.tls.clone(),
            });
            Ok(incoming)
        })
    }
}

struct UnixIncoming {
    stream: UnixStream,
    local: TransportAddr,
    peer: TransportAddr,
    tls: Option<Arc<dyn TlsConfigProvider>>,
}

impl Incoming for UnixIncoming {
    fn local_addr(&self) -> TransportAddr {
        self.local.clone()
    }

    fn peer_addr(&self) -> TransportAddr {
        self.peer.clone()
    }

    fn update_conn(&self, hook: &UpdateConnFn) {
        hook(RawConn::Unix(&self.stream));
    }

    fn establish(self: Box<Self>) -> BoxFuture<'static, Result<Arc<dyn SessionIo>>> {
        Box::pin(async move {
            let UnixIncoming {
                stream,
                local,
                peer,
                tls,
            } = *self;
            let stream = spark_socket_tls::upgrade_server(tls.as_ref(), stream).await?;
            let io: Arc<dyn SessionIo> = Arc::new(StreamIo::new(stream, local, peer));
            Ok(io)
        })
    }
}
