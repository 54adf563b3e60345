use futures::future::BoxFuture;
use spark_socket_core::{
    Acceptor, Binder, Incoming, Operation, RawConn, Result, ServerConfig, SessionIo, SocketError,
    StreamIo, TlsConfigProvider, TransportAddr, UpdateConnFn, resolve_inet,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// TCP 绑定器。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// - 将监听地址解析为候选列表（省略主机时按地址族选择通配地址），绑定第一个成功的候选；
/// - 实际绑定地址（端口 0 时由系统分配）记录在 [`TcpAcceptor`] 上；
/// - TLS 握手推迟到每条连接自己的任务中，慢握手不会阻塞 accept 循环。
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpBinder;

impl Binder for TcpBinder {
    type Acceptor = TcpAcceptor;

    fn bind<'a>(&'a self, config: &'a ServerConfig) -> BoxFuture<'a, Result<TcpAcceptor>> {
        Box::pin(async move {
            let candidates = resolve_inet(config.network, &config.address).await?;
            let mut last_error = None;
            for candidate in candidates {
                match TcpListener::bind(candidate).await {
                    Ok(listener) => {
                        let local = listener
                            .local_addr()
                            .map_err(|err| SocketError::io(Operation::BIND, err))?;
                        tracing::debug!(
                            target: "spark_socket::tcp",
                            %local,
                            tls = config.tls.enabled,
                            "tcp listener bound"
                        );
                        return Ok(TcpAcceptor {
                            listener,
                            local,
                            tls: config.tls_provider().cloned(),
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

/// 已绑定的 TCP 监听器。
pub struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
    tls: Option<Arc<dyn TlsConfigProvider>>,
}

impl Acceptor for TcpAcceptor {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.local)
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Box<dyn Incoming>>> {
        Box::pin(async move {
            let (stream, peer) = self.listener.accept().await?;
            let incoming: Box<dyn Incoming> = Box::new(TcpIncoming {
                stream,
                local: self.local,
                peer,
                tls: self.tls.clone(),
            });
            Ok(incoming)
        })
    }
}

struct TcpIncoming {
    stream: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    tls: Option<Arc<dyn TlsConfigProvider>>,
}

impl Incoming for TcpIncoming {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.local)
    }

    fn peer_addr(&self) -> TransportAddr {
        TransportAddr::Inet(self.peer)
    }

    fn update_conn(&self, hook: &UpdateConnFn) {
        hook(RawConn::Tcp(&self.stream));
    }

    fn establish(self: Box<Self>) -> BoxFuture<'static, Result<Arc<dyn SessionIo>>> {
        Box::pin(async move {
            let TcpIncoming {
                stream,
                local,
                peer,
                tls,
            } = *self;
            let _ = stream.set_nodelay(true);
            let stream = spark_socket_tls::upgrade_server(tls.as_ref(), stream).await?;
            let io: Arc<dyn SessionIo> = Arc::new(StreamIo::new(
                stream,
                TransportAddr::Inet(local),
                TransportAddr::Inet(peer),
            ));
            Ok(io)
        })
    }
}
