use crate::addr::TransportAddr;
use crate::session::SessionIo;
use futures::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// 任意字节流（TCP、Unix Stream 以及其上的 TLS）到 [`SessionIo`] 的适配。
///
/// 读写两个方向各自持有一把异步锁，读阻塞时写依旧可以推进，满足半关闭后继续读取响应的需求。
/// 同一方向上的并发调用按获得锁的先后串行执行。
pub struct StreamIo<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    local: TransportAddr,
    peer: TransportAddr,
}

impl<S> StreamIo<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, local: TransportAddr, peer: TransportAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local,
            peer,
        }
    }
}

impl<S> SessionIo for StreamIo<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move { self.reader.lock().await.read(buf).await })
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            writer.write_all(buf).await?;
            writer.flush().await?;
            Ok(buf.len())
        })
    }

    fn half_close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move { self.writer.lock().await.shutdown().await })
    }

    fn local_addr(&self) -> TransportAddr {
        self.local.clone()
    }

    fn peer_addr(&self) -> TransportAddr {
        self.peer.clone()
    }
}
