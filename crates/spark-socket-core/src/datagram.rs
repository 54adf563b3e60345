use arc_swap::ArcSwapOption;
use bytes::Bytes;
use std::sync::Arc;

/// 数据报会话持有的单个报文。
///
/// 服务端按“每个报文一个会话”分发：首次读取交出报文内容，此后读取返回 `0`，
/// 与字节流会话读到 EOF 的语义一致，处理函数因此可以统一使用 `read_to_end`。
#[derive(Debug)]
pub struct DatagramPayload {
    pending: ArcSwapOption<Bytes>,
}

impl DatagramPayload {
    pub fn new(payload: Bytes) -> Self {
        Self {
            pending: ArcSwapOption::new(Some(Arc::new(payload))),
        }
    }

    /// 取出报文写入 `buf`；超出缓冲区的部分按数据报语义截断。
    pub fn take_into(&self, buf: &mut [u8]) -> usize {
        match self.pending.swap(None) {
            Some(payload) => {
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                len
            }
            None => 0,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.pending.load().is_none()
    }
}
