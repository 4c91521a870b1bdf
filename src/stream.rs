/// 隧道桥接适配器
///
/// 隧道契约是挂起式的整块读写，这里把它适配成两种外部契约：
/// TunnelStream 提供带缓冲的字节流读取（定长/部分/按模式分隔），
/// TunnelTransport 把到达的数据块直接推送给回调
use crate::error::{Result, TunnelError};
use crate::tunnel::{SocketInfo, TunnelRef};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// 出站写入队列深度，满时 write 产生背压
const WRITE_QUEUE_DEPTH: usize = 32;

/// 收包累积缓冲：排水任务独占写入，适配器调用方独占消费，
/// 就绪通过 Notify 通知，不做固定间隔轮询
struct Accumulator {
    buf: StdMutex<BytesMut>,
    notify: Notify,
    closed: AtomicBool,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            buf: StdMutex::new(BytesMut::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, chunk: &[u8]) {
        self.buf.lock().unwrap().extend_from_slice(chunk);
        self.notify.notify_one();
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 启动出站写入任务：按序执行隧道写入，失败时告警并关闭
/// 隧道，让失败对读取方可观测
fn spawn_writer(tunnel: TunnelRef, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = tunnel.write(&chunk).await {
                warn!("[TunnelStream] Outbound write failed: {}", e);
                tunnel.close().await;
                break;
            }
        }
    });
}

/// 隧道到缓冲字节流的适配器
pub struct TunnelStream {
    tunnel: TunnelRef,
    shared: Arc<Accumulator>,
    write_tx: mpsc::Sender<Bytes>,
    close_callback: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TunnelStream {
    pub fn new(tunnel: TunnelRef) -> Self {
        let shared = Arc::new(Accumulator::new());
        let drain_shared = shared.clone();
        let drain_tunnel = tunnel.clone();
        tokio::spawn(async move {
            // 隧道关闭是正常收尾，排水任务静默退出
            while let Ok(chunk) = drain_tunnel.read().await {
                debug!("[TunnelStream] Recv {} bytes from upstream", chunk.len());
                drain_shared.push(&chunk);
            }
            drain_shared.mark_closed();
        });

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        spawn_writer(tunnel.clone(), write_rx);

        Self {
            tunnel,
            shared,
            write_tx,
            close_callback: StdMutex::new(None),
        }
    }

    /// 读取定长数据
    ///
    /// partial 为真时只要缓冲非空即返回现有前缀，否则等满
    /// num_bytes 字节；隧道先关闭则报 Closed
    pub async fn read_bytes(&self, num_bytes: usize, partial: bool) -> Result<Bytes> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut buf = self.shared.buf.lock().unwrap();
                if buf.len() >= num_bytes {
                    return Ok(buf.split_to(num_bytes).freeze());
                }
                if partial && !buf.is_empty() {
                    let len = buf.len();
                    return Ok(buf.split_to(len).freeze());
                }
                if self.shared.is_closed() {
                    return Err(TunnelError::closed("TunnelStream"));
                }
            }
            notified.await;
        }
    }

    /// 读取到首个模式匹配处（含模式本身），剩余字节留在
    /// 缓冲中供下次读取
    pub async fn read_until(&self, pattern: &[u8]) -> Result<Bytes> {
        if pattern.is_empty() {
            return Ok(Bytes::new());
        }
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut buf = self.shared.buf.lock().unwrap();
                if let Some(pos) = buf.windows(pattern.len()).position(|w| w == pattern) {
                    return Ok(buf.split_to(pos + pattern.len()).freeze());
                }
                if self.shared.is_closed() {
                    return Err(TunnelError::closed("TunnelStream"));
                }
            }
            notified.await;
        }
    }

    /// 写入：入队即报整块长度已接受，实际写入由出站任务
    /// 按序完成；队列满时挂起形成背压
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data: Bytes = data.into();
        let len = data.len();
        self.write_tx
            .send(data)
            .await
            .map_err(|_| TunnelError::closed("TunnelStream"))?;
        Ok(len)
    }

    /// 注册关闭回调，close 时执行一次
    pub fn set_close_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *self.close_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// 执行关闭回调并释放被包装的隧道
    pub async fn close(&self) {
        let callback = self.close_callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
        self.tunnel.close().await;
    }

    pub fn socket_info(&self) -> Result<SocketInfo> {
        self.tunnel.socket_info()
    }
}

/// 隧道到推送式传输的适配器
///
/// 到达的数据块不经累积，立刻交给注册的处理回调
pub struct TunnelTransport {
    tunnel: TunnelRef,
    write_tx: mpsc::Sender<Bytes>,
}

impl TunnelTransport {
    pub fn new(tunnel: TunnelRef, handler: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        let drain_tunnel = tunnel.clone();
        tokio::spawn(async move {
            while let Ok(chunk) = drain_tunnel.read().await {
                handler(chunk);
            }
        });

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        spawn_writer(tunnel.clone(), write_rx);

        Self { tunnel, write_tx }
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data: Bytes = data.into();
        let len = data.len();
        self.write_tx
            .send(data)
            .await
            .map_err(|_| TunnelError::closed("TunnelTransport"))?;
        Ok(len)
    }

    /// 立刻关闭被包装的隧道，排水任务随之结束
    pub async fn abort(&self) {
        self.tunnel.close().await;
    }

    pub fn socket_info(&self) -> Result<SocketInfo> {
        self.tunnel.socket_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{TunnelAddress, TunnelUrl};
    use crate::tunnel::{StateCell, Tunnel, TunnelState};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::{sleep, timeout};

    /// 测试用脚本隧道：读取来自通道，写入记录在内存
    #[derive(Debug)]
    struct ScriptedTunnel {
        address: TunnelAddress,
        rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
        written: Arc<StdMutex<Vec<u8>>>,
        state: StateCell,
    }

    fn scripted() -> (Arc<ScriptedTunnel>, mpsc::UnboundedSender<Bytes>, Arc<StdMutex<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(StdMutex::new(Vec::new()));
        let tunnel = Arc::new(ScriptedTunnel {
            address: TunnelAddress::new("test", 1),
            rx: Mutex::new(rx),
            written: written.clone(),
            state: StateCell::new(TunnelState::Connected),
        });
        (tunnel, tx, written)
    }

    #[async_trait]
    impl Tunnel for ScriptedTunnel {
        fn name(&self) -> &'static str {
            "ScriptedTunnel"
        }
        fn address(&self) -> &TunnelAddress {
            &self.address
        }
        fn url(&self) -> Option<&TunnelUrl> {
            None
        }
        fn state(&self) -> TunnelState {
            self.state.get()
        }
        fn socket_info(&self) -> Result<crate::tunnel::SocketInfo> {
            Err(TunnelError::unsupported("socket_info"))
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn read(&self) -> Result<Bytes> {
            if self.state.get() == TunnelState::Closed {
                return Err(TunnelError::closed("ScriptedTunnel"));
            }
            match self.rx.lock().await.recv().await {
                Some(chunk) => Ok(chunk),
                None => Err(TunnelError::closed("ScriptedTunnel")),
            }
        }
        async fn write(&self, buf: &[u8]) -> Result<()> {
            if self.state.get() == TunnelState::Closed {
                return Err(TunnelError::closed("ScriptedTunnel"));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }
        async fn close(&self) {
            self.state.close();
        }
    }

    #[tokio::test]
    async fn test_read_bytes_waits_for_full_length() {
        let (tunnel, tx, _) = scripted();
        let stream = TunnelStream::new(tunnel);

        tx.send(Bytes::from_static(b"ab")).unwrap();
        let reader = stream.read_bytes(4, false);
        let feeder = async {
            sleep(Duration::from_millis(20)).await;
            tx.send(Bytes::from_static(b"cd")).unwrap();
        };
        let (result, _) = tokio::join!(reader, feeder);
        assert_eq!(&result.unwrap()[..], b"abcd");
    }

    #[tokio::test]
    async fn test_read_bytes_partial_returns_available() {
        let (tunnel, tx, _) = scripted();
        let stream = TunnelStream::new(tunnel);

        tx.send(Bytes::from_static(b"ab")).unwrap();
        let chunk = timeout(Duration::from_secs(1), stream.read_bytes(10, true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&chunk[..], b"ab");
    }

    #[tokio::test]
    async fn test_read_bytes_closed_before_satisfied() {
        let (tunnel, tx, _) = scripted();
        let stream = TunnelStream::new(tunnel);

        tx.send(Bytes::from_static(b"ab")).unwrap();
        drop(tx);
        let err = timeout(Duration::from_secs(1), stream.read_bytes(4, false))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_read_until_across_fragments() {
        let (tunnel, tx, _) = scripted();
        let stream = TunnelStream::new(tunnel);

        // 分隔符本身也可能被拆开到达
        tx.send(Bytes::from_static(b"hel")).unwrap();
        tx.send(Bytes::from_static(b"lo\r")).unwrap();
        tx.send(Bytes::from_static(b"\nworld")).unwrap();

        let line = timeout(Duration::from_secs(1), stream.read_until(b"\r\n"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&line[..], b"hello\r\n");

        // 剩余字节仍在缓冲中
        tx.send(Bytes::from_static(b"\r\n")).unwrap();
        let line = timeout(Duration::from_secs(1), stream.read_until(b"\r\n"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&line[..], b"world\r\n");
    }

    #[tokio::test]
    async fn test_write_reports_length_and_lands_in_order() {
        let (tunnel, _tx, written) = scripted();
        let stream = TunnelStream::new(tunnel);

        assert_eq!(stream.write(Bytes::from_static(b"one")).await.unwrap(), 3);
        assert_eq!(stream.write(Bytes::from_static(b"two")).await.unwrap(), 3);

        // 写入由出站任务异步完成
        for _ in 0..50 {
            if written.lock().unwrap().len() >= 6 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(written.lock().unwrap().as_slice(), b"onetwo");
    }

    #[tokio::test]
    async fn test_close_runs_callback_once() {
        let (tunnel, _tx, _) = scripted();
        let stream = TunnelStream::new(tunnel.clone());

        let count = Arc::new(StdMutex::new(0u32));
        let count_clone = count.clone();
        stream.set_close_callback(move || {
            *count_clone.lock().unwrap() += 1;
        });

        stream.close().await;
        stream.close().await;
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_transport_pushes_chunks_to_handler() {
        let (tunnel, tx, _) = scripted();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        let transport = TunnelTransport::new(tunnel.clone(), move |chunk| {
            received_clone.lock().unwrap().extend_from_slice(&chunk);
        });

        tx.send(Bytes::from_static(b"push")).unwrap();
        tx.send(Bytes::from_static(b"ed")).unwrap();
        for _ in 0..50 {
            if received.lock().unwrap().len() >= 6 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.lock().unwrap().as_slice(), b"pushed");

        transport.abort().await;
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }
}
