/// TCP 隧道
///
/// 链路的叶子层或纯委托层：要么持有真实 socket，要么
/// 包装另一条隧道原样转发
use super::{describe, SocketInfo, StateCell, Tunnel, TunnelRef, TunnelState, CHUNK_SIZE};
use crate::endpoint::{resolve_address, TunnelAddress, TunnelUrl};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
pub struct TcpTunnel {
    address: TunnelAddress,
    url: Option<TunnelUrl>,
    /// 委托模式下持有的下层隧道
    lower: Option<TunnelRef>,
    /// socket 模式下的读写两半，connect 后填充
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    socket_info: StdMutex<Option<SocketInfo>>,
    state: StateCell,
    /// 关闭信号，唤醒阻塞中的读写
    closed: CancellationToken,
    /// connect() 是否需要发起网络连接
    dial: bool,
}

impl TcpTunnel {
    /// 包装一个已接受/已连接的 socket
    ///
    /// 未显式给出地址时，服务端取本端地址，客户端取对端地址
    pub fn from_stream(
        stream: TcpStream,
        url: Option<TunnelUrl>,
        address: Option<TunnelAddress>,
        server_side: bool,
    ) -> Result<Self> {
        let info = SocketInfo {
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
        };
        let address = match address {
            Some(addr) => addr,
            None => {
                let derived = if server_side { info.local_addr } else { info.peer_addr };
                TunnelAddress::new(derived.ip().to_string(), derived.port())
            }
        };
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            address,
            url,
            lower: None,
            reader: Mutex::new(Some(read_half)),
            writer: Mutex::new(Some(write_half)),
            socket_info: StdMutex::new(Some(info)),
            state: StateCell::new(TunnelState::Connected),
            closed: CancellationToken::new(),
            dial: false,
        })
    }

    /// 创建待连接的隧道，connect() 时发起网络连接
    pub fn dial(url: Option<TunnelUrl>, address: Option<TunnelAddress>) -> Result<Self> {
        let address = resolve_address(address, url.as_ref())?;
        Ok(Self {
            address,
            url,
            lower: None,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            socket_info: StdMutex::new(None),
            state: StateCell::new(TunnelState::NotConnected),
            closed: CancellationToken::new(),
            dial: true,
        })
    }

    /// 包装另一条隧道，读写原样委托
    pub fn wrap(
        lower: TunnelRef,
        url: Option<TunnelUrl>,
        address: Option<TunnelAddress>,
    ) -> Result<Self> {
        let address = match resolve_address(address, url.as_ref()) {
            Ok(addr) => addr,
            Err(_) => lower.address().clone(),
        };
        Ok(Self {
            address,
            url,
            lower: Some(lower),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            socket_info: StdMutex::new(None),
            state: StateCell::new(TunnelState::NotConnected),
            closed: CancellationToken::new(),
            dial: false,
        })
    }

    fn closed_error(&self) -> TunnelError {
        TunnelError::closed(describe(self))
    }
}

#[async_trait]
impl Tunnel for TcpTunnel {
    fn name(&self) -> &'static str {
        "TcpTunnel"
    }

    fn address(&self) -> &TunnelAddress {
        &self.address
    }

    fn url(&self) -> Option<&TunnelUrl> {
        self.url.as_ref()
    }

    fn state(&self) -> TunnelState {
        self.state.get()
    }

    fn socket_info(&self) -> Result<SocketInfo> {
        if let Some(info) = *self.socket_info.lock().unwrap() {
            return Ok(info);
        }
        if let Some(lower) = &self.lower {
            return lower.socket_info();
        }
        Err(TunnelError::unsupported("socket_info"))
    }

    async fn connect(&self) -> Result<()> {
        if self.state.get() == TunnelState::Closed {
            return Err(self.closed_error());
        }
        if !self.dial {
            // 委托模式视下层为已连接；from_stream 模式本来就已连接
            self.state.set(TunnelState::Connected);
            return Ok(());
        }
        self.state.set(TunnelState::Connecting);
        let stream = TcpStream::connect((self.address.host.as_str(), self.address.port))
            .await
            .map_err(|e| {
                self.state.set(TunnelState::NotConnected);
                TunnelError::connect_failed(self.address.to_string(), e.to_string())
            })?;
        let info = SocketInfo {
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
        };
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        *self.socket_info.lock().unwrap() = Some(info);
        self.state.set(TunnelState::Connected);
        debug!("[{}] Connected to {}", self.name(), self.address);
        Ok(())
    }

    async fn read(&self) -> Result<Bytes> {
        if self.state.get() == TunnelState::Closed {
            return Err(self.closed_error());
        }
        if let Some(lower) = &self.lower {
            return lower.read().await;
        }
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(self.closed_error());
        };
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = tokio::select! {
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            res = reader.read(&mut buf) => match res {
                Ok(0) | Err(_) => return Err(self.closed_error()),
                Ok(n) => n,
            },
        };
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.state.get() == TunnelState::Closed {
            return Err(self.closed_error());
        }
        if let Some(lower) = &self.lower {
            return lower.write(buf).await;
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(self.closed_error());
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(self.closed_error()),
            res = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => res.map_err(|_| self.closed_error()),
        }
    }

    async fn close(&self) {
        if self.state.close() {
            return;
        }
        debug!("[{}] {} closed", self.name(), describe(self));
        self.closed.cancel();
        // 正在阻塞的读写被令牌唤醒后释放锁；两半随后被丢弃
        if let Ok(mut guard) = self.reader.try_lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
        if let Some(lower) = &self.lower {
            lower.close().await;
        }
    }
}
