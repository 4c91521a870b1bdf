/// HTTPS (CONNECT) 隧道
///
/// 在下层隧道上完成 CONNECT 握手，此后对上层表现为
/// 到目标地址的透明管道
use super::{describe, SocketInfo, StateCell, Tunnel, TunnelRef, TunnelState};
use crate::endpoint::{resolve_address, TunnelAddress, TunnelUrl};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// CONNECT 响应头的大小上限，超出视为协议错误
const MAX_RESPONSE_SIZE: usize = 8 * 1024;

#[derive(Debug)]
pub struct HttpsTunnel {
    lower: TunnelRef,
    address: TunnelAddress,
    url: Option<TunnelUrl>,
    state: StateCell,
}

impl HttpsTunnel {
    pub fn new(
        lower: TunnelRef,
        url: Option<TunnelUrl>,
        address: Option<TunnelAddress>,
    ) -> Result<Self> {
        let address = resolve_address(address, url.as_ref())?;
        Ok(Self {
            lower,
            address,
            url,
            state: StateCell::new(TunnelState::NotConnected),
        })
    }
}

/// 解析 CONNECT 响应的状态行，返回 (状态码, 原因短语)
///
/// 首行按空白切分，第二个字段是数字状态码，其余是原因短语；
/// 格式非法一律报协议错误，绝不静默当作成功
fn parse_connect_response(buffer: &[u8]) -> Result<(u16, String)> {
    let line_end = buffer
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(buffer.len());
    let line = std::str::from_utf8(&buffer[..line_end])
        .map_err(|_| TunnelError::protocol("CONNECT response is not valid UTF-8"))?;
    let mut parts = line.split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| TunnelError::protocol("Empty CONNECT response status line"))?;
    let code: u16 = parts
        .next()
        .ok_or_else(|| TunnelError::protocol(format!("No status code in '{}'", line)))?
        .parse()
        .map_err(|_| TunnelError::protocol(format!("Invalid status code in '{}'", line)))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    Ok((code, reason))
}

#[async_trait]
impl Tunnel for HttpsTunnel {
    fn name(&self) -> &'static str {
        "HttpsTunnel"
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
        self.lower.socket_info()
    }

    async fn connect(&self) -> Result<()> {
        if self.state.get() == TunnelState::Closed {
            return Err(TunnelError::closed(describe(self)));
        }
        self.state.set(TunnelState::Connecting);
        let request = format!(
            "CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n",
            addr = self.address
        );
        self.lower.write(request.as_bytes()).await?;

        // CONNECT 响应在隧道建立前不携带正文，读到空行即完整
        let mut buffer = BytesMut::new();
        loop {
            let chunk = self.lower.read().await?;
            buffer.extend_from_slice(&chunk);
            if buffer.ends_with(b"\r\n\r\n") {
                break;
            }
            if buffer.len() > MAX_RESPONSE_SIZE {
                return Err(TunnelError::protocol("CONNECT response too large"));
            }
        }

        let (code, reason) = parse_connect_response(&buffer)?;
        if code == 200 {
            self.state.set(TunnelState::Connected);
            debug!("[{}] Tunnel to {} established", self.name(), self.address);
            return Ok(());
        }
        // 200 以外的任何状态码都视为失败，包括其他 2xx
        let url = self
            .url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "-".to_string());
        warn!(
            "[{}] Connect {} over {} failed: [{}] {}",
            self.name(),
            self.address,
            url,
            code,
            reason
        );
        self.state.set(TunnelState::NotConnected);
        Err(TunnelError::connect_failed(
            self.address.to_string(),
            format!("[{}] {}", code, reason),
        ))
    }

    async fn read(&self) -> Result<Bytes> {
        if self.state.get() == TunnelState::Closed {
            return Err(TunnelError::closed(describe(self)));
        }
        self.lower.read().await
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.state.get() == TunnelState::Closed {
            return Err(TunnelError::closed(describe(self)));
        }
        self.lower.write(buf).await
    }

    async fn close(&self) {
        if self.state.close() {
            return;
        }
        debug!("[{}] {} closed", self.name(), describe(self));
        self.lower.close().await;
    }
}
