/// 隧道服务器（CONNECT 前端）
///
/// 监听下游连接，解析 CONNECT 请求，驱动隧道链建立，
/// 然后在下游与链尾之间双向转发直到任一方向结束
use crate::chain::{AccessPolicy, TunnelChain};
use crate::config::ServerConfig;
use crate::endpoint::{TunnelAddress, TunnelUrl};
use crate::error::{Result, TunnelError};
use crate::tunnel::{TcpTunnel, TunnelRef, TunnelScheme};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// 请求头大小上限，超出按非法请求处理
const MAX_HEADER_SIZE: usize = 8 * 1024;

const RESP_ESTABLISHED: &[u8] = b"HTTP/1.1 200 HTTPSTunnel Established\r\n\r\n";
const RESP_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
const RESP_GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";
const RESP_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESP_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";

/// 会话记账记录：只记录下游对端与目标地址，不持有 I/O 资源
pub struct TunnelConnection {
    peer: SocketAddr,
    target: TunnelAddress,
}

impl TunnelConnection {
    pub fn new(peer: SocketAddr, target: TunnelAddress) -> Self {
        info!("[TunnelConnection] {} => {} opened", peer, target);
        Self { peer, target }
    }

    /// 下游在会话建立前就断开时的回调
    pub fn on_downstream_closed(&self) {
        debug!(
            "[TunnelConnection] Downstream {} closed before {} established",
            self.peer, self.target
        );
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        info!("[TunnelConnection] {} => {} closed", self.peer, self.target);
    }
}

/// 服务器共享参数，每条连接各自引用
struct ServerContext {
    legs: Vec<TunnelUrl>,
    policy: AccessPolicy,
    connect_timeout: Duration,
}

impl ServerContext {
    fn chain(&self) -> TunnelChain {
        TunnelChain::new(self.legs.clone(), self.policy.clone(), self.connect_timeout)
    }
}

/// 运行 CONNECT 隧道服务器直到出错
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let listen = TunnelUrl::parse(&config.listen)?;
    // 服务器实现按监听 scheme 查找；目前只有 CONNECT 前端
    let scheme: TunnelScheme = listen.scheme().parse()?;
    if !matches!(scheme, TunnelScheme::Http | TunnelScheme::Https) {
        return Err(TunnelError::config(format!(
            "No server implementation for scheme '{}'",
            scheme
        )));
    }

    let mut legs = Vec::new();
    for leg in &config.chain {
        legs.push(TunnelUrl::parse(leg)?);
    }
    let context = Arc::new(ServerContext {
        legs,
        policy: AccessPolicy::new(config.blocked_hosts.clone()),
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
    });

    let listener = TcpListener::bind((listen.host(), listen.port())).await?;
    info!(
        "[TunnelServer] HTTP server is listening on {}:{}",
        listen.host(),
        listen.port()
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, context).await {
                        if !e.is_closed() {
                            warn!("[TunnelServer] Connection from {} failed: {}", peer, e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("[TunnelServer] Accept error: {}", e);
            }
        }
    }
}

/// 处理一条下游连接的完整生命周期
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ServerContext>,
) -> Result<()> {
    let downstream: TunnelRef = Arc::new(TcpTunnel::from_stream(stream, None, None, true)?);

    let (head, early_data) = match read_request_head(&downstream).await {
        Ok(parts) => parts,
        Err(e) => {
            if e.is_closed() {
                return Err(e);
            }
            debug!("[TunnelServer] Rejecting request from {}: {}", peer, e);
            let _ = downstream.write(RESP_BAD_REQUEST).await;
            downstream.close().await;
            return Ok(());
        }
    };

    let address = match parse_connect_request(&head) {
        Ok(address) => address,
        Err(e) => {
            // CONNECT 之外的方法交给默认处理：固定 405 响应
            let resp = if matches!(e, TunnelError::Unsupported { .. }) {
                RESP_METHOD_NOT_ALLOWED
            } else {
                RESP_BAD_REQUEST
            };
            debug!("[TunnelServer] Rejecting request from {}: {}", peer, e);
            let _ = downstream.write(resp).await;
            downstream.close().await;
            return Ok(());
        }
    };

    let tun_conn = TunnelConnection::new(peer, address.clone());
    let mut chain = context.chain();
    let tail = match chain.create_tunnel(address.clone()).await {
        Ok(tail) => tail,
        Err(e) => {
            let resp = if e.is_blocked() {
                RESP_FORBIDDEN
            } else {
                warn!(
                    "[TunnelServer] Connect {} failed: {}",
                    address, e
                );
                RESP_GATEWAY_TIMEOUT
            };
            if downstream.write(resp).await.is_err() {
                tun_conn.on_downstream_closed();
            }
            downstream.close().await;
            return Ok(());
        }
    };

    if downstream.write(RESP_ESTABLISHED).await.is_err() {
        tun_conn.on_downstream_closed();
        downstream.close().await;
        chain.close().await;
        return Ok(());
    }
    // 请求头之后提前到达的字节属于隧道载荷，先行送入链尾
    if !early_data.is_empty() {
        if let Err(e) = tail.write(&early_data).await {
            downstream.close().await;
            chain.close().await;
            return Err(e);
        }
    }

    // 双向转发，任一方向结束即整个会话结束
    tokio::select! {
        _ = relay(&downstream, &tail, "downstream => upstream") => {}
        _ = relay(&tail, &downstream, "upstream => downstream") => {}
    }

    downstream.close().await;
    chain.close().await;
    Ok(())
}

/// 单方向转发：读一块写一块，关闭或出错即结束
async fn relay(src: &TunnelRef, dst: &TunnelRef, direction: &str) {
    loop {
        let chunk = match src.read().await {
            Ok(chunk) => chunk,
            Err(_) => break,
        };
        debug!("[TunnelServer] Relay {} bytes {}", chunk.len(), direction);
        if dst.write(&chunk).await.is_err() {
            break;
        }
    }
}

/// 读取请求头直到空行，返回头部和已到达的多余载荷
async fn read_request_head(downstream: &TunnelRef) -> Result<(BytesMut, Bytes)> {
    let mut buffer = BytesMut::new();
    loop {
        let chunk = downstream.read().await?;
        buffer.extend_from_slice(&chunk);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buffer.split_to(pos + 4);
            return Ok((head, buffer.freeze()));
        }
        if buffer.len() > MAX_HEADER_SIZE {
            return Err(TunnelError::protocol("Request header too large"));
        }
    }
}

/// 解析 CONNECT 请求行，返回目标地址
///
/// 非 CONNECT 方法报 Unsupported，由调用方映射到 405
fn parse_connect_request(head: &[u8]) -> Result<TunnelAddress> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| TunnelError::protocol("Request line is not valid UTF-8"))?;
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| TunnelError::protocol("Empty request line"))?;
    if method != "CONNECT" {
        return Err(TunnelError::unsupported("non-CONNECT method"));
    }
    let path = parts
        .next()
        .ok_or_else(|| TunnelError::protocol("CONNECT request has no target"))?;
    TunnelAddress::parse(path)
}
