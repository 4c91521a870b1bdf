/// 隧道链
///
/// 按配置的上游层级依次建立嵌套隧道，产出一条到目标
/// 地址的尾隧道；任一级失败时关闭已建部分并传播错误
use crate::endpoint::{TunnelAddress, TunnelUrl};
use crate::error::{Result, TunnelError};
use crate::tunnel::{create_tunnel, TcpTunnel, TunnelRef, TunnelScheme};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 访问策略：目标主机的二元放行/拦截判定
///
/// 条目为精确主机名、`*.suffix` 通配或 `*`（全部拦截）
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    blocked_hosts: Vec<String>,
}

impl AccessPolicy {
    pub fn new(blocked_hosts: Vec<String>) -> Self {
        Self { blocked_hosts }
    }

    pub fn allows(&self, address: &TunnelAddress) -> bool {
        !self.blocked_hosts.iter().any(|entry| {
            if entry == "*" {
                return true;
            }
            if let Some(suffix) = entry.strip_prefix("*.") {
                return address.host == suffix
                    || address
                        .host
                        .strip_suffix(suffix)
                        .is_some_and(|rest| rest.ends_with('.'));
            }
            address.host == *entry
        })
    }
}

/// 每条下游会话各建一条链，会话结束时整体拆除
pub struct TunnelChain {
    /// 上游层级 URL，最内层在前
    legs: Vec<TunnelUrl>,
    policy: AccessPolicy,
    /// 每一级 connect 的时限
    connect_timeout: Duration,
    tail: Option<TunnelRef>,
}

impl TunnelChain {
    pub fn new(legs: Vec<TunnelUrl>, policy: AccessPolicy, connect_timeout: Duration) -> Self {
        Self {
            legs,
            policy,
            connect_timeout,
            tail: None,
        }
    }

    /// 已建成链路的最外层隧道
    pub fn tail(&self) -> Option<&TunnelRef> {
        self.tail.as_ref()
    }

    /// 建立到目标地址的嵌套隧道
    ///
    /// 叶子层 TCP 连接第一跳（无上游时直连目标），其后每一级
    /// 以前一级为下层隧道，目标为下一跳地址或最终目标
    pub async fn create_tunnel(&mut self, address: TunnelAddress) -> Result<TunnelRef> {
        if !self.policy.allows(&address) {
            // 策略拦截是预期结果，不作为异常记录
            return Err(TunnelError::blocked(address.to_string()));
        }

        let first_hop = self
            .legs
            .first()
            .map(|leg| leg.address().clone())
            .unwrap_or_else(|| address.clone());
        let leaf: TunnelRef = Arc::new(TcpTunnel::dial(
            self.legs.first().cloned(),
            Some(first_hop),
        )?);
        if let Err(e) = self.connect_bounded(&leaf).await {
            leaf.close().await;
            return Err(self.report(e, &address));
        }

        let mut current = leaf;
        for (index, leg) in self.legs.iter().enumerate() {
            let target = self
                .legs
                .get(index + 1)
                .map(|next| next.address().clone())
                .unwrap_or_else(|| address.clone());
            let scheme: TunnelScheme = match leg.scheme().parse() {
                Ok(scheme) => scheme,
                Err(e) => {
                    current.close().await;
                    return Err(self.report(e, &address));
                }
            };
            let layer = match create_tunnel(scheme, current.clone(), Some(leg.clone()), target) {
                Ok(layer) => layer,
                Err(e) => {
                    current.close().await;
                    return Err(self.report(e, &address));
                }
            };
            if let Err(e) = self.connect_bounded(&layer).await {
                // 关闭最外层即级联拆掉已建的所有层
                layer.close().await;
                return Err(self.report(e, &address));
            }
            current = layer;
        }

        debug!(
            "[TunnelChain] Tunnel to {} established ({} layers)",
            address,
            self.legs.len().max(1)
        );
        self.tail = Some(current.clone());
        Ok(current)
    }

    /// 拆除整条链路，从最外层起级联关闭
    pub async fn close(&mut self) {
        if let Some(tail) = self.tail.take() {
            tail.close().await;
        }
    }

    /// 带时限的 connect，超时折算为 Timeout 错误
    async fn connect_bounded(&self, tunnel: &TunnelRef) -> Result<()> {
        match tokio::time::timeout(self.connect_timeout, tunnel.connect()).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::timeout(self.connect_timeout)),
        }
    }

    fn report(&self, e: TunnelError, address: &TunnelAddress) -> TunnelError {
        if !e.is_blocked() {
            warn!("[TunnelChain] Create tunnel to {} failed: {}", address, e);
        }
        e
    }
}
