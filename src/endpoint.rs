/// 地址与 URL 类型
///
/// 隧道目标统一用 (host, port) 表示；监听端点和上游各级
/// 代理用 URL 表示（scheme 决定隧道实现）
use crate::error::{Result, TunnelError};
use std::fmt;
use url::Url;

/// 隧道目标地址 (host, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddress {
    pub host: String,
    pub port: u16,
}

impl TunnelAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 从 `host:port` 形式解析（CONNECT 请求路径）
    ///
    /// IPv6 字面量需要用方括号包裹，如 `[::1]:8080`
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::protocol(format!("Invalid address '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::protocol(format!("Invalid port in address '{}'", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || port == 0 {
            return Err(TunnelError::protocol(format!("Invalid address '{}'", s)));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 隧道端点 URL
///
/// 包装 url::Url，保证 host 存在并按 scheme 补全默认端口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelUrl {
    inner: Url,
    address: TunnelAddress,
}

impl TunnelUrl {
    /// 解析 URL 字符串
    pub fn parse(s: &str) -> Result<Self> {
        let inner: Url =
            s.parse().map_err(|e| TunnelError::config(format!("Invalid url '{}': {}", s, e)))?;
        let host = inner
            .host_str()
            .ok_or_else(|| TunnelError::config(format!("Url '{}' has no host", s)))?
            .to_string();
        let port = inner
            .port()
            .or_else(|| default_port(inner.scheme()))
            .ok_or_else(|| TunnelError::config(format!("Url '{}' has no port", s)))?;
        Ok(Self {
            inner,
            address: TunnelAddress::new(host, port),
        })
    }

    pub fn scheme(&self) -> &str {
        self.inner.scheme()
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }

    /// URL 自身指向的地址（host + port）
    pub fn address(&self) -> &TunnelAddress {
        &self.address
    }
}

impl fmt::Display for TunnelUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::str::FromStr for TunnelUrl {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// 解析隧道的目标地址：显式地址优先，否则取 URL 的 host+port
///
/// 隧道构造后地址必须始终存在，两者皆缺省时报配置错误
pub fn resolve_address(
    address: Option<TunnelAddress>,
    url: Option<&TunnelUrl>,
) -> Result<TunnelAddress> {
    if let Some(addr) = address {
        return Ok(addr);
    }
    if let Some(url) = url {
        return Ok(url.address().clone());
    }
    Err(TunnelError::config("Tunnel requires an address or a url"))
}
