/// 服务器配置
use crate::endpoint::TunnelUrl;
use crate::tunnel::TunnelScheme;
use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_connect_timeout() -> u64 {
    15
}

/// CONNECT 隧道服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听端点，如 "http://0.0.0.0:8080"
    pub listen: String,
    /// 上游层级 URL，最内层在前；为空时直连目标
    #[serde(default)]
    pub chain: Vec<String>,
    /// 拦截的目标主机（精确名、*.suffix 或 *）
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        let listen =
            TunnelUrl::parse(&self.listen).context("Invalid listen url")?;
        listen
            .scheme()
            .parse::<TunnelScheme>()
            .context("Unknown listen scheme")?;

        for leg in &self.chain {
            let url = TunnelUrl::parse(leg)
                .with_context(|| format!("Invalid chain url '{}'", leg))?;
            url.scheme()
                .parse::<TunnelScheme>()
                .with_context(|| format!("Unknown scheme in chain url '{}'", leg))?;
        }

        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs cannot be 0");
        }
        Ok(())
    }

    /// 从 TOML 文件加载并验证
    pub fn load(path: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct ConfigWrapper {
            server: ServerConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file '{}'", path))?;
        let wrapper: ConfigWrapper =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            listen: "http://127.0.0.1:8080".to_string(),
            chain: vec![],
            blocked_hosts: vec![],
            connect_timeout_secs: 15,
        }
    }

    #[test]
    fn test_validate_ok() {
        let mut config = base_config();
        config.chain = vec!["http://gw.example.com:3128".to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_listen() {
        let mut config = base_config();
        config.listen = "not a url".to_string();
        assert!(config.validate().is_err());

        config.listen = "socks5://127.0.0.1:1080".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_chain_leg() {
        let mut config = base_config();
        config.chain = vec!["ftp://example.com:21".to_string()];
        assert!(config.validate().is_err());

        config.chain = vec!["http://".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = base_config();
        config.connect_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [server]
            listen = "http://0.0.0.0:8080"
            chain = ["http://gw.example.com:3128"]
            blocked_hosts = ["*.internal"]
        "#;
        #[derive(Deserialize)]
        struct Wrapper {
            server: ServerConfig,
        }
        let wrapper: Wrapper = toml::from_str(toml_str).unwrap();
        assert_eq!(wrapper.server.listen, "http://0.0.0.0:8080");
        assert_eq!(wrapper.server.chain.len(), 1);
        assert_eq!(wrapper.server.blocked_hosts, vec!["*.internal"]);
        assert_eq!(wrapper.server.connect_timeout_secs, 15);
        wrapper.server.validate().unwrap();
    }
}
