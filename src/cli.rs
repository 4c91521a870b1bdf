use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chain-tunnel")]
#[command(author, version, about = "Composable CONNECT tunneling proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行隧道服务器
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}
