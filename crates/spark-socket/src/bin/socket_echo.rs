//! 回显服务：从 TOML 读取 `ServerConfig`，按描述符启动服务端，把每条连接收到的字节原样写回。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark_socket=debug cargo run --bin socket_echo -- echo.toml
//! ```
//! `echo.toml` 示例：
//! ```toml
//! network = "unix"
//! address = "/tmp/spark-echo.sock"
//! permFile = "0600"
//! idleTimeout = 30000
//! ```
//! - 收到 Ctrl-C 后进入优雅停机，最多等待 5 秒排空连接；
//! - TLS 上下文属于代码而非数据，此工具不支持开启 TLS。

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use spark_socket::{CallContext, ServerConfig, Session, new_server};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const CHUNK: usize = 16 * 1024;

fn main() {
    if let Err(error) = run() {
        eprintln!("回显服务失败: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = env::args()
        .skip(1)
        .find(|arg| arg.trim_start_matches('-') != "quick")
        .map(PathBuf::from)
        .context("用法: socket_echo <config.toml>")?;
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("读取配置失败: {}", path.display()))?;
    let config: ServerConfig = toml::from_str(&raw).context("解析配置失败")?;
    if config.tls.enabled {
        bail!("socket_echo 不支持 TLS 配置");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("创建运行时失败")?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let network = config.network;
    let Some(server) = new_server(config, echo)? else {
        bail!("当前平台不支持 {network} 协议");
    };
    server.register_func_error(|errors| {
        for error in errors {
            tracing::warn!(target: "spark_socket::echo", code = error.code(), %error, "connection error");
        }
    });
    server.register_func_info_server(|message| {
        tracing::info!(target: "spark_socket::echo", "{message}");
    });

    let listener = server.clone();
    let listening =
        tokio::spawn(async move { listener.listen(&CallContext::background()).await });
    let addr = server.wait_listening().await?;
    tracing::info!(target: "spark_socket::echo", %addr, "echo server ready");

    tokio::signal::ctrl_c().await.context("等待 Ctrl-C 失败")?;
    server
        .shutdown(&CallContext::with_timeout(SHUTDOWN_GRACE))
        .await?;
    listening.await.context("监听任务异常退出")??;
    Ok(())
}

async fn echo(session: Session) {
    let mut buf = vec![0u8; CHUNK];
    loop {
        match session.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                if session.write(&buf[..read]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    // 数据报会话在首个报文之后读到 0，对字节流而言等价于对端半关闭。
    let _ = session.close().await;
}
