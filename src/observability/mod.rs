//! 可观测性：tracing 订阅器初始化
//!
//! 日志写 stderr，stdout 留给交互客户端。`RUST_LOG` 优先，未设置时默认 info，`-v` 提升为 debug。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "rag0=debug,info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // 测试或嵌入场景可能已经装过全局订阅器
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
