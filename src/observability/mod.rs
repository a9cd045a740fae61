//! 可观测性：tracing 订阅器
//!
//! 日志写到 stderr，stdout 留给 JSON-lines 传输。`RUST_LOG` 可覆盖默认的 info 级别。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
