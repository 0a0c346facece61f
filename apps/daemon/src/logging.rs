//! 日志初始化
//!
//! 级别优先级：`RUST_LOG` > `LOG_LEVEL`（error / warning / info / debug）> info。
//! stderr 接入 systemd journal 时关闭时间戳和颜色（journal 自带时间戳）。

use tracing_subscriber::EnvFilter;

/// 把 `LOG_LEVEL` 的取值映射为 EnvFilter 指令
pub fn legacy_level(value: &str) -> Option<&'static str> {
    match value {
        "error" => Some("error"),
        "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        _ => None,
    }
}

/// 解析 `JOURNAL_STREAM`（`device:inode`）
pub fn parse_journal_stream(value: &str) -> Option<(u64, u64)> {
    let (dev, ino) = value.split_once(':')?;
    Some((dev.parse().ok()?, ino.parse().ok()?))
}

/// stderr 是否连接到 systemd journal
fn stderr_is_journal() -> bool {
    let Some((dev, ino)) = std::env::var("JOURNAL_STREAM")
        .ok()
        .as_deref()
        .and_then(parse_journal_stream)
    else {
        return false;
    };
    match nix::sys::stat::fstat(std::io::stderr()) {
        Ok(stat) => stat.st_dev as u64 == dev && stat.st_ino as u64 == ino,
        Err(_) => false,
    }
}

fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .as_deref()
        .and_then(legacy_level)
        .unwrap_or("info");
    EnvFilter::new(level)
}

/// 安装全局 tracing subscriber
pub fn init() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(false);

    if stderr_is_journal() {
        builder.without_time().with_ansi(false).init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_level() {
        assert_eq!(legacy_level("warning"), Some("warn"));
        assert_eq!(legacy_level("debug"), Some("debug"));
        assert_eq!(legacy_level("trace"), None);
    }

    #[test]
    fn test_parse_journal_stream() {
        assert_eq!(parse_journal_stream("8:12345"), Some((8, 12345)));
        assert_eq!(parse_journal_stream("8"), None);
        assert_eq!(parse_journal_stream("a:b"), None);
    }
}
