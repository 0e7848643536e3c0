use log::{LevelFilter, warn};
use std::io::Write;
use std::str::FromStr;

/// 解析 --loglevel；panic/fatal 都按 error 处理
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    let level = level.trim();
    if level.eq_ignore_ascii_case("panic") || level.eq_ignore_ascii_case("fatal") {
        return Some(LevelFilter::Error);
    }
    LevelFilter::from_str(level).ok()
}

/// 初始化日志。RUST_LOG 优先于 --loglevel，无法识别的级别退回 warn
pub fn init(level: &str) {
    let parsed = parse_level(level);
    let filter = parsed.unwrap_or(LevelFilter::Warn);
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(filter.as_str()),
    );

    // 时间 level [线程] module: msg；worker 和分发器各自在独立线程上
    builder.format(|buf, record| {
        let thread = std::thread::current();
        writeln!(
            buf,
            "{} {:<5} [{}] {}: {}",
            buf.timestamp_millis(),
            record.level(),
            thread.name().unwrap_or("-"),
            record.module_path().unwrap_or("?"),
            record.args()
        )
    });

    let _ = builder.try_init();

    if parsed.is_none() {
        warn!("Unknown log level {:?}, falling back to warn", level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("INFO"), Some(LevelFilter::Info));
        assert_eq!(parse_level(" error "), Some(LevelFilter::Error));
        assert_eq!(parse_level("fatal"), Some(LevelFilter::Error));
        assert_eq!(parse_level("panic"), Some(LevelFilter::Error));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn init_twice() {
        init("trace");
        init("warn");
        init("chatty");
    }
}
