//! 日志桥接
//!
//! 进程内安装一个 `log::Log` 实现：
//! - 默认交给 env_logger（stderr，`RUST_LOG` 控制过滤）
//! - 宿主注册回调后，格式化为单行字符串交给宿主，按宿主级别过滤

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Once, OnceLock, RwLock};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// 宿主日志回调
pub type LogCallback = fn(&str);

/// 日志前缀
pub const LOG_PREFIX: &str = "[pcm-bridge]";

/// 宿主回调的默认级别
pub const DEFAULT_HOST_LEVEL: LevelFilter = LevelFilter::Info;

static HOST_SINK: RwLock<Option<LogCallback>> = RwLock::new(None);
static HOST_LEVEL: AtomicUsize = AtomicUsize::new(DEFAULT_HOST_LEVEL as usize);
/// 桥接安装成功后记录 env_logger 的过滤级别
static FALLBACK_FILTER: OnceLock<LevelFilter> = OnceLock::new();
static INSTALL: Once = Once::new();

struct BridgeLogger {
    fallback: env_logger::Logger,
}

impl Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match host_callback() {
            Some(_) => host_accepts(metadata.level()),
            None => self.fallback.enabled(metadata),
        }
    }

    fn log(&self, record: &Record) {
        match host_callback() {
            Some(callback) => {
                if host_accepts(record.level()) {
                    callback(&format_record(record));
                }
            }
            None => {
                if self.fallback.matches(record) {
                    self.fallback.log(record);
                }
            }
        }
    }

    fn flush(&self) {
        self.fallback.flush();
    }
}

/// 安装日志桥接，只尝试一次
///
/// `verbose` 时默认级别为 info，否则为 warn；`RUST_LOG` 优先。
/// 返回桥接是否生效；已有其他 logger 时为 false，并通过该 logger 警告一次。
pub fn init(verbose: bool) -> bool {
    INSTALL.call_once(|| {
        let default_filter = if verbose { "info" } else { "warn" };
        let fallback =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
                .build();
        let filter = fallback.filter();

        if log::set_boxed_logger(Box::new(BridgeLogger { fallback })).is_ok() {
            let _ = FALLBACK_FILTER.set(filter);
            refresh_max_level();
        } else {
            log::warn!(
                "{} another logger is installed; host log callback will not receive records",
                LOG_PREFIX
            );
        }
    });
    is_installed()
}

/// 桥接是否为当前进程的 logger
pub fn is_installed() -> bool {
    FALLBACK_FILTER.get().is_some()
}

/// 设置或清除宿主回调
///
/// 回调在调用日志宏的线程上同步执行
pub fn set_host_callback(callback: Option<LogCallback>) {
    match HOST_SINK.write() {
        Ok(mut sink) => *sink = callback,
        Err(poisoned) => *poisoned.into_inner() = callback,
    }
    refresh_max_level();
}

/// 当前宿主回调
pub fn host_callback() -> Option<LogCallback> {
    match HOST_SINK.read() {
        Ok(sink) => *sink,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// 设置宿主回调接收的最低级别，与 `RUST_LOG` 无关
pub fn set_host_level(level: LevelFilter) {
    HOST_LEVEL.store(level as usize, Ordering::Relaxed);
    refresh_max_level();
}

pub fn host_level() -> LevelFilter {
    match HOST_LEVEL.load(Ordering::Relaxed) {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[inline]
fn host_accepts(level: Level) -> bool {
    level <= host_level()
}

/// 全局级别取 env_logger 与宿主级别中较宽的一个，否则宿主收不到 info
fn refresh_max_level() {
    let Some(&fallback) = FALLBACK_FILTER.get() else {
        return;
    };
    let level = if host_callback().is_some() {
        fallback.max(host_level())
    } else {
        fallback
    };
    log::set_max_level(level);
}

/// 格式化为 "[pcm-bridge] LEVEL target: message"
pub fn format_record(record: &Record) -> String {
    format!(
        "{} {} {}: {}",
        LOG_PREFIX,
        record.level(),
        record.target(),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn capture(line: &str) {
        if line.contains("pcm_bridge::logging::host") {
            CAPTURED.lock().unwrap().push(line.to_string());
        }
    }

    fn captured() -> Vec<String> {
        std::mem::take(&mut *CAPTURED.lock().unwrap())
    }

    #[test]
    fn test_format_record() {
        assert_eq!(
            format_record(
                &Record::builder()
                    .level(Level::Warn)
                    .target("pcm_bridge::engine")
                    .args(format_args!("queue full ({} buffers)", 3))
                    .build()
            ),
            "[pcm-bridge] WARN pcm_bridge::engine: queue full (3 buffers)"
        );
    }

    // 全局 logger 状态只在这一个测试里修改
    #[test]
    fn test_host_callback_receives_info_and_clears() {
        assert!(init(false));
        let fallback = *FALLBACK_FILTER.get().unwrap();

        set_host_level(LevelFilter::Info);
        set_host_callback(Some(capture));
        assert!(host_callback().is_some());
        assert!(log::max_level() >= LevelFilter::Info);

        log::info!(target: "pcm_bridge::logging::host", "queue resized to {}", 6);
        log::debug!(target: "pcm_bridge::logging::host", "below host level");
        assert_eq!(
            captured(),
            vec!["[pcm-bridge] INFO pcm_bridge::logging::host: queue resized to 6".to_string()]
        );

        set_host_level(LevelFilter::Error);
        log::warn!(target: "pcm_bridge::logging::host", "filtered by host level");
        assert!(captured().is_empty());
        set_host_level(DEFAULT_HOST_LEVEL);

        set_host_callback(None);
        assert!(host_callback().is_none());
        assert_eq!(log::max_level(), fallback);
        log::error!(target: "pcm_bridge::logging::host", "goes to stderr");
        assert!(captured().is_empty());
    }
}
