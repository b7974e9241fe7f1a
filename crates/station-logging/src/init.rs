use station_config::LoggingConfig;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter {0:?}: {1}")]
    InvalidFilter(String, String),

    #[error("Failed to create log directory: {0}")]
    Directory(#[from] std::io::Error),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// 日志守卫
///
/// 持有文件写入线程，丢弃前会刷新缓冲
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 初始化全局日志
///
/// `RUST_LOG` 优先于配置中的级别
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LoggingError::InvalidFilter(config.level.clone(), e.to_string()))?,
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();

    let console = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };
    layers.push(console);

    let mut file_guard = None;
    if let Some(dir) = &config.directory {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, "stationd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file = if config.json {
            fmt::layer().json().with_writer(writer).with_ansi(false).boxed()
        } else {
            fmt::layer().with_writer(writer).with_ansi(false).boxed()
        };
        layers.push(file);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "station=loud".to_string(),
            json: false,
            directory: None,
        };
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::InvalidFilter(..))
        ));
    }

    #[test]
    fn test_file_logging_creates_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("logs");
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: true,
            directory: Some(dir.clone()),
        };

        // 同一进程中其它测试可能已安装订阅者
        let _ = init_logging(&config);
        assert!(dir.exists());
    }
}
