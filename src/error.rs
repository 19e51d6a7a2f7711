//! 定义了定时器队列中所有可能的错误类型。
//! Defines all possible error types of the timer queue.

use thiserror::Error;

/// The primary error type for the timer queue.
/// 定时器队列的主要错误类型。
#[derive(Debug, Error)]
pub enum TimerError {
    /// An argument was rejected, e.g. a zero or sub-millisecond interval.
    /// 参数被拒绝，例如间隔为零或不足一毫秒。
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The handle is unknown, stale, or already released.
    /// 句柄未知、已过期或已被释放。
    #[error("Timer not found")]
    NotFound,

    /// A descriptor, thread, runtime or native registration could not be created.
    /// 无法创建描述符、线程、运行时或原生注册。
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[source] std::io::Error),

    /// The scheduler's readiness wait failed persistently. This error is sticky:
    /// once detected it is reported by every subsequent call.
    ///
    /// 调度器的就绪等待持续失败。该错误是粘滞的：一旦检测到，后续每次调用都会报告。
    #[error("Scheduler failed: {0}")]
    SchedulerFatal(String),

    /// The queue has been torn down by `release_all`.
    /// 队列已被 `release_all` 关闭。
    #[error("Timer queue has been shut down")]
    QueueShutdown,

    /// The requested backend does not exist on this target.
    /// 请求的后端在当前目标平台上不存在。
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, TimerError>;

impl From<TimerError> for std::io::Error {
    fn from(err: TimerError) -> Self {
        use std::io::ErrorKind;
        match err {
            TimerError::ResourceExhausted(e) => e,
            TimerError::InvalidArgument(msg) => std::io::Error::new(ErrorKind::InvalidInput, msg),
            TimerError::NotFound => ErrorKind::NotFound.into(),
            TimerError::SchedulerFatal(msg) => std::io::Error::other(msg),
            TimerError::QueueShutdown => ErrorKind::BrokenPipe.into(),
            TimerError::Unsupported(msg) => std::io::Error::new(ErrorKind::Unsupported, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_io_error_conversion_keeps_kind() {
        let io: std::io::Error = TimerError::NotFound.into();
        assert_eq!(io.kind(), ErrorKind::NotFound);

        let io: std::io::Error = TimerError::InvalidArgument("interval must be positive").into();
        assert_eq!(io.kind(), ErrorKind::InvalidInput);

        let source = std::io::Error::from_raw_os_error(24);
        let raw = source.raw_os_error();
        let io: std::io::Error = TimerError::ResourceExhausted(source).into();
        assert_eq!(io.raw_os_error(), raw);
    }
}
