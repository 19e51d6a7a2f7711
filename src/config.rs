//! 定义了定时器队列的可配置参数。
//! Defines configurable parameters for the timer queue.

use std::time::Duration;

/// Which scheduling facility a queue delegates to.
///
/// 队列委托的调度设施。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Pick the self-hosted scheduler where it exists (Linux), the executor elsewhere.
    /// 在可用的平台（Linux）上选择自托管调度器，其他平台选择执行器。
    #[default]
    Auto,
    /// timerfd + epoll + worker pool. Linux only.
    /// timerfd + epoll + 工作线程池。仅限 Linux。
    SelfHosted,
    /// A dedicated scheduled thread-pool executor (a tokio runtime).
    /// 专用的定时线程池执行器（tokio 运行时）。
    Executor,
}

/// A structure containing all configurable parameters for a queue.
///
/// 包含所有队列可配置参数的结构体。
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Backend selection, resolved once at construction.
    /// 后端选择，在构造时解析一次。
    pub backend: BackendKind,

    /// Parameters of the self-hosted scheduler.
    /// 自托管调度器的参数。
    pub scheduler: SchedulerConfig,

    /// Parameters of the executor backend.
    /// 执行器后端的参数。
    pub executor: ExecutorConfig,
}

/// Self-hosted scheduler parameters.
///
/// 自托管调度器参数。
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads blocking on the multiplexer.
    /// 阻塞在多路复用器上的工作线程数量。
    pub worker_threads: usize,
    /// Maximum number of ready events a single wait call returns. A worker
    /// runs the callbacks of one batch in turn, so values above 1 let a slow
    /// callback delay the other timers of its batch.
    ///
    /// 单次等待调用返回的最大就绪事件数。工作线程依次执行同一批次的回调，
    /// 因此大于 1 的值会让慢回调拖延同批次的其他定时器。
    pub max_events_per_wait: usize,
    /// Consecutive non-interrupt wait failures tolerated before the scheduler
    /// is declared dead.
    ///
    /// 在调度器被判定失效之前，可容忍的连续非中断等待失败次数。
    pub max_consecutive_wait_failures: u32,
    /// Pause between retries of a failed wait.
    /// 等待失败后重试之间的暂停时间。
    pub wait_retry_backoff: Duration,
}

/// Executor backend parameters.
///
/// 执行器后端参数。
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker threads of the dedicated runtime.
    /// 专用运行时的工作线程数。
    pub worker_threads: usize,
    /// Upper bound on threads running callbacks at once. Ticks beyond it
    /// queue until a callback thread is free.
    ///
    /// 同时执行回调的线程数上限。超出的滴答排队等待空闲的回调线程。
    pub callback_threads: usize,
    /// How long teardown waits for the runtime to stop.
    /// 关闭时等待运行时停止的最长时间。
    pub shutdown_timeout: Duration,
}

/// Default worker count: one per core, capped at four.
fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 4)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_events_per_wait: 1,
            max_consecutive_wait_failures: 8,
            wait_retry_backoff: Duration::from_millis(10),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            callback_threads: default_worker_threads(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_count_is_bounded() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Auto);
        assert!((1..=4).contains(&config.scheduler.worker_threads));
        assert!((1..=4).contains(&config.executor.worker_threads));
        assert_eq!(config.scheduler.max_events_per_wait, 1);
        assert!((1..=4).contains(&config.executor.callback_threads));
    }
}
