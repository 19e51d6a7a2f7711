//! 调度后端
//! Scheduling backends
//!
//! 队列外观只依赖 [`Backend`] 这一能力接口（`schedule`、`reschedule`、`cancel`），
//! 具体实现只在构造时根据平台能力选择一次：
//!
//! - `self_hosted`（Linux）：每个定时器一个 timerfd，一个共享 epoll，外加工作线程池；
//! - `executor`：专用的 tokio 多线程运行时，作为定时线程池执行器。
//!
//! The queue facade depends only on the [`Backend`] capability (`schedule`,
//! `reschedule`, `cancel`); the concrete variant is chosen once at construction
//! from platform capability:
//!
//! - `self_hosted` (Linux): one timerfd per timer, one shared epoll, a worker pool;
//! - `executor`: a dedicated multi-threaded tokio runtime acting as a scheduled
//!   thread-pool executor.
//!
//! 任何后端都必须通过 [`Dispatcher::dispatch`] 投递滴答，并且首次触发在一个完整
//! 间隔之后，而不是立即触发。
//!
//! Any backend must deliver ticks through [`Dispatcher::dispatch`], and the
//! first fire happens one full period after scheduling, never immediately.

pub mod executor;
#[cfg(target_os = "linux")]
pub mod self_hosted;

use crate::config::{BackendKind, Config};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::handle::TimerHandle;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// 后端注册的不透明令牌
/// Opaque token for one backend registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendToken(u64);

impl BackendToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// 单调递增的令牌来源，从 1 开始（0 保留给控制通道）
/// Monotonic token source starting at 1 (0 is reserved for control channels)
#[derive(Debug)]
pub struct TokenSource {
    next: AtomicU64,
}

impl Default for TokenSource {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl TokenSource {
    pub fn next(&self) -> BackendToken {
        BackendToken(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// 原生或自托管调度设施需要满足的契约
/// Contract a native or self-hosted scheduling facility must satisfy
pub trait Backend: Send + Sync + 'static {
    /// 后端名称，用于日志和统计
    /// Backend name, for logs and statistics
    fn name(&self) -> &'static str;

    /// 为 `handle` 装配一个周期定时器，首次触发在一个完整 `period` 之后
    /// Arm a periodic timer for `handle`; the first fire is one full `period` away
    fn schedule(&self, handle: TimerHandle, period: Duration) -> Result<BackendToken>;

    /// 以新周期重新装配。对调用方而言是原子的：不存在新旧周期同时生效的窗口。
    /// Re-arm with a new period. Atomic from the caller's view: there is no window
    /// with both periods armed.
    fn reschedule(&self, token: BackendToken, period: Duration) -> Result<()>;

    /// 取消注册。未知令牌是无操作。
    /// Cancel a registration. Unknown tokens are ignored.
    fn cancel(&self, token: BackendToken);

    /// 停止投递并回收线程。必须幂等，并且可以在回调线程上调用。
    /// Stop delivery and reclaim threads. Must be idempotent and callable from a
    /// callback thread.
    fn shutdown(&self);
}

/// 根据配置和平台能力选择后端
/// Select the backend from configuration and platform capability
pub(crate) fn select(config: &Config, dispatcher: Arc<Dispatcher>) -> Result<Box<dyn Backend>> {
    let kind = match config.backend {
        BackendKind::Auto if cfg!(target_os = "linux") => BackendKind::SelfHosted,
        BackendKind::Auto => BackendKind::Executor,
        kind => kind,
    };
    debug!(requested = ?config.backend, selected = ?kind, "Selecting timer backend");

    match kind {
        BackendKind::Executor => Ok(Box::new(executor::ExecutorBackend::new(
            &config.executor,
            dispatcher,
        )?)),
        #[cfg(target_os = "linux")]
        _ => Ok(Box::new(self_hosted::SelfHostedBackend::new(
            &config.scheduler,
            dispatcher,
        )?)),
        #[cfg(not(target_os = "linux"))]
        _ => Err(crate::error::TimerError::Unsupported(
            "the self-hosted scheduler requires timerfd and epoll",
        )),
    }
}
