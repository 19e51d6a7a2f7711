//! 定时器队列外观
//! Timer queue facade
//!
//! `TimerQueue` 组合句柄表、分发器和一个在构造时选定的后端。公开操作
//! （`add`、`release`、`set_interval`）从不阻塞在正在执行的回调上，可以在任何
//! 线程上调用，包括在回调内部调用（定时器可以释放或重新配置自己）。
//!
//! `TimerQueue` composes the handle table, the dispatcher and a backend chosen
//! once at construction. The public operations (`add`, `release`,
//! `set_interval`) never block on a running callback and may be called from any
//! thread, including from inside a callback (a timer may release or reconfigure
//! itself).
//!
//! 同一定时器的相邻滴答在回调执行时间超过周期时可能重叠；需要不重叠语义时请使用
//! [`crate::callback::NonOverlapping`]。
//!
//! Consecutive ticks of one timer may overlap when a callback outlives the
//! period; use [`crate::callback::NonOverlapping`] when that matters.

use crate::backend::{self, Backend};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TimerError};
use crate::handle::{TimerContext, TimerHandle};
use crate::table::{Callback, HandleTable, TimerStatus};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};


/// 允许的最长间隔（约 49.7 天）
/// Longest accepted interval (about 49.7 days)
pub const MAX_INTERVAL: Duration = Duration::from_millis(u32::MAX as u64);

/// 校验间隔并截断为整毫秒
/// Validate an interval and truncate it to whole milliseconds
fn whole_millis(interval: Duration) -> Result<u64> {
    if interval < Duration::from_millis(1) {
        return Err(TimerError::InvalidArgument(
            "interval must be at least one millisecond",
        ));
    }
    if interval > MAX_INTERVAL {
        return Err(TimerError::InvalidArgument("interval is too long"));
    }
    Ok(interval.as_millis() as u64)
}

/// 队列统计快照
/// Snapshot of queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// 后端名称
    /// Backend name
    pub backend: &'static str,
    /// 存活定时器数（Active 与 Releasing）
    /// Live timers (Active and Releasing)
    pub live_timers: usize,
    /// 已分配的槽位总数
    /// Slots ever allocated
    pub slot_capacity: usize,
    /// 已投递的滴答数
    /// Ticks delivered to a callback
    pub ticks_delivered: u64,
    /// 因句柄失效或定时器释放而丢弃的滴答数
    /// Ticks dropped because the handle was stale or the timer was releasing
    pub ticks_dropped: u64,
    /// panic 的回调次数
    /// Callback invocations that panicked
    pub callback_panics: u64,
    /// 队列是否已关闭
    /// Whether the queue has been shut down
    pub shut_down: bool,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueStats {{ backend: {}, timers: {}, slots: {}, delivered: {}, dropped: {}, panicked: {}, shut_down: {} }}",
            self.backend,
            self.live_timers,
            self.slot_capacity,
            self.ticks_delivered,
            self.ticks_dropped,
            self.callback_panics,
            self.shut_down
        )
    }
}

/// 定时器多路复用队列
/// Timer multiplexing queue
pub struct TimerQueue {
    table: Arc<HandleTable>,
    dispatcher: Arc<Dispatcher>,
    backend: Box<dyn Backend>,
    shut_down: AtomicBool,
}

impl TimerQueue {
    /// 使用默认配置创建队列
    /// Create a queue with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    /// 使用给定配置创建队列，后端在此时选定
    /// Create a queue with the given configuration; the backend is chosen here
    pub fn with_config(config: Config) -> Result<Self> {
        Self::build(|dispatcher| backend::select(&config, dispatcher))
    }

    /// 使用自定义后端创建队列。工厂收到队列的分发器，后端必须通过
    /// [`Dispatcher::dispatch`] 投递滴答。
    ///
    /// Create a queue over a custom backend. The factory receives the queue's
    /// dispatcher; the backend must deliver ticks through
    /// [`Dispatcher::dispatch`].
    pub fn with_backend<B, F>(factory: F) -> Result<Self>
    where
        B: Backend,
        F: FnOnce(Arc<Dispatcher>) -> Result<B>,
    {
        Self::build(|dispatcher| Ok(Box::new(factory(dispatcher)?) as Box<dyn Backend>))
    }

    fn build<F>(factory: F) -> Result<Self>
    where
        F: FnOnce(Arc<Dispatcher>) -> Result<Box<dyn Backend>>,
    {
        let table = Arc::new(HandleTable::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&table)));
        let backend = factory(Arc::clone(&dispatcher))?;

        info!(backend = backend.name(), "Timer queue started");
        Ok(Self {
            table,
            dispatcher,
            backend,
            shut_down: AtomicBool::new(false),
        })
    }

    /// 注册一个重复定时器。首次调用发生在一个完整间隔之后。
    /// Register a repeating timer. The first invocation happens one full
    /// interval later.
    ///
    /// `interval` 至少为 1 毫秒，并被截断为整毫秒。
    /// `interval` must be at least one millisecond and is truncated to whole
    /// milliseconds.
    pub fn add<F>(&self, interval: Duration, callback: F) -> Result<TimerHandle>
    where
        F: Fn(&TimerContext) + Send + Sync + 'static,
    {
        self.add_shared(interval, Arc::new(callback))
    }

    /// 与 [`add`](Self::add) 相同，但接受一个可在多个定时器间共享的回调
    /// Like [`add`](Self::add), but takes a callback that can be shared by
    /// many timers
    pub fn add_shared(&self, interval: Duration, callback: Callback) -> Result<TimerHandle> {
        let interval_ms = whole_millis(interval)?;
        self.dispatcher.check_health()?;

        let entry = self.table.allocate(interval_ms, callback)?;
        let handle = entry.handle();

        // A callback releasing this timer waits here for the token.
        let mut slot = entry.token();
        let token = match self
            .backend
            .schedule(handle, Duration::from_millis(interval_ms))
        {
            Ok(token) => token,
            Err(err) => {
                drop(slot);
                self.table.rollback(handle);
                warn!(%handle, error = %err, "Failed to schedule timer, slot rolled back");
                return Err(err);
            }
        };

        if entry.status() != TimerStatus::Active {
            // Released before the registration was stored, either by its own
            // first callback or by `release_all`.
            drop(slot);
            self.backend.cancel(token);
            self.table.finalize(handle);
            if self.table.is_closed() {
                return Err(TimerError::QueueShutdown);
            }
            debug!(%handle, "Timer released before add returned");
            return Ok(handle);
        }
        *slot = Some(token);

        debug!(%handle, interval_ms, "Timer added");
        Ok(handle)
    }

    /// 修改定时器间隔。下一次触发反映新间隔；已分发的调用不受影响。
    /// Change a timer's interval. The next fire reflects the new period; an
    /// invocation already dispatched is unaffected.
    ///
    /// 句柄无效、正在释放或已释放时返回 `NotFound`。
    /// Returns `NotFound` when the handle is invalid, releasing or released.
    pub fn set_interval(&self, handle: TimerHandle, interval: Duration) -> Result<()> {
        let interval_ms = whole_millis(interval)?;
        self.dispatcher.check_health()?;

        let entry = self.table.lookup(handle).ok_or(TimerError::NotFound)?;
        let slot = entry.token();
        if entry.status() != TimerStatus::Active {
            return Err(TimerError::NotFound);
        }
        let token = (*slot).ok_or(TimerError::NotFound)?;

        self.backend
            .reschedule(token, Duration::from_millis(interval_ms))?;
        entry.set_interval_ms(interval_ms);

        debug!(%handle, interval_ms, "Timer interval changed");
        Ok(())
    }

    /// 释放定时器。幂等，从不报错；未知、过期或已释放的句柄是无操作。
    /// 返回后不会有新的回调开始，但不等待正在执行的回调。
    ///
    /// Release a timer. Idempotent and never fails; unknown, stale or released
    /// handles are no-ops. No new invocation starts after this returns, but a
    /// running one is not waited for.
    pub fn release(&self, handle: TimerHandle) {
        let Some(entry) = self.table.mark_releasing(handle) else {
            trace!(%handle, "Release ignored, timer not active");
            return;
        };

        let token = entry.token().take();
        if let Some(token) = token {
            self.backend.cancel(token);
        }
        // Reclaimed here when idle, otherwise by the last in-flight invocation.
        self.table.finalize(handle);

        debug!(%handle, "Timer released");
    }

    /// 释放所有定时器，等待所有正在执行的回调完成并回收所有工作线程。
    /// 之后队列处于关闭状态。可重复调用；`Drop` 时自动调用。
    ///
    /// Release every timer, wait for all in-flight callbacks and reclaim every
    /// worker thread. The queue is shut down afterwards. Safe to call twice;
    /// also run on `Drop`.
    ///
    /// 在本队列的回调中调用时，不会等待调用方自身所在的回调。
    /// When called from one of this queue's callbacks, the calling callback is
    /// not waited for.
    pub fn release_all(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained = self.table.close_and_drain();
        let released = drained.len();
        for entry in drained {
            let token = entry.token().take();
            if let Some(token) = token {
                self.backend.cancel(token);
            }
            self.table.finalize(entry.handle());
        }

        if self.dispatcher.in_callback() {
            warn!("release_all called from a timer callback, not waiting for in-flight callbacks");
        } else {
            self.table.wait_until_empty();
        }
        self.backend.shutdown();

        info!(
            released,
            backend = self.backend.name(),
            "Timer queue shut down"
        );
    }

    /// 定时器当前间隔；句柄无效时返回 `None`
    /// Current interval of a timer; `None` for an invalid handle
    pub fn interval(&self, handle: TimerHandle) -> Option<Duration> {
        self.table
            .lookup(handle)
            .filter(|entry| entry.status() == TimerStatus::Active)
            .map(|entry| entry.interval())
    }

    /// 句柄是否指向一个 Active 定时器
    /// Whether the handle refers to an Active timer
    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.interval(handle).is_some()
    }

    /// 存活定时器数，包括仍有回调在执行的已释放定时器
    /// Live timers, including released ones whose callback is still running
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// 若调度器已发生致命故障则返回 `SchedulerFatal`
    /// Returns `SchedulerFatal` if the scheduler has failed
    pub fn check_health(&self) -> Result<()> {
        self.dispatcher.check_health()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            backend: self.backend.name(),
            live_timers: self.table.len(),
            slot_capacity: self.table.capacity(),
            ticks_delivered: self.dispatcher.ticks_delivered(),
            ticks_dropped: self.dispatcher.ticks_dropped(),
            callback_panics: self.dispatcher.callback_panics(),
            shut_down: self.shut_down.load(Ordering::Acquire),
        }
    }

    #[cfg(test)]
    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("backend", &self.backend.name())
            .field("table", &self.table)
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.release_all();
    }
}
