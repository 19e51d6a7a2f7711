//! 滴答分发器
//! Tick dispatcher
//!
//! 所有后端（自托管调度器、执行器适配器或自定义原生适配器）都通过同一条
//! 查找/调用路径把一次滴答变成一次回调调用，因此无论后端如何，回调行为都一致。
//! 分发器同时保存队列级的健康状态（粘滞的致命错误）和投递统计。
//!
//! Every backend (self-hosted scheduler, executor adapter or a custom native
//! adapter) turns a tick into a callback invocation through this one
//! lookup/invoke path, so callback behaviour is identical regardless of the
//! backend. The dispatcher also carries queue-level health (a sticky fatal
//! error) and delivery statistics.

use crate::error::{Result, TimerError};
use crate::handle::{TimerContext, TimerHandle};
use crate::table::{HandleTable, TimerEntry, TimerStatus};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, trace, warn};

thread_local! {
    /// 当前线程上正在执行回调的分发器（按地址区分）
    /// Dispatchers currently running a callback on this thread, by address
    static ACTIVE_DISPATCHERS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// 回调执行期间在线程局部栈上登记分发器
/// Registers a dispatcher on the thread-local stack while a callback runs
struct CallbackScope {
    id: usize,
}

impl CallbackScope {
    fn enter(id: usize) -> Self {
        ACTIVE_DISPATCHERS.with(|stack| stack.borrow_mut().push(id));
        Self { id }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        ACTIVE_DISPATCHERS.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|id| *id == self.id) {
                stack.remove(pos);
            }
        });
    }
}

/// 离开调用时递减计数，并在定时器已释放且空闲时回收槽位（即使回调 panic）
/// Leaves the invocation and reclaims the slot once a released timer goes idle,
/// even if the callback panicked
struct InFlight<'a> {
    table: &'a HandleTable,
    entry: &'a TimerEntry,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.entry.exit() == 0 && self.entry.status() != TimerStatus::Active {
            self.table.finalize(self.entry.handle());
        }
    }
}

/// 投递统计
/// Delivery statistics
#[derive(Debug, Default)]
struct DispatchCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

/// 分发器：把滴答解析为句柄表条目并调用其回调
/// Dispatcher: resolves ticks to handle-table entries and invokes their callbacks
#[derive(Debug)]
pub struct Dispatcher {
    table: Arc<HandleTable>,
    counters: DispatchCounters,
    fatal: OnceLock<String>,
}

impl Dispatcher {
    pub(crate) fn new(table: Arc<HandleTable>) -> Self {
        Self {
            table,
            counters: DispatchCounters::default(),
            fatal: OnceLock::new(),
        }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// 投递一次滴答。句柄无法解析或定时器正在释放时滴答被静默丢弃。
    /// 回调在调用线程上同步执行。返回回调是否被调用。
    ///
    /// Deliver one tick. The tick is silently dropped when the handle no longer
    /// resolves or the timer is being released. The callback runs synchronously
    /// on the calling thread. Returns whether the callback was invoked.
    pub fn dispatch(&self, handle: TimerHandle) -> bool {
        let Some(entry) = self.table.lookup(handle) else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%handle, "Tick dropped, handle no longer resolves");
            return false;
        };

        if !entry.try_enter() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%handle, "Tick dropped, timer is being released");
            self.table.finalize(handle);
            return false;
        }

        let _in_flight = InFlight {
            table: &self.table,
            entry: &entry,
        };
        let context = TimerContext {
            handle,
            interval: entry.interval(),
        };

        let outcome = {
            let _scope = CallbackScope::enter(self.id());
            panic::catch_unwind(AssertUnwindSafe(|| (entry.callback())(&context)))
        };

        match outcome {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                trace!(%handle, interval_ms = context.interval.as_millis() as u64, "Tick delivered");
            }
            Err(_) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                warn!(%handle, "Timer callback panicked");
            }
        }
        true
    }

    /// 当前线程是否正在执行本分发器的回调
    /// Whether the current thread is running one of this dispatcher's callbacks
    pub fn in_callback(&self) -> bool {
        let id = self.id();
        ACTIVE_DISPATCHERS.with(|stack| stack.borrow().contains(&id))
    }

    /// 记录不可恢复的调度器故障。只保留第一次的原因。
    /// Record an unrecoverable scheduler failure. Only the first reason is kept.
    pub fn record_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.fatal.set(reason.clone()).is_ok() {
            error!(reason = %reason, "Scheduler failed, timer queue is no longer delivering ticks");
        }
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.get().map(String::as_str)
    }

    /// 若已记录致命错误则返回 `SchedulerFatal`
    /// Returns `SchedulerFatal` once a fatal error has been recorded
    pub fn check_health(&self) -> Result<()> {
        match self.fatal.get() {
            Some(reason) => Err(TimerError::SchedulerFatal(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn ticks_delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    pub fn ticks_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn callback_panics(&self) -> u64 {
        self.counters.panicked.load(Ordering::Relaxed)
    }
}
