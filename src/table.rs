//! 带代数校验的句柄表
//! Generation-checked handle table
//!
//! 句柄表是公开 API 唯一直接触及的结构：它把不透明句柄映射到存活定时器的状态
//! （间隔、后端令牌、回调、状态）。所有修改都在一把互斥锁下串行化；调度热路径
//! 只在锁内克隆一个 `Arc`，从不在持锁时调用回调。
//!
//! The handle table is the only structure the public API touches directly: it
//! maps an opaque handle to the live timer's state (interval, backend token,
//! callback, status). Every mutation is serialized on one mutex; the dispatch
//! hot path only clones an `Arc` under the lock and never invokes a callback
//! while holding it.

use crate::backend::BackendToken;
use crate::error::{Result, TimerError};
use crate::handle::{TimerContext, TimerHandle};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;


/// 用户回调，可在多个定时器之间共享
/// User callback, shareable across timers
pub type Callback = Arc<dyn Fn(&TimerContext) + Send + Sync + 'static>;

/// 定时器生命周期状态
/// Timer lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimerStatus {
    /// 已调度，可以触发
    /// Scheduled and allowed to fire
    Active = 0,
    /// 已请求释放，可能仍有回调在执行
    /// Release requested, an invocation may still be running
    Releasing = 1,
    /// 槽位已回收
    /// Slot reclaimed
    Released = 2,
}

impl TimerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Releasing,
            _ => Self::Released,
        }
    }
}

/// 句柄表中的一个存活定时器
/// A live timer stored in the handle table
pub struct TimerEntry {
    handle: TimerHandle,
    interval_ms: AtomicU64,
    callback: Callback,
    status: AtomicU8,
    /// 正在执行的回调数量
    /// Number of callback invocations currently running
    in_flight: AtomicUsize,
    /// 后端注册令牌；`None` 表示尚未调度或已取消
    /// Backend registration; `None` before scheduling and after cancellation
    token: Mutex<Option<BackendToken>>,
}

impl TimerEntry {
    fn new(handle: TimerHandle, interval_ms: u64, callback: Callback) -> Self {
        Self {
            handle,
            interval_ms: AtomicU64::new(interval_ms),
            callback,
            status: AtomicU8::new(TimerStatus::Active as u8),
            in_flight: AtomicUsize::new(0),
            token: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    pub(crate) fn set_interval_ms(&self, interval_ms: u64) {
        self.interval_ms.store(interval_ms, Ordering::Release);
    }

    pub fn status(&self) -> TimerStatus {
        TimerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn callback(&self) -> &Callback {
        &self.callback
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Active -> Releasing. Only the first caller wins.
    pub(crate) fn begin_release(&self) -> bool {
        self.status
            .compare_exchange(
                TimerStatus::Active as u8,
                TimerStatus::Releasing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// 进入一次回调调用。只有在计数递增之后状态仍为 Active 时才允许调用，
    /// 因此 `begin_release` 返回之后不会有新的调用开始。
    ///
    /// Enter one invocation. The status is checked after the counter is bumped,
    /// so no invocation can start once `begin_release` has returned.
    pub(crate) fn try_enter(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.status() == TimerStatus::Active {
            true
        } else {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    /// Leave an invocation, returning how many are still running.
    pub(crate) fn exit(&self) -> usize {
        self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn token(&self) -> MutexGuard<'_, Option<BackendToken>> {
        self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("handle", &self.handle)
            .field("interval", &self.interval())
            .field("status", &self.status())
            .field("in_flight", &self.in_flight())
            .field("callback", &"<closure>")
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Arc<TimerEntry>>,
}

#[derive(Default)]
struct TableInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    occupied: usize,
    closed: bool,
}

impl TableInner {
    fn slot(&self, handle: TimerHandle) -> Option<&Arc<TimerEntry>> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_ref()
    }
}

/// 句柄表：可增长的槽位数组加上可复用索引的空闲链表
/// Handle table: a growable slot array plus a free list of reusable indices
#[derive(Default)]
pub struct HandleTable {
    inner: Mutex<TableInner>,
    /// 最后一个槽位被回收时通知
    /// Signalled when the last occupied slot is reclaimed
    emptied: Condvar,
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("occupied", &self.len())
            .finish()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 分配槽位并存入新定时器
    /// Allocate a slot and store a new timer in it
    pub fn allocate(&self, interval_ms: u64, callback: Callback) -> Result<Arc<TimerEntry>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TimerError::QueueShutdown);
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(inner.slots.len()).map_err(|_| {
                    TimerError::ResourceExhausted(std::io::Error::other("handle table is full"))
                })?;
                inner.slots.push(Slot::default());
                index
            }
        };

        let slot = &mut inner.slots[index as usize];
        // 0 is never handed out so a zeroed raw handle cannot match.
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            generation => generation,
        };
        let handle = TimerHandle::new(index, slot.generation);
        let entry = Arc::new(TimerEntry::new(handle, interval_ms, callback));
        slot.entry = Some(Arc::clone(&entry));
        inner.occupied += 1;

        trace!(%handle, interval_ms, "Slot allocated");
        Ok(entry)
    }

    /// 查找 Active 或 Releasing 状态的定时器；代数不匹配时返回 `None`
    /// Look up an Active or Releasing timer; `None` on a generation mismatch
    pub fn lookup(&self, handle: TimerHandle) -> Option<Arc<TimerEntry>> {
        self.lock().slot(handle).cloned()
    }

    /// 把定时器标记为 Releasing。仅当本次调用完成了状态转换时返回条目。
    /// Mark a timer Releasing. Returns the entry only if this call made the transition.
    pub fn mark_releasing(&self, handle: TimerHandle) -> Option<Arc<TimerEntry>> {
        let inner = self.lock();
        let entry = inner.slot(handle)?;
        entry.begin_release().then(|| Arc::clone(entry))
    }

    /// 在定时器已离开 Active 且没有回调在执行时回收其槽位。
    /// 对过期句柄或已回收槽位的调用是无操作。
    ///
    /// Reclaim the slot once the timer has left Active and no invocation is
    /// running. A stale handle or an already reclaimed slot is a no-op.
    pub fn finalize(&self, handle: TimerHandle) -> bool {
        let mut inner = self.lock();
        let idle = match inner.slot(handle) {
            Some(entry) => entry.status() != TimerStatus::Active && entry.in_flight() == 0,
            None => false,
        };
        if !idle {
            return false;
        }

        let index = handle.index();
        if let Some(entry) = inner.slots[index as usize].entry.take() {
            entry
                .status
                .store(TimerStatus::Released as u8, Ordering::SeqCst);
        }
        inner.free.push(index);
        inner.occupied -= 1;
        if inner.occupied == 0 {
            self.emptied.notify_all();
        }

        trace!(%handle, "Slot finalized");
        true
    }

    /// 撤销一次后端调度失败的分配
    /// Undo an allocation whose backend registration failed
    pub fn rollback(&self, handle: TimerHandle) {
        if let Some(entry) = self.lookup(handle) {
            entry.begin_release();
        }
        self.finalize(handle);
    }

    /// 拒绝后续分配，并把所有 Active 定时器转为 Releasing 后返回
    /// Refuse further allocations and move every Active timer to Releasing
    pub fn close_and_drain(&self) -> Vec<Arc<TimerEntry>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|entry| entry.begin_release())
            .cloned()
            .collect()
    }

    /// 阻塞直到所有槽位都被回收
    /// Block until every slot has been reclaimed
    pub fn wait_until_empty(&self) {
        let mut inner = self.lock();
        while inner.occupied > 0 {
            inner = self
                .emptied
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 已占用槽位数（Active 与 Releasing）
    /// Occupied slots (Active and Releasing)
    pub fn len(&self) -> usize {
        self.lock().occupied
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已分配的槽位总数，包括空闲槽位
    /// Total slots ever allocated, free ones included
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }
}
