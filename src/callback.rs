//! 回调辅助工具
//! Callback helpers
//!
//! 队列本身不阻止同一定时器的相邻滴答重叠。需要不重叠语义的调用方可以用
//! [`NonOverlapping`] 包装回调：它在入口检查并设置一个原子忙标志，在出口清除，
//! 忙碌期间到达的滴答被跳过。
//!
//! The queue does not prevent consecutive ticks of one timer from overlapping.
//! Callers that need non-overlapping semantics can wrap their callback in
//! [`NonOverlapping`]: it checks and sets an atomic busy flag on entry, clears it
//! on exit, and skips ticks that arrive while busy.
//!
//! 把滴答转交到特定线程（例如 UI 线程）同样由调用方负责；[`channel_callback`]
//! 把每次触发的上下文发送到一个 tokio mpsc 通道，由消费方在自己的上下文中接收。
//!
//! Handing ticks to a specific thread (a UI thread, say) is also up to the
//! caller; [`channel_callback`] forwards every firing context into a tokio mpsc
//! channel for the consumer to drain on its own context.

use crate::handle::TimerContext;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// 跳过重叠调用的回调包装器。每个定时器应使用自己的包装实例。
/// Callback wrapper that skips overlapping invocations. Use one wrapper per timer.
#[derive(Debug)]
pub struct NonOverlapping<F> {
    inner: F,
    busy: AtomicBool,
    skipped: AtomicU64,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<F> NonOverlapping<F>
where
    F: Fn(&TimerContext) + Send + Sync + 'static,
{
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            busy: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
        }
    }

    /// 若没有调用在执行则运行内部回调，返回是否运行
    /// Run the inner callback unless an invocation is already running; returns
    /// whether it ran
    pub fn call(&self, context: &TimerContext) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let _guard = BusyGuard(&self.busy);
        (self.inner)(context);
        true
    }

    /// 因重叠被跳过的滴答数
    /// Ticks skipped because of overlap
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// 转换为可直接传给 `TimerQueue::add` 的闭包
    /// Turn into a closure that can be passed to `TimerQueue::add`
    pub fn into_callback(self) -> impl Fn(&TimerContext) + Send + Sync + 'static {
        move |context: &TimerContext| {
            self.call(context);
        }
    }
}

/// 把每次触发的上下文转发到 mpsc 通道。通道已满或已关闭时丢弃该次滴答并记录警告。
/// Forward every firing context into an mpsc channel. A tick is dropped with a
/// warning when the channel is full or closed.
pub fn channel_callback(
    sender: mpsc::Sender<TimerContext>,
) -> impl Fn(&TimerContext) + Send + Sync + 'static {
    move |context: &TimerContext| {
        if let Err(e) = sender.try_send(*context) {
            warn!(handle = %context.handle, "Failed to forward timer tick: {:?}", e);
        }
    }
}
