//! 工作线程池
//! Worker pool
//!
//! 每个工作线程独立阻塞在共享的多路复用器上；任何线程都可能收到任意一批就绪
//! 描述符，因此不同定时器可以在不同线程上并发触发。
//!
//! Each worker blocks on the shared multiplexer on its own; any worker may
//! receive any batch of ready descriptors, so different timers can fire
//! concurrently on different threads.

use super::SchedulerShared;
use super::poller::{CONTROL_TOKEN, Events};
use crate::backend::BackendToken;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// 固定大小的工作线程池
/// Fixed-size worker pool
pub struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// 启动 `count` 个工作线程。若中途失败，已启动的线程会被停止并回收。
    /// Start `count` workers. If spawning fails midway, the workers already
    /// started are stopped and joined.
    pub fn spawn(count: usize, shared: Arc<SchedulerShared>) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("timer-worker-{id}"))
                .spawn(move || worker_loop(id, worker_shared));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    shared.stopping.store(true, Ordering::Release);
                    let _ = shared.poller.wake_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            handles: Mutex::new(handles),
            size: count,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    /// 回收所有工作线程。调用线程本身若是工作线程，则跳过它（它会在回调返回后自行退出）。
    /// Join every worker. When the caller is itself a worker it is skipped; it
    /// exits on its own once its callback returns.
    pub fn join(&self) {
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let current = thread::current().id();

        for handle in handles {
            if handle.thread().id() == current {
                debug!("Scheduler shut down from its own worker, detaching it");
                continue;
            }
            if handle.join().is_err() {
                error!("Timer worker thread panicked");
            }
        }
    }
}

/// 工作线程主循环
/// Worker main loop
fn worker_loop(id: usize, shared: Arc<SchedulerShared>) {
    debug!(worker = id, "Timer worker started");

    let mut events = Events::with_capacity(shared.config.max_events_per_wait);
    let mut consecutive_failures: u32 = 0;

    'wait: while !shared.stopping.load(Ordering::Acquire) {
        match shared.poller.wait(&mut events) {
            Ok(_) => consecutive_failures = 0,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                consecutive_failures += 1;
                if consecutive_failures >= shared.config.max_consecutive_wait_failures {
                    shared.dispatcher.record_fatal(format!(
                        "epoll_wait failed {consecutive_failures} times in a row: {err}"
                    ));
                    shared.stopping.store(true, Ordering::Release);
                    let _ = shared.poller.wake_all();
                    break;
                }
                warn!(
                    worker = id,
                    attempt = consecutive_failures,
                    error = %err,
                    "Readiness wait failed, retrying"
                );
                thread::sleep(shared.config.wait_retry_backoff);
                continue;
            }
        }

        trace!(worker = id, ready = events.len(), "Worker woke");

        // Re-enable the whole batch before running any callback, so other
        // workers can take the next ticks of these timers meanwhile.
        let owners: Vec<_> = events
            .tokens()
            .filter(|token| *token != CONTROL_TOKEN)
            .filter_map(|token| shared.service(BackendToken::new(token)))
            .collect();

        for owner in owners {
            if shared.stopping.load(Ordering::Acquire) {
                break 'wait;
            }
            shared.dispatcher.dispatch(owner);
        }
    }

    debug!(worker = id, "Timer worker stopped");
}
