//! 自托管调度器
//! Self-hosted scheduler
//!
//! 用于没有原生定时回调设施的平台。每个 Active 定时器拥有一个周期性 timerfd，
//! 所有描述符注册在同一个 epoll 实例上，一个固定大小的工作线程池阻塞在该实例上
//! 并把就绪的描述符解析为句柄表条目后调用回调。
//!
//! Used where no native scheduled-callback facility exists. Every Active timer
//! owns one periodic timerfd, all descriptors are registered with one shared
//! epoll instance, and a fixed-size worker pool blocks on it, resolving ready
//! descriptors to handle-table entries and invoking their callbacks.
//!
//! 周期性 timerfd 由内核自动重新装配，正常投递时两次滴答之间调度器无需任何工作。
//! Periodic timerfds re-arm in the kernel, so normal delivery needs no scheduler
//! work between ticks beyond wait and dispatch.

pub(crate) mod descriptor;
pub(crate) mod poller;
pub(crate) mod workers;

use crate::backend::{Backend, BackendToken, TokenSource};
use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TimerError};
use crate::handle::TimerHandle;
use dashmap::DashMap;
use descriptor::{Descriptor, TimerFd};
use poller::Poller;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, trace, warn};
use workers::WorkerPool;

/// 调度器与工作线程共享的状态
/// State shared between the scheduler and its workers
pub(crate) struct SchedulerShared {
    pub(crate) poller: Poller,
    /// 令牌到描述符的注册表
    /// Token to descriptor registry
    pub(crate) registry: DashMap<BackendToken, Descriptor>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) stopping: AtomicBool,
    pub(crate) config: SchedulerConfig,
}

impl SchedulerShared {
    /// 读取就绪的描述符并重新启用它，返回其所属句柄。
    /// 到期计数已被读走（或描述符已被注销）时返回 `None`。
    ///
    /// Read a ready descriptor and re-enable it, returning its owner. `None` when
    /// the count was already consumed or the descriptor is gone.
    ///
    /// 注册表读锁在读取和重新启用期间一直持有，因此 `cancel` 无法在此期间关闭描述符，
    /// 描述符编号也就不会被复用。回调在锁释放之后才调用。
    /// The registry read guard is held across read and rearm, so `cancel` cannot
    /// close the descriptor (and its number cannot be reused) meanwhile. The
    /// callback runs after the guard is gone.
    pub(crate) fn service(&self, token: BackendToken) -> Option<TimerHandle> {
        let descriptor = self.registry.get(&token)?;
        let fd = descriptor.timer.as_raw_fd();

        let expirations = match descriptor.timer.read_expirations() {
            Ok(expirations) => expirations,
            Err(err) => {
                warn!(token = token.raw(), error = %err, "Failed to read timer descriptor");
                None
            }
        };

        if let Err(err) = self.poller.rearm(fd, token.raw()) {
            warn!(token = token.raw(), error = %err, "Failed to re-enable timer descriptor");
        }

        let expirations = expirations?;
        if expirations > 1 {
            // Overruns are coalesced into one tick.
            trace!(owner = %descriptor.owner, expirations, "Timer descriptor overran");
        }
        Some(descriptor.owner)
    }
}

/// 自托管调度后端
/// Self-hosted scheduling backend
pub struct SelfHostedBackend {
    shared: Arc<SchedulerShared>,
    workers: WorkerPool,
    tokens: TokenSource,
}

impl SelfHostedBackend {
    /// 创建多路复用器并启动工作线程池
    /// Create the multiplexer and start the worker pool
    pub fn new(config: &SchedulerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let poller = Poller::new().map_err(TimerError::ResourceExhausted)?;
        let shared = Arc::new(SchedulerShared {
            poller,
            registry: DashMap::new(),
            dispatcher,
            stopping: AtomicBool::new(false),
            config: config.clone(),
        });
        let workers = WorkerPool::spawn(config.worker_threads.max(1), Arc::clone(&shared))
            .map_err(TimerError::ResourceExhausted)?;

        info!(
            worker_threads = workers.len(),
            max_events_per_wait = config.max_events_per_wait,
            "Self-hosted scheduler started"
        );

        Ok(Self {
            shared,
            workers,
            tokens: TokenSource::default(),
        })
    }

    /// 当前注册的描述符数量
    /// Number of registered descriptors
    pub fn descriptor_count(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Backend for SelfHostedBackend {
    fn name(&self) -> &'static str {
        "self-hosted"
    }

    fn schedule(&self, handle: TimerHandle, period: Duration) -> Result<BackendToken> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(TimerError::QueueShutdown);
        }

        let timer = TimerFd::new().map_err(TimerError::ResourceExhausted)?;
        timer
            .arm_periodic(period)
            .map_err(TimerError::ResourceExhausted)?;

        let token = self.tokens.next();
        let fd = timer.as_raw_fd();
        self.shared.registry.insert(
            token,
            Descriptor {
                timer,
                owner: handle,
            },
        );

        if let Err(err) = self.shared.poller.register(fd, token.raw()) {
            self.shared.registry.remove(&token);
            return Err(TimerError::ResourceExhausted(err));
        }

        trace!(%handle, token = token.raw(), fd, period_ms = period.as_millis() as u64, "Timer descriptor registered");
        Ok(token)
    }

    fn reschedule(&self, token: BackendToken, period: Duration) -> Result<()> {
        let descriptor = self.shared.registry.get(&token).ok_or(TimerError::NotFound)?;
        // timerfd_settime replaces the old setting in one step.
        descriptor
            .timer
            .arm_periodic(period)
            .map_err(TimerError::ResourceExhausted)?;
        trace!(owner = %descriptor.owner, token = token.raw(), period_ms = period.as_millis() as u64, "Timer descriptor re-armed");
        Ok(())
    }

    fn cancel(&self, token: BackendToken) {
        let Some((_, descriptor)) = self.shared.registry.remove(&token) else {
            return;
        };
        if let Err(err) = self.shared.poller.deregister(descriptor.timer.as_raw_fd()) {
            warn!(token = token.raw(), error = %err, "Failed to deregister timer descriptor");
        }
        trace!(owner = %descriptor.owner, token = token.raw(), "Timer descriptor closed");
    }

    fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        if let Err(err) = self.shared.poller.wake_all() {
            warn!(error = %err, "Failed to signal scheduler control channel");
        }
        self.workers.join();

        // Closing a descriptor also removes it from the epoll set.
        self.shared.registry.clear();
    }
}

impl Drop for SelfHostedBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TimerContext;
    use crate::table::{Callback, HandleTable};
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    fn setup() -> (Arc<HandleTable>, SelfHostedBackend, Arc<AtomicUsize>) {
        setup_with(SchedulerConfig {
            worker_threads: 2,
            ..SchedulerConfig::default()
        })
    }

    fn setup_with(config: SchedulerConfig) -> (Arc<HandleTable>, SelfHostedBackend, Arc<AtomicUsize>) {
        let table = Arc::new(HandleTable::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&table)));
        let backend = SelfHostedBackend::new(&config, dispatcher).unwrap();
        (table, backend, Arc::new(AtomicUsize::new(0)))
    }

    fn counting(table: &HandleTable, count: &Arc<AtomicUsize>, interval_ms: u64) -> TimerHandle {
        let count = Arc::clone(count);
        let callback: Callback = Arc::new(move |_: &TimerContext| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        table.allocate(interval_ms, callback).unwrap().handle()
    }

    #[test]
    fn test_descriptor_lifecycle() {
        let (table, backend, count) = setup();
        let handle = counting(&table, &count, 10);

        let token = backend.schedule(handle, Duration::from_millis(10)).unwrap();
        assert_eq!(backend.descriptor_count(), 1);
        sleep(Duration::from_millis(120));
        assert!(count.load(Ordering::SeqCst) >= 3);

        backend.cancel(token);
        backend.cancel(token);
        assert_eq!(backend.descriptor_count(), 0);

        sleep(Duration::from_millis(20));
        let after_cancel = count.load(Ordering::SeqCst);
        sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_reschedule_rearms_same_descriptor() {
        let (table, backend, count) = setup();
        let handle = counting(&table, &count, 1000);

        let token = backend.schedule(handle, Duration::from_secs(1)).unwrap();
        backend.reschedule(token, Duration::from_millis(10)).unwrap();
        assert_eq!(backend.descriptor_count(), 1);

        sleep(Duration::from_millis(150));
        assert!(count.load(Ordering::SeqCst) >= 3);

        assert!(matches!(
            backend.reschedule(BackendToken::new(u64::MAX), Duration::from_millis(10)),
            Err(TimerError::NotFound)
        ));
    }

    #[test]
    fn test_tick_for_released_slot_is_dropped() {
        let (table, backend, count) = setup();
        let handle = counting(&table, &count, 5);
        backend.schedule(handle, Duration::from_millis(5)).unwrap();

        // Released in the table while the descriptor is still registered
        table.mark_releasing(handle).unwrap();
        sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(table.is_empty(), "dropped tick should reclaim the idle slot");
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let (table, backend, count) = setup();
        let handle = counting(&table, &count, 5);
        backend.schedule(handle, Duration::from_millis(5)).unwrap();
        sleep(Duration::from_millis(30));

        backend.shutdown();
        backend.shutdown();
        assert_eq!(backend.descriptor_count(), 0);

        let stopped_at = count.load(Ordering::SeqCst);
        sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
        assert!(matches!(
            backend.schedule(handle, Duration::from_millis(5)),
            Err(TimerError::QueueShutdown)
        ));
    }

    /// 慢回调只占用一个工作线程，同周期的快定时器继续由其他线程按速率触发
    /// A slow callback occupies one worker; a fast timer sharing its period
    /// keeps its rate on the others
    fn assert_slow_callback_does_not_stall_peer(config: SchedulerConfig) {
        let (table, backend, fast) = setup_with(config);

        let stalled = Arc::new(AtomicBool::new(false));
        let slow: Callback = Arc::new(move |_: &TimerContext| {
            if !stalled.swap(true, Ordering::SeqCst) {
                sleep(Duration::from_millis(600));
            }
        });
        let slow = table.allocate(50, slow).unwrap().handle();
        let fast_handle = counting(&table, &fast, 50);

        backend.schedule(slow, Duration::from_millis(50)).unwrap();
        backend.schedule(fast_handle, Duration::from_millis(50)).unwrap();
        sleep(Duration::from_millis(1025));
        backend.shutdown();

        let fired = fast.load(Ordering::SeqCst);
        assert!(fired >= 14, "fast timer fired {fired} times, expected about 20");
    }

    #[test]
    fn test_slow_callback_does_not_stall_other_timers() {
        assert_slow_callback_does_not_stall_peer(SchedulerConfig {
            worker_threads: 2,
            ..SchedulerConfig::default()
        });
    }

    #[test]
    fn test_batched_wait_reenables_every_ready_timer() {
        assert_slow_callback_does_not_stall_peer(SchedulerConfig {
            worker_threads: 2,
            max_events_per_wait: 64,
            ..SchedulerConfig::default()
        });
    }
}
