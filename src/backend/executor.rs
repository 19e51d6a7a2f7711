//! 定时线程池执行器后端
//! Scheduled thread-pool executor backend
//!
//! 每个队列拥有一个专用的 tokio 多线程运行时。每个定时器是运行时上的一个任务，
//! 驱动一个 `interval_at(now + period, period)`；每次滴答把分发交给阻塞线程池，
//! 因此慢回调不会拖慢其他定时器，同一定时器的相邻滴答也可能重叠。
//!
//! Each queue owns a dedicated multi-threaded tokio runtime. Every timer is one
//! task on it driving an `interval_at(now + period, period)`; each tick hands the
//! dispatch to the blocking pool, so a slow callback never delays other timers
//! and consecutive ticks of one timer may overlap.
//!
//! 回调线程数受 `ExecutorConfig::callback_threads` 限制，超出的滴答在阻塞池中排队。
//! Callback threads are capped by `ExecutorConfig::callback_threads`; extra
//! ticks queue in the blocking pool.
//!
//! 周期修改通过 `watch` 通道原地完成：任务收到新周期后重建自己的 interval。
//! Period changes happen in place over a `watch` channel: the task rebuilds its
//! interval when a new period arrives.

use crate::backend::{Backend, BackendToken, TokenSource};
use crate::config::ExecutorConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TimerError};
use crate::handle::TimerHandle;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace};

/// 运行时上的一个已调度定时器
/// One scheduled timer on the runtime
struct ScheduledTask {
    period_tx: watch::Sender<Duration>,
    abort: AbortHandle,
}

/// 执行器后端
/// Executor backend
pub struct ExecutorBackend {
    dispatcher: Arc<Dispatcher>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    tasks: DashMap<BackendToken, ScheduledTask>,
    tokens: TokenSource,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
}

impl ExecutorBackend {
    /// 创建后端及其专用运行时
    /// Create the backend and its dedicated runtime
    pub fn new(config: &ExecutorConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .max_blocking_threads(config.callback_threads.max(1))
            .thread_name("timer-executor")
            .enable_time()
            .build()
            .map_err(TimerError::ResourceExhausted)?;
        let handle = runtime.handle().clone();

        debug!(
            worker_threads = config.worker_threads.max(1),
            callback_threads = config.callback_threads.max(1),
            "Executor backend started"
        );

        Ok(Self {
            dispatcher,
            runtime: Mutex::new(Some(runtime)),
            handle,
            tasks: DashMap::new(),
            tokens: TokenSource::default(),
            shutdown_timeout: config.shutdown_timeout,
            stopped: AtomicBool::new(false),
        })
    }
}

/// 首次滴答在一个完整周期之后；错过的滴答被合并，与 timerfd 的行为一致
/// First tick one full period away; missed ticks are coalesced, as with timerfd
fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// 单个定时器的驱动循环
/// Drive loop of one timer
async fn run_timer(
    handle: TimerHandle,
    mut period_rx: watch::Receiver<Duration>,
    dispatcher: Arc<Dispatcher>,
) {
    let period = *period_rx.borrow_and_update();
    let mut ticker = new_ticker(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::task::spawn_blocking(move || {
                    dispatcher.dispatch(handle);
                });
            }

            changed = period_rx.changed() => {
                if changed.is_err() {
                    // 发送端已丢弃：注册已被取消
                    // Sender dropped: the registration was cancelled
                    break;
                }
                let period = *period_rx.borrow_and_update();
                ticker = new_ticker(period);
                trace!(%handle, period_ms = period.as_millis() as u64, "Executor timer re-armed");
            }
        }
    }
}

impl Backend for ExecutorBackend {
    fn name(&self) -> &'static str {
        "executor"
    }

    fn schedule(&self, handle: TimerHandle, period: Duration) -> Result<BackendToken> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TimerError::QueueShutdown);
        }

        let token = self.tokens.next();
        let (period_tx, period_rx) = watch::channel(period);
        let task = self
            .handle
            .spawn(run_timer(handle, period_rx, Arc::clone(&self.dispatcher)));
        self.tasks.insert(
            token,
            ScheduledTask {
                period_tx,
                abort: task.abort_handle(),
            },
        );

        trace!(%handle, token = token.raw(), period_ms = period.as_millis() as u64, "Executor timer scheduled");
        Ok(token)
    }

    fn reschedule(&self, token: BackendToken, period: Duration) -> Result<()> {
        let task = self.tasks.get(&token).ok_or(TimerError::NotFound)?;
        task.period_tx
            .send(period)
            .map_err(|_| TimerError::NotFound)
    }

    fn cancel(&self, token: BackendToken) {
        if let Some((_, task)) = self.tasks.remove(&token) {
            task.abort.abort();
            trace!(token = token.raw(), "Executor timer cancelled");
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.tasks.retain(|_, task| {
            task.abort.abort();
            false
        });

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            // A runtime cannot be dropped from inside an async context or from
            // one of its own blocking threads.
            if self.dispatcher.in_callback() || Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.shutdown_timeout);
            }
        }
        info!("Executor backend shut down");
    }
}

impl Drop for ExecutorBackend {
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

    struct Fixture {
        table: Arc<HandleTable>,
        dispatcher: Arc<Dispatcher>,
        count: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let table = Arc::new(HandleTable::new());
            let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&table)));
            Self {
                table,
                dispatcher,
                count: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn backend(&self) -> ExecutorBackend {
            let config = ExecutorConfig {
                worker_threads: 1,
                ..ExecutorConfig::default()
            };
            ExecutorBackend::new(&config, Arc::clone(&self.dispatcher)).unwrap()
        }

        fn timer(&self, interval_ms: u64) -> TimerHandle {
            let count = Arc::clone(&self.count);
            let callback: Callback = Arc::new(move |_: &TimerContext| {
                count.fetch_add(1, Ordering::SeqCst);
            });
            self.table.allocate(interval_ms, callback).unwrap().handle()
        }

        fn ticks(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_schedule_and_cancel() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let handle = fixture.timer(10);

        let token = backend.schedule(handle, Duration::from_millis(10)).unwrap();
        sleep(Duration::from_millis(120));
        assert!(fixture.ticks() >= 3, "only {} ticks", fixture.ticks());

        backend.cancel(token);
        backend.cancel(token);
        sleep(Duration::from_millis(30));
        let after_cancel = fixture.ticks();
        sleep(Duration::from_millis(60));
        assert_eq!(fixture.ticks(), after_cancel);
    }

    #[test]
    fn test_reschedule_in_place() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let handle = fixture.timer(1000);

        let token = backend.schedule(handle, Duration::from_secs(1)).unwrap();
        backend.reschedule(token, Duration::from_millis(10)).unwrap();
        sleep(Duration::from_millis(150));
        assert!(fixture.ticks() >= 3, "only {} ticks", fixture.ticks());

        backend.cancel(token);
        assert!(matches!(
            backend.reschedule(token, Duration::from_millis(10)),
            Err(TimerError::NotFound)
        ));
    }

    #[test]
    fn test_schedule_after_shutdown_is_refused() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        backend.shutdown();
        backend.shutdown();

        let handle = fixture.timer(10);
        assert!(matches!(
            backend.schedule(handle, Duration::from_millis(10)),
            Err(TimerError::QueueShutdown)
        ));
    }

    #[test]
    fn test_callback_threads_are_capped() {
        let fixture = Fixture::new();
        let config = ExecutorConfig {
            worker_threads: 2,
            callback_threads: 2,
            shutdown_timeout: Duration::from_secs(1),
        };
        let backend = ExecutorBackend::new(&config, Arc::clone(&fixture.dispatcher)).unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let callback: Callback = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Arc::new(move |_: &TimerContext| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
            })
        };
        let handle = fixture.table.allocate(1, callback).unwrap().handle();

        // A 1ms timer with a 50ms callback would otherwise pile up threads
        backend.schedule(handle, Duration::from_millis(1)).unwrap();
        sleep(Duration::from_millis(300));
        backend.shutdown();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak >= 1, "callback never ran");
        assert!(peak <= 2, "{peak} callbacks ran at once");
    }

    #[tokio::test]
    async fn test_shutdown_from_async_context() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let handle = fixture.timer(5);
        backend.schedule(handle, Duration::from_millis(5)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Dropping a runtime here would panic; shutdown must not.
        drop(backend);
    }
}
