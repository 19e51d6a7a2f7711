//! tests/common/harness.rs
use kestrel_timer_queue::{BackendKind, Config, TimerContext, TimerQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "kestrel_timer_queue=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// Every backend available on this target.
pub fn backends() -> Vec<BackendKind> {
    let mut kinds = vec![BackendKind::Executor];
    if cfg!(target_os = "linux") {
        kinds.push(BackendKind::SelfHosted);
    }
    kinds
}

/// Builds a queue over the given backend with two workers (two callback threads).
pub fn queue_for(kind: BackendKind) -> TimerQueue {
    init_tracing();
    let mut config = Config {
        backend: kind,
        ..Config::default()
    };
    config.scheduler.worker_threads = 2;
    config.executor.worker_threads = 2;
    config.executor.callback_threads = 2;
    TimerQueue::with_config(config).unwrap()
}

/// Records the instant of every tick delivered to it.
#[derive(Clone, Default)]
pub struct TickLog {
    ticks: Arc<Mutex<Vec<Instant>>>,
    count: Arc<AtomicUsize>,
}

impl TickLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&TimerContext) + Send + Sync + 'static {
        let log = self.clone();
        move |_: &TimerContext| {
            log.ticks.lock().unwrap().push(Instant::now());
            log.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn instants(&self) -> Vec<Instant> {
        self.ticks.lock().unwrap().clone()
    }

    /// Gaps between consecutive ticks recorded after `since`.
    pub fn gaps_after(&self, since: Instant) -> Vec<Duration> {
        let ticks: Vec<Instant> = self
            .instants()
            .into_iter()
            .filter(|tick| *tick >= since)
            .collect();
        ticks.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
