#![deny(clippy::expect_used, clippy::unwrap_used)]

//! 跨平台定时器多路复用库的根。
//! The root of the cross-platform timer multiplexer library.
//!
//! 应用可以注册任意数量的毫秒级重复定时器，而无需为每个定时器创建一个操作系统
//! 线程。调度委托给一个在构造时选定的后端：Linux 上是基于 timerfd 与 epoll 的
//! 自托管调度器，其他平台上是定时线程池执行器。
//!
//! Applications register any number of repeating millisecond timers without one
//! OS thread per timer. Scheduling is delegated to a backend chosen at
//! construction: a self-hosted timerfd + epoll scheduler on Linux, a scheduled
//! thread-pool executor elsewhere.
//!
//! ```no_run
//! use kestrel_timer_queue::TimerQueue;
//! use std::time::Duration;
//!
//! let queue = TimerQueue::new()?;
//! let handle = queue.add(Duration::from_millis(100), |ctx| {
//!     println!("tick from {} every {:?}", ctx.handle, ctx.interval);
//! })?;
//! queue.set_interval(handle, Duration::from_millis(50))?;
//! queue.release(handle);
//! # Ok::<(), kestrel_timer_queue::TimerError>(())
//! ```

pub mod backend;
pub mod callback;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod queue;

mod table;

pub use backend::{Backend, BackendToken};
pub use callback::{NonOverlapping, channel_callback};
pub use config::{BackendKind, Config};
pub use dispatch::Dispatcher;
pub use error::{Result, TimerError};
pub use handle::{TimerContext, TimerHandle};
pub use queue::{QueueStats, TimerQueue};
pub use table::{Callback, TimerStatus};
