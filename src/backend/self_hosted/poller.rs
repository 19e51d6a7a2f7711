//! 就绪多路复用器（epoll）与控制通道（eventfd）
//! Readiness multiplexer (epoll) and control channel (eventfd)
//!
//! 定时器描述符以 `EPOLLIN | EPOLLONESHOT` 注册：一次就绪只唤醒一个工作线程，
//! 该线程读完描述符后用 `rearm` 重新启用它。控制 eventfd 以水平触发方式注册且
//! 从不被读取，因此一次 `wake_all` 会让所有工作线程持续醒来直到退出。
//!
//! Timer descriptors are registered `EPOLLIN | EPOLLONESHOT`: one readiness wakes
//! a single worker, which re-enables the descriptor with `rearm` after reading
//! it. The control eventfd is registered level-triggered and never read, so one
//! `wake_all` keeps waking every worker until they have all exited.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// 控制通道在 epoll 中的数据值
/// epoll data value of the control channel
pub const CONTROL_TOKEN: u64 = 0;

/// 一次等待返回的就绪事件缓冲区
/// Buffer of ready events filled by one wait
pub struct Events {
    buf: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// 就绪描述符的注册令牌
    /// Registration tokens of the ready descriptors
    pub fn tokens(&self) -> impl Iterator<Item = u64> + '_ {
        self.buf.iter().map(|event| event.u64)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// epoll 实例加上用于关闭唤醒的 eventfd
/// An epoll instance plus the eventfd used for shutdown wake-ups
#[derive(Debug)]
pub struct Poller {
    epoll: OwnedFd,
    control: OwnedFd,
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscalls, results are checked before being wrapped.
        let epoll = unsafe { OwnedFd::from_raw_fd(cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
        let control = unsafe {
            OwnedFd::from_raw_fd(cvt(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?)
        };

        let poller = Self { epoll, control };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.control.as_raw_fd(),
            libc::EPOLLIN as u32,
            CONTROL_TOKEN,
        )?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        // SAFETY: both descriptors are valid and `event` outlives the call.
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    /// 注册定时器描述符
    /// Register a timer descriptor
    pub fn register(&self, fd: RawFd, token: u64) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            token,
        )
    }

    /// 读完描述符后重新启用它
    /// Re-enable a descriptor after it has been read
    pub fn rearm(&self, fd: RawFd, token: u64) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            token,
        )
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// 阻塞直到至少一个描述符就绪
    /// Block until at least one descriptor is ready
    pub fn wait(&self, events: &mut Events) -> io::Result<usize> {
        events.buf.clear();
        let capacity = events.buf.capacity().min(libc::c_int::MAX as usize) as libc::c_int;
        // SAFETY: the kernel writes at most `capacity` events into the buffer.
        let n = cvt(unsafe {
            libc::epoll_wait(self.epoll.as_raw_fd(), events.buf.as_mut_ptr(), capacity, -1)
        })?;
        // SAFETY: the first `n` entries were initialized by epoll_wait.
        unsafe { events.buf.set_len(n as usize) };
        Ok(n as usize)
    }

    /// 唤醒所有阻塞在 `wait` 上的线程
    /// Wake every thread blocked in `wait`
    pub fn wake_all(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: eventfd accepts exactly one 8-byte counter increment.
        let n = unsafe {
            libc::write(
                self.control.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: the control channel is already signalled.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::self_hosted::descriptor::TimerFd;
    use std::time::{Duration, Instant};

    #[test]
    fn test_wait_reports_ready_timer() {
        let poller = Poller::new().unwrap();
        let timer = TimerFd::new().unwrap();
        let started = Instant::now();
        timer.arm_periodic(Duration::from_millis(20)).unwrap();
        poller.register(timer.as_raw_fd(), 42).unwrap();

        let mut events = Events::with_capacity(8);
        let n = poller.wait(&mut events).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events.tokens().collect::<Vec<_>>(), vec![42]);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wake_all_reports_control_token() {
        let poller = Poller::new().unwrap();
        poller.wake_all().unwrap();

        // Level-triggered: every wait keeps seeing the control channel
        let mut events = Events::with_capacity(4);
        for _ in 0..2 {
            poller.wait(&mut events).unwrap();
            assert!(events.tokens().any(|token| token == CONTROL_TOKEN));
        }
    }

    #[test]
    fn test_oneshot_needs_rearm() {
        let poller = Poller::new().unwrap();
        let timer = TimerFd::new().unwrap();
        timer.arm_periodic(Duration::from_millis(5)).unwrap();
        poller.register(timer.as_raw_fd(), 7).unwrap();

        let mut events = Events::with_capacity(4);
        poller.wait(&mut events).unwrap();
        timer.read_expirations().unwrap();

        // Without a rearm only the control channel can wake us
        std::thread::sleep(Duration::from_millis(20));
        poller.wake_all().unwrap();
        poller.wait(&mut events).unwrap();
        assert!(events.tokens().all(|token| token == CONTROL_TOKEN));

        poller.rearm(timer.as_raw_fd(), 7).unwrap();
        poller.wait(&mut events).unwrap();
        assert!(events.tokens().any(|token| token == 7));
    }
}
