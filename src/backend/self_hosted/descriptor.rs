//! 定时器描述符来源（timerfd）
//! Timer descriptor source (timerfd)

use crate::handle::TimerHandle;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

/// 单调时钟上的非阻塞 timerfd
/// Non-blocking timerfd on the monotonic clock
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, the returned descriptor is checked before use.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// 以 `period` 为首次到期时间和重复间隔装配。重新装配会清零未读的到期计数。
    /// Arm with `period` as both the first expiry and the repeat interval.
    /// Re-arming resets the unread expiration count.
    pub fn arm_periodic(&self, period: Duration) -> io::Result<()> {
        let spec = timespec(period);
        let value = libc::itimerspec {
            it_interval: spec,
            it_value: spec,
        };
        // SAFETY: valid descriptor and a pointer to a live itimerspec.
        let rc = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &value, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// 读取并清零到期计数。计数已被其他线程读走时返回 `None`。
    /// Read and clear the expiration count. `None` if another thread already
    /// consumed it.
    pub fn read_expirations(&self) -> io::Result<Option<u64>> {
        let mut expirations: u64 = 0;
        // SAFETY: the buffer is exactly the 8 bytes timerfd writes.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(expirations))
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// 一个存活定时器的描述符，携带指向其所属槽位的反向引用
/// Descriptor of one live timer, carrying the back-reference to its owning slot
#[derive(Debug)]
pub struct Descriptor {
    pub timer: TimerFd,
    pub owner: TimerHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unarmed_timer_is_not_readable() {
        let timer = TimerFd::new().unwrap();
        assert_eq!(timer.read_expirations().unwrap(), None);
    }

    #[test]
    fn test_periodic_timer_counts_expirations() {
        let timer = TimerFd::new().unwrap();
        timer.arm_periodic(Duration::from_millis(10)).unwrap();
        assert_eq!(timer.read_expirations().unwrap(), None, "must not fire immediately");

        thread::sleep(Duration::from_millis(55));
        let count = timer.read_expirations().unwrap().unwrap();
        assert!(count >= 4, "expected several expirations, got {count}");
        // Reading cleared the counter
        assert_eq!(timer.read_expirations().unwrap(), None);
    }

    #[test]
    fn test_rearm_resets_pending_expirations() {
        let timer = TimerFd::new().unwrap();
        timer.arm_periodic(Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        timer.arm_periodic(Duration::from_secs(10)).unwrap();
        assert_eq!(timer.read_expirations().unwrap(), None);
    }
}
