//! 定时器句柄与回调上下文
//! Timer handles and callback context
//!
//! 句柄的低 32 位是槽位索引，高 32 位是代数计数器。槽位被复用时代数递增，
//! 因此调用方持有的过期句柄永远不会解析到新的定时器。
//!
//! The low 32 bits of a handle are the slot index and the high 32 bits are a
//! generation counter. The generation is bumped whenever a slot is reused, so a
//! stale handle held by a caller never resolves to a newer timer.

use std::fmt;
use std::time::Duration;

/// 不透明的、带代数校验的定时器标识符
/// Opaque, generation-checked timer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// 由槽位索引和代数组装句柄
    /// Pack a slot index and generation into a handle
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// 槽位索引
    /// Slot index
    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// 代数计数器
    /// Generation counter
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// 原始 64 位表示
    /// Raw 64-bit representation
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// 从原始表示还原句柄，供原生适配器在回调数据中携带句柄使用
    /// Rebuild a handle from its raw form, for native adapters that carry it in callback data
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

/// 回调收到的触发定时器身份信息
/// Identity of the firing timer, passed to every callback invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerContext {
    /// 触发的定时器句柄
    /// Handle of the firing timer
    pub handle: TimerHandle,
    /// 触发时的当前间隔
    /// Interval in effect at dispatch time
    pub interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_packs_index_and_generation() {
        let handle = TimerHandle::new(7, 3);
        assert_eq!(handle.index(), 7);
        assert_eq!(handle.generation(), 3);
        assert_eq!(TimerHandle::from_raw(handle.to_raw()), handle);
        assert_eq!(handle.to_string(), "7v3");
    }

    #[test]
    fn test_same_index_different_generation_differs() {
        let old = TimerHandle::new(u32::MAX, 1);
        let new = TimerHandle::new(u32::MAX, 2);
        assert_ne!(old, new);
        assert_eq!(old.index(), new.index());
    }
}
