use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Distance from `base` forward to `seq` on the 256-entry sequence cycle.
pub(crate) fn seq_offset(base: u8, seq: u8) -> usize {
    seq.wrapping_sub(base) as usize
}

/// Whether `seq` falls in `[base, base + len)` modulo the sequence cycle.
///
/// Only meaningful for `len <= 128`: with a wider window an old duplicate and
/// a new segment would map onto the same offset.
pub(crate) fn in_window(base: u8, seq: u8, len: usize) -> bool {
    seq_offset(base, seq) < len
}

/// Lock a control block, recovering the guard if another thread panicked
/// while holding it. Every mutation leaves the block consistent between
/// statements, so the data behind a poisoned lock is still usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_wraps() {
        assert_eq!(seq_offset(250, 2), 8);
        assert_eq!(seq_offset(7, 7), 0);
        assert_eq!(seq_offset(8, 7), 255);
    }

    #[test]
    fn window_membership_across_wrap() {
        assert!(in_window(254, 254, 3));
        assert!(in_window(254, 0, 3));
        assert!(!in_window(254, 1, 3));
        assert!(!in_window(254, 253, 3));
    }
}
