use std::marker::PhantomData;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ConvError, Result};

// variation of a rwlock where each writer claims an arbitrary sub range
// of the output, claims must be pairwise disjoint while they are held.
// Tasks of one convolution call share a single lock and each takes the
// slice its task id maps to.

/// # RangeLock
/// Hands out non-overlapping mutable sub slices of one buffer to concurrent tasks.
pub struct RangeLock<'a, T> {
    ptr: *mut T,
    len: usize,
    held: Mutex<Vec<Range<usize>>>,
    _marker: PhantomData<&'a mut [T]>,
}

// guards only ever expose disjoint ranges
unsafe impl<'a, T: Send> Sync for RangeLock<'a, T> {}
unsafe impl<'a, T: Send> Send for RangeLock<'a, T> {}

pub struct RangeLockWriteGuard<'lock, 'a, T> {
    rlock: &'lock RangeLock<'a, T>,
    start: usize,
    end: usize,
}

impl<'lock, 'a, T> RangeLockWriteGuard<'lock, 'a, T> {
    /// The claimed sub slice
    pub fn get(&mut self) -> &mut [T] {
        // SAFETY: [start, end) is within bounds and not held by any other guard
        unsafe { std::slice::from_raw_parts_mut(self.rlock.ptr.add(self.start), self.end - self.start) }
    }

    /// Offset of the claimed slice within the whole buffer
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl<'lock, 'a, T> Drop for RangeLockWriteGuard<'lock, 'a, T> {
    fn drop(&mut self) {
        self.rlock.remove_write(self.start, self.end);
    }
}

impl<'a, T> RangeLock<'a, T> {
    pub fn from(data: &'a mut [T]) -> Self {
        RangeLock { ptr: data.as_mut_ptr(), len: data.len(), held: Mutex::new(Vec::new()), _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ranges(&self) -> MutexGuard<'_, Vec<Range<usize>>> {
        // a panicking task cannot leave the range list half updated
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims `start..end` for exclusive writing until the guard is dropped
    pub fn write(&self, start: usize, end: usize) -> Result<RangeLockWriteGuard<'_, 'a, T>> {
        if start > end || end > self.len {
            return Err(ConvError::BadRange { start, end, len: self.len });
        }
        let mut held = self.ranges();
        // number of held ranges is bounded by the number of tasks, linear scan is enough
        let conflict = start < end && held.iter().any(|r| r.start < end && start < r.end);
        if conflict {
            return Err(ConvError::RangeConflict { start, end });
        }
        held.push(start..end);
        Ok(RangeLockWriteGuard { rlock: self, start, end })
    }

    fn remove_write(&self, start: usize, end: usize) {
        let mut held = self.ranges();
        if let Some(pos) = held.iter().position(|r| r.start == start && r.end == end) {
            held.swap_remove(pos);
        }
    }
}
