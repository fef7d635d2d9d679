//! Parallel iteration over slices, built on [`parallel_for`].

use crate::error::JobError;
use crate::parallel::parallel_for;
use crate::range::Range1D;
use crate::thread_pool::ThreadPool;

/// Grains per worker when no grain size is given.
const GRAINS_PER_WORKER: usize = 4;

struct UnsafeSlice<T> {
    ptr: *mut T,
    len: usize,
}

unsafe impl<T> Send for UnsafeSlice<T> {}
unsafe impl<T> Sync for UnsafeSlice<T> {}

impl<T> UnsafeSlice<T> {
    fn new(slice: &mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    /// Safety: the slice must outlive every use, and no two threads may
    /// access the same index at once.
    unsafe fn get_mut<'a>(&self, index: usize) -> &'a mut T {
        assert!(index < self.len);
        unsafe { &mut *self.ptr.add(index) }
    }

    /// Safety: the slice must outlive every use.
    unsafe fn get<'a>(&self, index: usize) -> &'a T {
        assert!(index < self.len);
        unsafe { &*self.ptr.add(index) }
    }
}

// Manual impl to avoid T: Clone/Copy bound
impl<T> Copy for UnsafeSlice<T> {}
impl<T> Clone for UnsafeSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

fn default_grain(len: usize, pool: &ThreadPool) -> usize {
    (len / (pool.num_workers() * GRAINS_PER_WORKER).max(1)).max(1)
}

pub trait ParallelSlice<T> {
    fn par_iter<'a>(&'a self, pool: &'a ThreadPool) -> ParallelIter<'a, T>;
}

pub trait ParallelSliceMut<T> {
    fn par_iter_mut<'a>(&'a mut self, pool: &'a ThreadPool) -> ParallelIterMut<'a, T>;
}

impl<T: Sync> ParallelSlice<T> for [T] {
    fn par_iter<'a>(&'a self, pool: &'a ThreadPool) -> ParallelIter<'a, T> {
        ParallelIter {
            slice: self,
            pool,
            grain: None,
        }
    }
}

impl<T: Send> ParallelSliceMut<T> for [T] {
    fn par_iter_mut<'a>(&'a mut self, pool: &'a ThreadPool) -> ParallelIterMut<'a, T> {
        ParallelIterMut {
            slice: self,
            pool,
            grain: None,
        }
    }
}

pub struct ParallelIter<'a, T> {
    slice: &'a [T],
    pool: &'a ThreadPool,
    grain: Option<usize>,
}

impl<T: Sync + 'static> ParallelIter<'_, T> {
    /// Number of consecutive elements handled by one task.
    pub fn grain_size(mut self, grain: usize) -> Self {
        self.grain = Some(grain.max(1));
        self
    }

    /// Calls `op` on every element and blocks until all calls returned.
    pub fn for_each<F>(self, op: F) -> Result<(), JobError>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let len = self.slice.len();
        let grain = self.grain.unwrap_or_else(|| default_grain(len, self.pool));
        // Only ever read through; the pointer is mutable to share the wrapper.
        let unsafe_slice = UnsafeSlice {
            ptr: self.slice.as_ptr() as *mut T,
            len,
        };

        parallel_for(self.pool, Range1D::new(0, len, grain), move |chunk: Range1D| {
            for i in chunk.indices() {
                // Safety: the job blocks until every grain finished, so the
                // borrowed slice outlives all reads.
                op(unsafe { unsafe_slice.get(i) });
            }
        })
    }
}

pub struct ParallelIterMut<'a, T> {
    slice: &'a mut [T],
    pool: &'a ThreadPool,
    grain: Option<usize>,
}

impl<T: Send + 'static> ParallelIterMut<'_, T> {
    /// Number of consecutive elements handled by one task.
    pub fn grain_size(mut self, grain: usize) -> Self {
        self.grain = Some(grain.max(1));
        self
    }

    /// Calls `op` on every element and blocks until all calls returned.
    pub fn for_each<F>(self, op: F) -> Result<(), JobError>
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        let len = self.slice.len();
        let grain = self.grain.unwrap_or_else(|| default_grain(len, self.pool));
        let unsafe_slice = UnsafeSlice::new(self.slice);

        parallel_for(self.pool, Range1D::new(0, len, grain), move |chunk: Range1D| {
            for i in chunk.indices() {
                // Safety: grains never overlap, so each index is touched by
                // exactly one task.
                op(unsafe { unsafe_slice.get_mut(i) });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_par_iter_mut_doubles() {
        let pool = ThreadPool::start(PoolConfig::with_threads(4)).unwrap();
        let mut data: Vec<usize> = (0..1001).collect();

        data.par_iter_mut(&pool).for_each(|x| *x *= 2).unwrap();

        assert!(data.iter().enumerate().all(|(i, &x)| x == i * 2));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_par_iter_reads_every_element() {
        let pool = ThreadPool::start(PoolConfig::with_threads(3)).unwrap();
        let data: Vec<usize> = (1..=100).collect();
        let sum = Arc::new(AtomicUsize::new(0));

        let s = sum.clone();
        data.par_iter(&pool)
            .grain_size(7)
            .for_each(move |x| {
                s.fetch_add(*x, Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(sum.load(Ordering::Relaxed), 5050);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_empty_slice() {
        let pool = ThreadPool::start(PoolConfig::with_threads(2)).unwrap();
        let mut data: Vec<u8> = Vec::new();
        data.par_iter_mut(&pool).for_each(|x| *x += 1).unwrap();
        pool.shutdown().unwrap();
    }
}
