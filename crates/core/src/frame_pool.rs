// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pooled frame payload storage with live-buffer accounting.
//!
//! The pool is intentionally simple:
//! - fixed size buckets (by element count)
//! - bounded buffers per bucket
//! - [`FrameBuffer<T>`] returns its backing storage to the pool on drop
//!
//! Every buffer handed out also holds a lease on an [`AllocationCounter`]. A session owns
//! one counter for all of its payloads, so "zero buffers remain after destroy" is a plain
//! counter check.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Shared count of live frame buffers.
#[derive(Debug, Clone, Default)]
pub struct AllocationCounter {
    live: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl AllocationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Buffers ever allocated against this counter.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    fn lease(&self) -> BufferLease {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::AcqRel);
        BufferLease { live: self.live.clone() }
    }
}

/// Decrements the owning counter when dropped.
#[derive(Debug)]
struct BufferLease {
    live: Arc<AtomicUsize>,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub buckets: Vec<BucketStats>,
}

#[derive(Debug, Clone)]
pub struct BucketStats {
    pub bucket_size: usize,
    pub available: usize,
    pub max_per_bucket: usize,
}

#[derive(Clone)]
struct PoolHandle<T>(Weak<Mutex<PoolInner<T>>>);

struct PoolInner<T> {
    bucket_sizes: Vec<usize>,
    max_per_bucket: usize,
    buckets: Vec<Vec<Vec<T>>>,
    hits: u64,
    misses: u64,
}

impl<T> PoolInner<T> {
    fn bucket_index_for_min_len(&self, min_len: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&size| size >= min_len)
    }

    fn bucket_index_for_storage_len(&self, storage_len: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&size| size == storage_len)
    }
}

/// Thread-safe pool for `Vec<T>` payload buffers.
pub struct FramePool<T> {
    inner: Arc<Mutex<PoolInner<T>>>,
    counter: AllocationCounter,
}

impl<T> Clone for FramePool<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), counter: self.counter.clone() }
    }
}

impl<T> FramePool<T> {
    /// Create a pool with fixed buckets whose buffers are accounted against `counter`.
    ///
    /// `bucket_sizes` is sorted and deduplicated.
    pub fn with_buckets(
        mut bucket_sizes: Vec<usize>,
        max_per_bucket: usize,
        counter: AllocationCounter,
    ) -> Self {
        bucket_sizes.sort_unstable();
        bucket_sizes.dedup();
        let buckets = (0..bucket_sizes.len()).map(|_| Vec::new()).collect();
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                bucket_sizes,
                max_per_bucket,
                buckets,
                hits: 0,
                misses: 0,
            })),
            counter,
        }
    }

    fn handle(&self) -> PoolHandle<T> {
        PoolHandle(Arc::downgrade(&self.inner))
    }

    pub const fn counter(&self) -> &AllocationCounter {
        &self.counter
    }

    pub fn stats(&self) -> PoolStats {
        let Ok(guard) = self.inner.lock() else {
            return PoolStats { hits: 0, misses: 0, buckets: Vec::new() };
        };
        PoolStats {
            hits: guard.hits,
            misses: guard.misses,
            buckets: guard
                .bucket_sizes
                .iter()
                .enumerate()
                .map(|(idx, &bucket_size)| BucketStats {
                    bucket_size,
                    available: guard.buckets[idx].len(),
                    max_per_bucket: guard.max_per_bucket,
                })
                .collect(),
        }
    }

    /// Wrap an existing vector as an accounted, non-pooled buffer.
    pub fn adopt(&self, data: Vec<T>) -> FrameBuffer<T> {
        FrameBuffer::detached(data, &self.counter)
    }

    /// Drop every idle buffer held by the pool.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            for bucket in &mut guard.buckets {
                bucket.clear();
            }
        }
    }
}

impl<T: Clone + Default> FramePool<T> {
    /// Get accounted storage for at least `min_len` elements.
    ///
    /// If `min_len` doesn't fit in any bucket, returns a non-pooled buffer of exact size.
    pub fn get(&self, min_len: usize) -> FrameBuffer<T> {
        let (bucket_idx, bucket_size, maybe_buf) = {
            let Ok(mut guard) = self.inner.lock() else {
                return FrameBuffer::detached(vec![T::default(); min_len], &self.counter);
            };
            let Some(bucket_idx) = guard.bucket_index_for_min_len(min_len) else {
                guard.misses += 1;
                return FrameBuffer::detached(vec![T::default(); min_len], &self.counter);
            };
            let bucket_size = guard.bucket_sizes[bucket_idx];
            let buf = guard.buckets[bucket_idx].pop();
            if buf.is_some() {
                guard.hits += 1;
            } else {
                guard.misses += 1;
            }
            (bucket_idx, bucket_size, buf)
        };

        let data = maybe_buf.unwrap_or_else(|| vec![T::default(); bucket_size]);
        let len = min_len.min(data.len());
        FrameBuffer {
            data,
            len,
            pool: Some(self.handle()),
            bucket_idx: Some(bucket_idx),
            _lease: self.counter.lease(),
        }
    }

    /// Copy `src` into pooled storage.
    pub fn copy_from_slice(&self, src: &[T]) -> FrameBuffer<T> {
        let mut buf = self.get(src.len());
        buf.as_mut_slice().clone_from_slice(src);
        buf
    }
}

/// An accounted payload buffer with a logical length.
///
/// For pooled instances, `data.len()` is the bucket size and `len` is the logical slice length.
pub struct FrameBuffer<T> {
    data: Vec<T>,
    len: usize,
    pool: Option<PoolHandle<T>>,
    bucket_idx: Option<usize>,
    _lease: BufferLease,
}

impl<T: std::fmt::Debug> std::fmt::Debug for FrameBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.len)
            .field("storage_len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> FrameBuffer<T> {
    fn detached(data: Vec<T>, counter: &AllocationCounter) -> Self {
        let len = data.len();
        Self { data, len, pool: None, bucket_idx: None, _lease: counter.lease() }
    }

    /// Build a buffer accounted against its own throwaway counter.
    ///
    /// Meant for host-produced payloads (e.g. capture devices) that are not owned by a session.
    pub fn from_vec(data: Vec<T>) -> Self {
        Self::detached(data, &AllocationCounter::new())
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn storage_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data[..self.len]
    }

    /// Set the logical length (must be <= storage length).
    pub fn truncate(&mut self, new_len: usize) {
        self.len = new_len.min(self.data.len());
    }
}

impl<T: Clone> FrameBuffer<T> {
    /// Detached copy of the logical contents, e.g. for a snapshot handed to the host.
    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }
}

impl<T> Deref for FrameBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl<T> DerefMut for FrameBuffer<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl<T> Drop for FrameBuffer<T> {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else { return };
        let Some(bucket_idx) = self.bucket_idx.take() else { return };
        let Some(inner) = pool.0.upgrade() else { return };
        let Ok(mut guard) = inner.lock() else { return };

        // Only return buffers that match an existing bucket exactly.
        let Some(expected_bucket_idx) = guard.bucket_index_for_storage_len(self.data.len()) else {
            return;
        };
        if expected_bucket_idx != bucket_idx {
            return;
        }

        if guard.buckets[bucket_idx].len() >= guard.max_per_bucket {
            return;
        }

        guard.buckets[bucket_idx].push(std::mem::take(&mut self.data));
    }
}

pub type AudioBufferPool = FramePool<f32>;
pub type VideoBufferPool = FramePool<u8>;

/// 10 ms / 20 ms / 40 ms / 80 ms of stereo audio at 48 kHz.
pub const DEFAULT_AUDIO_BUCKET_SIZES: &[usize] = &[960, 1920, 3840, 7680];
pub const DEFAULT_AUDIO_BUFFERS_PER_BUCKET: usize = 32;

/// I420 at 360p / 720p / 1080p.
pub const DEFAULT_VIDEO_BUCKET_SIZES: &[usize] = &[345_600, 1_382_400, 3_110_400];
pub const DEFAULT_VIDEO_BUFFERS_PER_BUCKET: usize = 8;

impl FramePool<f32> {
    pub fn audio_default(counter: AllocationCounter) -> Self {
        Self::with_buckets(
            DEFAULT_AUDIO_BUCKET_SIZES.to_vec(),
            DEFAULT_AUDIO_BUFFERS_PER_BUCKET,
            counter,
        )
    }
}

impl FramePool<u8> {
    pub fn video_default(counter: AllocationCounter) -> Self {
        Self::with_buckets(
            DEFAULT_VIDEO_BUCKET_SIZES.to_vec(),
            DEFAULT_VIDEO_BUFFERS_PER_BUCKET,
            counter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_to_pool_on_drop() {
        let pool = FramePool::<u8>::with_buckets(vec![10], 1, AllocationCounter::new());
        {
            let mut buf = pool.get(5);
            assert_eq!(buf.len(), 5);
            assert_eq!(buf.storage_len(), 10);
            buf.as_mut_slice().fill(7);
        }
        assert_eq!(pool.stats().buckets[0].available, 1);

        let again = pool.get(8);
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(again.len(), 8);
    }

    #[test]
    fn counter_tracks_live_buffers() {
        let counter = AllocationCounter::new();
        let pool = FramePool::<f32>::audio_default(counter.clone());

        let a = pool.get(960);
        let b = pool.adopt(vec![0.0; 3]);
        let c = pool.get(100_000); // larger than every bucket
        assert_eq!(counter.live(), 3);

        drop(a);
        drop(b);
        assert_eq!(counter.live(), 1);
        drop(c);
        assert_eq!(counter.live(), 0);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn copy_from_slice_keeps_logical_len() {
        let pool = FramePool::<u8>::with_buckets(vec![4], 2, AllocationCounter::new());
        let buf = pool.copy_from_slice(&[1, 2, 3]);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
        assert_eq!(buf.to_vec(), vec![1, 2, 3]);
    }
}
