// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Process-wide pool of read buffers shared by all sort-merge read schedulers.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, ShuffleReadError};
use crate::memory::MemorySegment;

/// Number of bytes a requester should get per buffer request.
pub const NUM_BYTES_PER_REQUEST: usize = 8 * 1024 * 1024;

/// Identifies a requester of the pool for fairness accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequesterId(u64);

impl RequesterId {
    /// Returns a process-unique requester id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        RequesterId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A bounded pool of read buffers shared by many requesters.
pub trait BufferPool: Send + Sync + Debug {
    /// Requests a batch of [`buffers_per_request`](Self::buffers_per_request)
    /// segments. May wait a bounded time for recycled segments and returns an
    /// empty batch if not enough became available.
    fn request_buffers(&self) -> Result<Vec<MemorySegment>>;

    /// Returns a single segment to the pool.
    fn recycle(&self, segment: MemorySegment);

    /// Returns a batch of segments to the pool.
    fn recycle_all(&self, segments: Vec<MemorySegment>);

    /// Registers an active requester.
    fn register_requester(&self, requester: RequesterId);

    /// Unregisters a requester which no longer reads data.
    fn unregister_requester(&self, requester: RequesterId);

    /// Time of the last successful request or recycle.
    fn last_activity(&self) -> Instant;

    /// Number of buffers handed out by one successful request.
    fn buffers_per_request(&self) -> usize;

    /// Average number of buffers each registered requester should hold.
    fn average_buffers_per_requester(&self) -> usize;
}

/// Fixed-size [`BufferPool`] used for batch shuffle reads.
///
/// Memory is allocated lazily by the first request and is freed by
/// [`destroy`](BatchShuffleReadBufferPool::destroy).
#[derive(Debug)]
pub struct BatchShuffleReadBufferPool {
    total_bytes: usize,
    buffer_size: usize,
    num_total_buffers: usize,
    buffers_per_request: usize,
    request_wait: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Debug)]
struct PoolState {
    buffers: VecDeque<MemorySegment>,
    initialized: bool,
    destroyed: bool,
    requesters: HashSet<RequesterId>,
    last_activity: Instant,
}

impl BatchShuffleReadBufferPool {
    /// Creates a pool of `total_bytes` split into segments of `buffer_size`.
    ///
    /// `request_wait` bounds how long a single request waits for recycled
    /// segments before returning an empty batch.
    pub fn try_new(
        total_bytes: usize,
        buffer_size: usize,
        request_wait: Duration,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(ShuffleReadError::Configuration(
                "Buffer size must be positive".to_string(),
            ));
        }
        if total_bytes < buffer_size {
            return Err(ShuffleReadError::Configuration(format!(
                "Total shuffle read memory {total_bytes} must be at least one buffer of {buffer_size} bytes"
            )));
        }

        let num_total_buffers = total_bytes / buffer_size;
        let buffers_per_request =
            num_total_buffers.min((NUM_BYTES_PER_REQUEST / buffer_size).max(1));

        Ok(Self {
            total_bytes,
            buffer_size,
            num_total_buffers,
            buffers_per_request,
            request_wait,
            state: Mutex::new(PoolState {
                buffers: VecDeque::new(),
                initialized: false,
                destroyed: false,
                requesters: HashSet::new(),
                last_activity: Instant::now(),
            }),
            available: Condvar::new(),
        })
    }

    /// Total memory managed by this pool in bytes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Size of every segment handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of segments managed by this pool.
    pub fn num_total_buffers(&self) -> usize {
        self.num_total_buffers
    }

    /// Number of segments currently pooled and not handed out.
    pub fn available_buffers(&self) -> usize {
        let state = self.state.lock();
        if state.initialized {
            state.buffers.len()
        } else {
            self.num_total_buffers
        }
    }

    /// Number of currently registered requesters.
    pub fn num_requesters(&self) -> usize {
        self.state.lock().requesters.len()
    }

    /// Returns true once the pool has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Frees all pooled memory. Segments recycled afterwards are dropped and
    /// further requests fail.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.buffers.clear();
        self.available.notify_all();
        info!("Destroyed batch shuffle read buffer pool of {} bytes", self.total_bytes);
    }

    fn initialize(&self, state: &mut PoolState) {
        state.buffers = (0..self.num_total_buffers)
            .map(|_| MemorySegment::allocate(self.buffer_size))
            .collect();
        state.initialized = true;
        debug!(
            "Allocated {} read buffers of {} bytes",
            self.num_total_buffers, self.buffer_size
        );
    }

    fn already_destroyed() -> ShuffleReadError {
        ShuffleReadError::General("Buffer pool has been already destroyed".to_string())
    }
}

impl BufferPool for BatchShuffleReadBufferPool {
    fn request_buffers(&self) -> Result<Vec<MemorySegment>> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Self::already_destroyed());
        }
        if !state.initialized {
            self.initialize(&mut state);
        }

        let deadline = Instant::now() + self.request_wait;
        while state.buffers.len() < self.buffers_per_request {
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            self.available.wait_until(&mut state, deadline);
            if state.destroyed {
                return Err(Self::already_destroyed());
            }
        }

        let buffers = state
            .buffers
            .drain(..self.buffers_per_request)
            .collect::<Vec<_>>();
        state.last_activity = Instant::now();
        Ok(buffers)
    }

    fn recycle(&self, segment: MemorySegment) {
        self.recycle_all(vec![segment]);
    }

    fn recycle_all(&self, segments: Vec<MemorySegment>) {
        if segments.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.buffers.extend(segments);
        state.last_activity = Instant::now();
        if state.buffers.len() >= self.buffers_per_request {
            self.available.notify_all();
        }
    }

    fn register_requester(&self, requester: RequesterId) {
        self.state.lock().requesters.insert(requester);
    }

    fn unregister_requester(&self, requester: RequesterId) {
        self.state.lock().requesters.remove(&requester);
    }

    fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    fn buffers_per_request(&self) -> usize {
        self.buffers_per_request
    }

    fn average_buffers_per_requester(&self) -> usize {
        let num_requesters = self.state.lock().requesters.len().max(1);
        (self.num_total_buffers / num_requesters).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const KB: usize = 1024;

    fn create_pool(total_bytes: usize, buffer_size: usize) -> BatchShuffleReadBufferPool {
        BatchShuffleReadBufferPool::try_new(
            total_bytes,
            buffer_size,
            Duration::from_millis(20),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            BatchShuffleReadBufferPool::try_new(KB, 0, Duration::ZERO),
            Err(ShuffleReadError::Configuration(_))
        ));
        assert!(matches!(
            BatchShuffleReadBufferPool::try_new(KB, 2 * KB, Duration::ZERO),
            Err(ShuffleReadError::Configuration(_))
        ));
    }

    #[test]
    fn test_buffers_per_request() {
        // 8 MiB per request with 32 KiB buffers
        let pool = create_pool(64 * 1024 * KB, 32 * KB);
        assert_eq!(pool.num_total_buffers(), 2048);
        assert_eq!(pool.buffers_per_request(), 256);

        // capped by the total number of buffers
        let pool = create_pool(64 * KB, 32 * KB);
        assert_eq!(pool.buffers_per_request(), 2);

        // at least one buffer per request
        let pool = create_pool(32 * 1024 * KB, 16 * 1024 * KB);
        assert_eq!(pool.buffers_per_request(), 1);
    }

    #[test]
    fn test_lazy_initialization() {
        let pool = create_pool(64 * KB, 8 * KB);
        assert!(!pool.state.lock().initialized);
        assert_eq!(pool.available_buffers(), 8);

        let buffers = pool.request_buffers().unwrap();
        assert!(pool.state.lock().initialized);
        assert_eq!(buffers.len(), 8);
        assert!(buffers.iter().all(|b| b.size() == 8 * KB));
        assert_eq!(pool.available_buffers(), 0);
    }

    #[test]
    fn test_request_returns_empty_when_exhausted() {
        let pool = create_pool(64 * KB, 8 * KB);
        let buffers = pool.request_buffers().unwrap();
        assert_eq!(buffers.len(), 8);

        let started = Instant::now();
        assert!(pool.request_buffers().unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(20));

        pool.recycle_all(buffers);
        assert_eq!(pool.request_buffers().unwrap().len(), 8);
    }

    #[test]
    fn test_recycle_wakes_waiting_request() {
        let pool = Arc::new(
            BatchShuffleReadBufferPool::try_new(16 * KB, 8 * KB, Duration::from_secs(10))
                .unwrap(),
        );
        let buffers = pool.request_buffers().unwrap();
        assert_eq!(buffers.len(), 2);

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.request_buffers().unwrap().len())
        };
        std::thread::sleep(Duration::from_millis(20));
        for buffer in buffers {
            pool.recycle(buffer);
        }
        assert_eq!(waiter.join().unwrap(), 2);
    }

    #[test]
    fn test_last_activity_advances() {
        let pool = create_pool(64 * KB, 8 * KB);
        let initial = pool.last_activity();
        std::thread::sleep(Duration::from_millis(5));

        let buffers = pool.request_buffers().unwrap();
        let after_request = pool.last_activity();
        assert!(after_request > initial);

        std::thread::sleep(Duration::from_millis(5));
        pool.recycle_all(buffers);
        assert!(pool.last_activity() > after_request);
    }

    #[test]
    fn test_average_buffers_per_requester() {
        let pool = create_pool(64 * KB, 8 * KB);
        assert_eq!(pool.average_buffers_per_requester(), 8);

        let (a, b, c) = (RequesterId::next(), RequesterId::next(), RequesterId::next());
        pool.register_requester(a);
        pool.register_requester(b);
        assert_eq!(pool.num_requesters(), 2);
        assert_eq!(pool.average_buffers_per_requester(), 4);

        pool.register_requester(c);
        assert_eq!(pool.average_buffers_per_requester(), 2);

        pool.unregister_requester(a);
        pool.unregister_requester(b);
        pool.unregister_requester(c);
        assert_eq!(pool.average_buffers_per_requester(), 8);
    }

    #[test]
    fn test_destroy() {
        let pool = create_pool(64 * KB, 8 * KB);
        let buffers = pool.request_buffers().unwrap();
        pool.destroy();
        assert!(pool.is_destroyed());
        assert!(pool.request_buffers().is_err());

        // segments recycled after destruction are simply freed
        pool.recycle_all(buffers);
        assert_eq!(pool.state.lock().buffers.len(), 0);
    }
}
