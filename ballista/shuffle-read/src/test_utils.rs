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

//! Helpers shared by the unit tests of this crate.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer_pool::{BufferPool, RequesterId};
use crate::error::{FailureCause, Result};
use crate::file::{PartitionedFile, PartitionedFileWriter};
use crate::memory::{BufferRecycler, MemorySegment};
use crate::subpartition_reader::{AvailabilityListener, SortMergeSubpartitionReader};

/// Installs the test logger once per process. Later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Counts availability notifications.
#[derive(Debug, Default)]
pub struct CountingListener {
    count: AtomicUsize,
}

impl CountingListener {
    /// Number of notifications so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl AvailabilityListener for CountingListener {
    fn notify_data_available(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts and drops recycled segments.
#[derive(Debug, Default)]
pub struct CountingRecycler {
    count: AtomicUsize,
}

impl CountingRecycler {
    /// Number of segments recycled so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl BufferRecycler for CountingRecycler {
    fn recycle(&self, _segment: MemorySegment) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Deterministic content of `subpartition` in `region`.
pub fn region_data(subpartition: usize, region: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((subpartition * 31 + region * 7 + i) % 251) as u8)
        .collect()
}

/// Writes `num_regions` regions where every subpartition holds
/// `bytes_per_region` bytes generated by [`region_data`].
pub fn write_partitioned_file(
    dir: &Path,
    num_subpartitions: usize,
    num_regions: usize,
    bytes_per_region: usize,
) -> Result<PartitionedFile> {
    let mut writer = PartitionedFileWriter::try_new(&dir.join("partition"), num_subpartitions)?;
    for region in 0..num_regions {
        let slices = (0..num_subpartitions)
            .map(|sub| region_data(sub, region, bytes_per_region))
            .collect::<Vec<_>>();
        writer.write_region(&slices)?;
    }
    writer.finish()
}

/// Full expected content of `subpartition` of a file written by
/// [`write_partitioned_file`].
pub fn expected_subpartition_data(
    subpartition: usize,
    num_regions: usize,
    bytes_per_region: usize,
) -> Vec<u8> {
    (0..num_regions)
        .flat_map(|region| region_data(subpartition, region, bytes_per_region))
        .collect()
}

/// In-memory [`BufferPool`] with a freely chosen request size.
#[derive(Debug)]
pub struct TestBufferPool {
    buffers_per_request: usize,
    num_total_buffers: usize,
    state: Mutex<TestPoolState>,
}

#[derive(Debug)]
struct TestPoolState {
    buffers: Vec<MemorySegment>,
    requesters: HashSet<RequesterId>,
    last_activity: Instant,
    num_requests: usize,
}

impl TestBufferPool {
    /// Creates a pool of `num_buffers` segments of `buffer_size` bytes that
    /// hands them out `buffers_per_request` at a time.
    pub fn new(num_buffers: usize, buffers_per_request: usize, buffer_size: usize) -> Self {
        Self {
            buffers_per_request,
            num_total_buffers: num_buffers,
            state: Mutex::new(TestPoolState {
                buffers: (0..num_buffers)
                    .map(|_| MemorySegment::allocate(buffer_size))
                    .collect(),
                requesters: HashSet::new(),
                last_activity: Instant::now(),
                num_requests: 0,
            }),
        }
    }

    /// Segments currently in the pool.
    pub fn available_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Registered requesters.
    pub fn num_requesters(&self) -> usize {
        self.state.lock().requesters.len()
    }

    /// Number of successful requests.
    pub fn num_requests(&self) -> usize {
        self.state.lock().num_requests
    }

    /// Takes buffers out of the pool as another requester would.
    pub fn take_buffers(&self, num_buffers: usize) -> Vec<MemorySegment> {
        let mut state = self.state.lock();
        let split_at = state.buffers.len() - num_buffers;
        state.last_activity = Instant::now();
        state.buffers.split_off(split_at)
    }
}

impl BufferPool for TestBufferPool {
    fn request_buffers(&self) -> Result<Vec<MemorySegment>> {
        let mut state = self.state.lock();
        if state.buffers.len() < self.buffers_per_request {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Ok(Vec::new());
        }
        let split_at = state.buffers.len() - self.buffers_per_request;
        state.last_activity = Instant::now();
        state.num_requests += 1;
        Ok(state.buffers.split_off(split_at))
    }

    fn recycle(&self, segment: MemorySegment) {
        self.recycle_all(vec![segment]);
    }

    fn recycle_all(&self, segments: Vec<MemorySegment>) {
        let mut state = self.state.lock();
        state.buffers.extend(segments);
        state.last_activity = Instant::now();
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

/// Consumes `reader` until the end of its subpartition.
pub async fn read_to_end(
    reader: &SortMergeSubpartitionReader,
) -> std::result::Result<Vec<u8>, FailureCause> {
    let mut data = Vec::new();
    loop {
        match reader.next_buffer()? {
            Some(next) if next.buffer.is_data() => data.extend_from_slice(next.buffer.data()),
            Some(_) => return Ok(data),
            None => tokio::time::sleep(Duration::from_millis(1)).await,
        }
    }
}

/// Polls `cond` every `interval` until it holds or `iterations` passed.
pub async fn await_condition<F: Fn() -> bool>(
    interval: Duration,
    iterations: usize,
    cond: F,
) -> bool {
    let mut iteration = 0;

    while iteration < iterations {
        if cond() {
            return true;
        } else {
            iteration += 1;
            tokio::time::sleep(interval).await;
        }
    }

    false
}
