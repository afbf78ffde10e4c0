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

//! Read scheduler of a sort-merge shuffle partition.
//!
//! One [`ReadScheduler`] serves every subpartition reader of a partition. It
//! reads data in order of file offset across all readers, which turns many
//! logical streams into an almost sequential scan of the shared data file,
//! and bounds the number of read buffers the partition holds from the
//! process-wide [`BufferPool`].
//!
//! All scheduler state lives in [`ReadSchedulerState`], guarded by a lock
//! supplied by the owner of the scheduler through [`SchedulerLock`]. This
//! lets the owning partition make its own state transitions atomic with the
//! scheduler's.
//!
//! Lock order is subpartition reader, then scheduler lock, then buffer pool.
//! Buffers are never dropped and reader callbacks never run while the
//! scheduler lock is held.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::buffer_pool::{BufferPool, RequesterId};
use crate::config::SHUFFLE_READ_MEMORY;
use crate::error::{FailureCause, Result, ShuffleReadError, fatal_error, panic_message};
use crate::executor::IoExecutor;
use crate::file::{FileReader, PartitionedFile, PartitionedFileReader, open_file_channel};
use crate::memory::{BufferRecycler, MemorySegment};
use crate::signal::CompletionSignal;
use crate::subpartition_reader::{
    AvailabilityListener, ReaderId, SortMergeSubpartitionReader,
};

/// Default maximum time to wait for read buffers from the buffer pool.
pub const DEFAULT_BUFFER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Provides exclusive access to the [`ReadSchedulerState`].
///
/// Implemented for `Mutex<ReadSchedulerState>`. Owners that need to guard
/// their own state with the same lock embed the scheduler state in their
/// struct and map the guard onto it.
pub trait SchedulerLock: Send + Sync + 'static {
    /// Locks the state, blocking until the lock is available.
    fn lock_state(&self) -> MappedMutexGuard<'_, ReadSchedulerState>;
}

impl SchedulerLock for Mutex<ReadSchedulerState> {
    fn lock_state(&self) -> MappedMutexGuard<'_, ReadSchedulerState> {
        MutexGuard::map(self.lock(), |state| state)
    }
}

/// Mutable state of a [`ReadScheduler`].
#[derive(Default)]
pub struct ReadSchedulerState {
    /// All registered readers.
    all_readers: HashMap<ReaderId, Arc<SortMergeSubpartitionReader>>,
    /// Readers to be removed because they failed or were released.
    failed_readers: HashSet<ReaderId>,
    /// Readers waiting for their next read step, by ascending file offset.
    sorted_readers: BinaryHeap<Reverse<(u64, ReaderId)>>,
    data_channel: Option<Arc<File>>,
    index_channel: Option<Arc<File>>,
    /// Whether a read task is running or submitted.
    is_running: bool,
    /// Buffers held by this scheduler's readers and not yet recycled. May
    /// drop below zero for a moment when readers recycle buffers before the
    /// read task has credited them.
    num_requested_buffers: isize,
    is_released: bool,
    release_signal: CompletionSignal,
}

impl ReadSchedulerState {
    /// Creates the state of a scheduler without readers.
    pub fn new() -> Self {
        Self::default()
    }

    fn open_file_channels(&mut self, file: &PartitionedFile) -> Result<()> {
        self.close_file_channels();
        self.data_channel = Some(Arc::new(open_file_channel(file.data_file_path())?));
        self.index_channel = Some(Arc::new(open_file_channel(file.index_file_path())?));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.is_released
    }

    fn close_file_channels(&mut self) {
        // readers keep their own handle clones until dropped, the last one
        // closes the file
        self.data_channel = None;
        self.index_channel = None;
    }

    fn push_sorted(&mut self, reader: &SortMergeSubpartitionReader) {
        self.sorted_readers
            .push(Reverse((reader.next_offset(), reader.id())));
    }
}

impl Debug for ReadSchedulerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSchedulerState")
            .field("all_readers", &self.all_readers.len())
            .field("failed_readers", &self.failed_readers.len())
            .field("sorted_readers", &self.sorted_readers.len())
            .field("channels_open", &self.data_channel.is_some())
            .field("is_running", &self.is_running)
            .field("num_requested_buffers", &self.num_requested_buffers)
            .field("is_released", &self.is_released)
            .finish()
    }
}

/// A release whose readers still have to be failed outside the lock.
#[must_use]
pub(crate) struct PendingRelease {
    signal: CompletionSignal,
    readers: Vec<Arc<SortMergeSubpartitionReader>>,
    /// Whether no reader was registered, so nothing is left to drain.
    drained: bool,
}

/// Schedules reads of all subpartition readers of one sort-merge partition.
///
/// Cheap to clone; all clones share the same scheduler.
pub struct ReadScheduler<L: SchedulerLock = Mutex<ReadSchedulerState>> {
    inner: Arc<SchedulerInner<L>>,
}

impl<L: SchedulerLock> Clone for ReadScheduler<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SchedulerInner<L: SchedulerLock> {
    requester_id: RequesterId,
    lock: Arc<L>,
    buffer_pool: Arc<dyn BufferPool>,
    io_executor: Arc<dyn IoExecutor>,
    /// Upper bound of `num_requested_buffers`.
    max_requested_buffers: usize,
    buffer_request_timeout: Duration,
    /// Serializes read task bodies in case a task is ever submitted twice.
    task_lock: Mutex<()>,
    weak_self: Weak<SchedulerInner<L>>,
}

impl<L: SchedulerLock> ReadScheduler<L> {
    /// Creates a scheduler with the default buffer request timeout.
    pub fn new(
        num_subpartitions: usize,
        buffer_pool: Arc<dyn BufferPool>,
        io_executor: Arc<dyn IoExecutor>,
        lock: Arc<L>,
    ) -> Self {
        Self::with_timeout(
            num_subpartitions,
            buffer_pool,
            io_executor,
            lock,
            DEFAULT_BUFFER_REQUEST_TIMEOUT,
        )
    }

    /// Creates a scheduler that fails its readers when no read buffer could
    /// be obtained for `buffer_request_timeout` while it held none.
    pub fn with_timeout(
        num_subpartitions: usize,
        buffer_pool: Arc<dyn BufferPool>,
        io_executor: Arc<dyn IoExecutor>,
        lock: Arc<L>,
        buffer_request_timeout: Duration,
    ) -> Self {
        // more subpartitions get more buffers, but at least four requests
        let max_requested_buffers =
            (4 * buffer_pool.buffers_per_request()).max(num_subpartitions);
        let inner = Arc::new_cyclic(|weak_self| SchedulerInner {
            requester_id: RequesterId::next(),
            lock,
            buffer_pool,
            io_executor,
            max_requested_buffers,
            buffer_request_timeout,
            task_lock: Mutex::new(()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Registers a reader of `subpartition` of `file`.
    ///
    /// The first reader opens the shared file channels and registers the
    /// scheduler with the buffer pool. Fails with
    /// [`ShuffleReadError::AlreadyReleased`] once the scheduler is released.
    pub fn create_subpartition_reader(
        &self,
        listener: Arc<dyn AvailabilityListener>,
        subpartition: usize,
        file: &PartitionedFile,
    ) -> Result<Arc<SortMergeSubpartitionReader>> {
        self.inner
            .create_subpartition_reader(listener, subpartition, file)
    }

    /// Releases the scheduler and fails all its readers.
    ///
    /// Returns a signal completed once all readers have been removed. A read
    /// task in flight finishes its current round first.
    pub fn release(&self) -> CompletionSignal {
        self.inner.release()
    }

    /// Upper bound of buffers this scheduler may hold.
    pub fn max_requested_buffers(&self) -> usize {
        self.inner.max_requested_buffers
    }

    /// Number of registered readers.
    pub fn num_pending_readers(&self) -> usize {
        self.inner.lock.lock_state().all_readers.len()
    }

    /// Number of buffers held by readers and not yet recycled.
    pub fn num_requested_buffers(&self) -> isize {
        self.inner.lock.lock_state().num_requested_buffers
    }

    /// Returns true while the shared data and index channels are open.
    pub fn has_open_channels(&self) -> bool {
        let state = self.inner.lock.lock_state();
        state.data_channel.is_some() && state.index_channel.is_some()
    }

    /// Returns true while a read task is running or submitted.
    pub fn is_running(&self) -> bool {
        self.inner.lock.lock_state().is_running
    }

    /// Returns true once [`release`](Self::release) was called.
    pub fn is_released(&self) -> bool {
        self.inner.lock.lock_state().is_released
    }

    /// Signal completed once the scheduler is released and drained.
    pub fn release_signal(&self) -> CompletionSignal {
        self.inner.lock.lock_state().release_signal.clone()
    }

    /// Releases the scheduler while the caller holds the scheduler lock.
    ///
    /// Lets an owner sharing the lock update its own state in the same
    /// critical section. The returned release must be finished with
    /// [`finish_release`](Self::finish_release) after unlocking.
    pub(crate) fn release_locked(&self, state: &mut ReadSchedulerState) -> PendingRelease {
        self.inner.release_locked(state)
    }

    /// Fails the readers of a release started by
    /// [`release_locked`](Self::release_locked). Must not hold the lock.
    pub(crate) fn finish_release(&self, pending: PendingRelease) -> CompletionSignal {
        self.inner.finish_release(pending)
    }
}

impl<L: SchedulerLock> Debug for ReadScheduler<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadScheduler")
            .field("requester_id", &self.inner.requester_id)
            .field("max_requested_buffers", &self.inner.max_requested_buffers)
            .field("state", &*self.inner.lock.lock_state())
            .finish()
    }
}

impl<L: SchedulerLock> SchedulerInner<L> {
    /// One read round: allocates buffers, serves readers by file offset
    /// until buffers or readers run out, then prunes finished and failed
    /// readers and possibly submits the next round.
    fn run(self: Arc<Self>) {
        let _task_guard = self.task_lock.lock();

        let mut finished_readers = Vec::new();
        let mut buffers = match self.allocate_buffers() {
            Ok(buffers) => buffers,
            Err(e) => {
                error!("Failed to request buffers for data reading: {e}");
                let readers = self.all_readers_for_failure();
                self.fail_subpartition_readers(readers, Arc::new(e));
                self.remove_finished_and_failed_readers(0, &finished_readers);
                return;
            }
        };
        let num_buffers_allocated = buffers.len();
        let recycler: Arc<dyn BufferRecycler> = self.clone();

        let mut next = self.add_previous_and_get_next_reader(None, !buffers.is_empty());
        while let Some(reader) = next {
            let read = catch_unwind(AssertUnwindSafe(|| {
                reader.read_buffers(&mut buffers, &recycler)
            }));
            let previous = match read {
                Ok(Ok(true)) => Some(reader),
                Ok(Ok(false)) => {
                    finished_readers.push(reader.id());
                    None
                }
                Ok(Err(e)) => {
                    error!("Failed to read shuffle data of {reader:?}: {e}");
                    self.fail_subpartition_readers(vec![reader], Arc::new(e));
                    None
                }
                Err(payload) => {
                    let e = ShuffleReadError::ConsumerReadFailure(panic_message(
                        payload.as_ref(),
                    ));
                    error!("Failed to read shuffle data of {reader:?}: {e}");
                    self.fail_subpartition_readers(vec![reader], Arc::new(e));
                    None
                }
            };
            next = self.add_previous_and_get_next_reader(previous, !buffers.is_empty());
        }

        let num_buffers_read = num_buffers_allocated - buffers.len();
        self.release_buffers(buffers);
        self.remove_finished_and_failed_readers(num_buffers_read, &finished_readers);
    }

    /// Requests buffers until the pool hands out a batch. Gives up once the
    /// pool saw no activity for the request timeout: with an empty batch if
    /// this scheduler still holds buffers, otherwise with an error.
    fn allocate_buffers(&self) -> Result<VecDeque<MemorySegment>> {
        let mut timeout_at = self.buffer_request_timeout_at();
        loop {
            let buffers = self.buffer_pool.request_buffers()?;
            if !buffers.is_empty() {
                return Ok(buffers.into());
            }
            if self.lock.lock_state().is_released {
                return Err(ShuffleReadError::AlreadyReleased(
                    "Result partition has been already released".to_string(),
                ));
            }
            // other requesters making progress move the deadline
            if Instant::now() >= timeout_at {
                timeout_at = self.buffer_request_timeout_at();
                if Instant::now() >= timeout_at {
                    break;
                }
            }
        }

        if self.lock.lock_state().num_requested_buffers <= 0 {
            return Err(ShuffleReadError::BufferRequestTimeout(format!(
                "This means there is a fierce contention of the shuffle read memory, \
                 please increase '{SHUFFLE_READ_MEMORY}'"
            )));
        }
        debug!(
            "Buffer request of read scheduler {:?} timed out while holding buffers",
            self.requester_id
        );
        Ok(VecDeque::new())
    }

    fn buffer_request_timeout_at(&self) -> Instant {
        self.buffer_pool.last_activity() + self.buffer_request_timeout
    }

    fn release_buffers(&self, buffers: VecDeque<MemorySegment>) {
        if buffers.is_empty() {
            return;
        }
        let buffers = Vec::from(buffers);
        if let Err(payload) =
            catch_unwind(AssertUnwindSafe(|| self.buffer_pool.recycle_all(buffers)))
        {
            fatal_error(ShuffleReadError::RecycleFailure(panic_message(
                payload.as_ref(),
            )));
        }
    }

    fn fail_subpartition_readers(
        &self,
        readers: Vec<Arc<SortMergeSubpartitionReader>>,
        cause: FailureCause,
    ) {
        {
            let mut state = self.lock.lock_state();
            state
                .failed_readers
                .extend(readers.iter().map(|reader| reader.id()));
        }

        for reader in readers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| reader.fail(cause.clone())))
            {
                fatal_error(ShuffleReadError::Internal(format!(
                    "Failed to fail {reader:?}: {}",
                    panic_message(payload.as_ref())
                )));
            }
        }
    }

    /// Readers to fail after the allocation of buffers failed. Empty once
    /// released, the release path fails them itself.
    fn all_readers_for_failure(&self) -> Vec<Arc<SortMergeSubpartitionReader>> {
        let state = self.lock.lock_state();
        if state.is_released {
            return Vec::new();
        }
        state.all_readers.values().cloned().collect()
    }

    fn remove_finished_and_failed_readers(
        &self,
        num_buffers_read: usize,
        finished_readers: &[ReaderId],
    ) {
        let mut removed = Vec::with_capacity(finished_readers.len());
        let released = {
            let mut state = self.lock.lock_state();
            for id in finished_readers {
                removed.extend(state.all_readers.remove(id));
            }
            let failed = std::mem::take(&mut state.failed_readers);
            for id in &failed {
                removed.extend(state.all_readers.remove(id));
            }

            if state.all_readers.is_empty() {
                self.buffer_pool.unregister_requester(self.requester_id);
                state.close_file_channels();
                state.sorted_readers.clear();
            }

            state.num_requested_buffers += num_buffers_read as isize;
            state.is_running = false;
            self.may_trigger_reading(&mut state);
            self.released_signal_to_complete(&state)
        };

        // dropping the last handle of a reader recycles its queued buffers
        drop(removed);
        if let Some(signal) = released {
            signal.complete();
        }
    }

    fn released_signal_to_complete(
        &self,
        state: &ReadSchedulerState,
    ) -> Option<CompletionSignal> {
        (state.is_released && state.all_readers.is_empty())
            .then(|| state.release_signal.clone())
    }

    /// Puts `previous` back in line and, if `poll_next`, takes the reader
    /// with the lowest pending file offset.
    fn add_previous_and_get_next_reader(
        &self,
        previous: Option<Arc<SortMergeSubpartitionReader>>,
        poll_next: bool,
    ) -> Option<Arc<SortMergeSubpartitionReader>> {
        let mut state = self.lock.lock_state();
        if let Some(previous) = previous
            && !state.failed_readers.contains(&previous.id())
        {
            state.push_sorted(&previous);
        }
        if !poll_next {
            return None;
        }
        while let Some(Reverse((_, id))) = state.sorted_readers.pop() {
            if state.failed_readers.contains(&id) {
                continue;
            }
            if let Some(reader) = state.all_readers.get(&id) {
                return Some(reader.clone());
            }
        }
        None
    }

    fn create_subpartition_reader(
        &self,
        listener: Arc<dyn AvailabilityListener>,
        subpartition: usize,
        file: &PartitionedFile,
    ) -> Result<Arc<SortMergeSubpartitionReader>> {
        let mut state = self.lock.lock_state();
        if state.is_released {
            return Err(ShuffleReadError::AlreadyReleased(
                "Partition is already released".to_string(),
            ));
        }

        let file_reader = Self::create_file_reader(&mut state, file, subpartition)?;
        if state.all_readers.is_empty() {
            info!(
                "Read scheduler {:?} started reading {:?}",
                self.requester_id,
                file.data_file_path()
            );
        }
        Ok(self.register_reader(&mut state, listener, Box::new(file_reader)))
    }

    fn register_reader(
        &self,
        state: &mut ReadSchedulerState,
        listener: Arc<dyn AvailabilityListener>,
        file_reader: Box<dyn FileReader>,
    ) -> Arc<SortMergeSubpartitionReader> {
        let reader = Arc::new(SortMergeSubpartitionReader::new(listener, file_reader));
        if state.all_readers.is_empty() {
            self.buffer_pool.register_requester(self.requester_id);
        }
        state.all_readers.insert(reader.id(), reader.clone());
        state.push_sorted(&reader);

        // nobody else can complete the signal of the fresh reader yet, so the
        // continuation cannot run inline while the lock is held
        let weak_self = self.weak_self.clone();
        let id = reader.id();
        reader.release_signal().on_complete(move || {
            if let Some(scheduler) = weak_self.upgrade() {
                scheduler.release_subpartition_reader(id);
            }
        });

        self.may_trigger_reading(state);
        reader
    }

    fn release_subpartition_reader(&self, id: ReaderId) {
        let mut state = self.lock.lock_state();
        if state.all_readers.contains_key(&id) {
            state.failed_readers.insert(id);
        }
    }

    fn create_file_reader(
        state: &mut ReadSchedulerState,
        file: &PartitionedFile,
        subpartition: usize,
    ) -> Result<PartitionedFileReader> {
        let first_reader = state.all_readers.is_empty();
        let result = Self::open_file_reader(state, file, subpartition, first_reader);
        if result.is_err() && first_reader {
            state.close_file_channels();
        }
        result
    }

    fn open_file_reader(
        state: &mut ReadSchedulerState,
        file: &PartitionedFile,
        subpartition: usize,
        first_reader: bool,
    ) -> Result<PartitionedFileReader> {
        if first_reader {
            state.open_file_channels(file)?;
        }
        match (&state.data_channel, &state.index_channel) {
            (Some(data), Some(index)) => {
                PartitionedFileReader::try_new(file, subpartition, data.clone(), index.clone())
            }
            _ => Err(ShuffleReadError::Internal(
                "File channels are closed while readers are registered".to_string(),
            )),
        }
    }

    /// Submits a read task if none is running, readers are waiting and this
    /// scheduler may take another batch of buffers from the pool.
    fn may_trigger_reading(&self, state: &mut ReadSchedulerState) {
        let buffers_per_request = self.buffer_pool.buffers_per_request() as isize;
        if !state.is_running
            && !state.all_readers.is_empty()
            && state.num_requested_buffers + buffers_per_request
                <= self.max_requested_buffers as isize
            && state.num_requested_buffers
                < self.buffer_pool.average_buffers_per_requester() as isize
        {
            let Some(this) = self.weak_self.upgrade() else {
                return;
            };
            state.is_running = true;
            self.io_executor.execute(Box::new(move || this.run()));
        }
    }

    fn release(&self) -> CompletionSignal {
        let pending = {
            let mut state = self.lock.lock_state();
            self.release_locked(&mut state)
        };
        self.finish_release(pending)
    }

    fn release_locked(&self, state: &mut ReadSchedulerState) -> PendingRelease {
        let signal = state.release_signal.clone();
        if state.is_released {
            return PendingRelease {
                signal,
                readers: Vec::new(),
                drained: false,
            };
        }
        state.is_released = true;
        info!("Releasing read scheduler {:?}", self.requester_id);

        let readers = state.all_readers.values().cloned().collect::<Vec<_>>();
        let ids = state.all_readers.keys().copied().collect::<Vec<_>>();
        state.failed_readers.extend(ids);
        // a round must run to prune the failed readers
        self.may_trigger_reading(state);
        PendingRelease {
            signal,
            readers,
            drained: state.all_readers.is_empty(),
        }
    }

    fn finish_release(&self, pending: PendingRelease) -> CompletionSignal {
        let PendingRelease {
            signal,
            readers,
            drained,
        } = pending;
        if drained {
            signal.complete();
        }
        self.fail_subpartition_readers(
            readers,
            Arc::new(ShuffleReadError::AlreadyReleased(
                "Result partition has been already released".to_string(),
            )),
        );
        signal
    }
}

impl<L: SchedulerLock> BufferRecycler for SchedulerInner<L> {
    fn recycle(&self, segment: MemorySegment) {
        let mut state = self.lock.lock_state();
        self.buffer_pool.recycle(segment);
        state.num_requested_buffers -= 1;
        self.may_trigger_reading(&mut state);
    }
}
