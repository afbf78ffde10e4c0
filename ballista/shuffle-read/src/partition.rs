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

//! A finished sort-merge result partition and its readers.

use std::sync::Arc;

use log::info;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::buffer_pool::BufferPool;
use crate::config::ShuffleReadConfig;
use crate::error::{Result, ShuffleReadError};
use crate::executor::IoExecutor;
use crate::file::PartitionedFile;
use crate::scheduler::{ReadScheduler, ReadSchedulerState, SchedulerLock};
use crate::signal::CompletionSignal;
use crate::subpartition_reader::{AvailabilityListener, SortMergeSubpartitionReader};

/// Partition state guarded by the same lock as its read scheduler.
#[derive(Debug, Default)]
struct PartitionState {
    is_released: bool,
    scheduler: ReadSchedulerState,
}

impl SchedulerLock for Mutex<PartitionState> {
    fn lock_state(&self) -> MappedMutexGuard<'_, ReadSchedulerState> {
        MutexGuard::map(self.lock(), |state| &mut state.scheduler)
    }
}

/// A result partition written to a [`PartitionedFile`] and served to
/// downstream consumers, one reader per subpartition request.
///
/// Releasing the partition fails all readers and deletes the files once the
/// read scheduler has drained.
#[derive(Debug)]
pub struct SortMergeResultPartition {
    partition_id: String,
    file: PartitionedFile,
    state: Arc<Mutex<PartitionState>>,
    scheduler: ReadScheduler<Mutex<PartitionState>>,
    release_signal: CompletionSignal,
}

impl SortMergeResultPartition {
    /// Creates a partition serving `file`, reading with buffers of
    /// `buffer_pool` on `io_executor`.
    pub fn new(
        partition_id: impl Into<String>,
        file: PartitionedFile,
        buffer_pool: Arc<dyn BufferPool>,
        io_executor: Arc<dyn IoExecutor>,
        config: &ShuffleReadConfig,
    ) -> Self {
        let state = Arc::new(Mutex::new(PartitionState::default()));
        let scheduler = ReadScheduler::with_timeout(
            file.num_subpartitions(),
            buffer_pool,
            io_executor,
            state.clone(),
            config.buffer_request_timeout,
        );
        Self {
            partition_id: partition_id.into(),
            file,
            state,
            scheduler,
            release_signal: CompletionSignal::new(),
        }
    }

    /// Creates a reader of `subpartition`. `listener` is notified whenever
    /// the reader has new data or failed.
    pub fn create_subpartition_view(
        &self,
        subpartition: usize,
        listener: Arc<dyn AvailabilityListener>,
    ) -> Result<Arc<SortMergeSubpartitionReader>> {
        if self.state.lock().is_released {
            return Err(ShuffleReadError::AlreadyReleased(format!(
                "Result partition {} has been already released",
                self.partition_id
            )));
        }
        self.scheduler
            .create_subpartition_reader(listener, subpartition, &self.file)
    }

    /// Releases the partition. The returned signal completes after all
    /// readers have been removed and the files deleted.
    pub fn release(&self) -> CompletionSignal {
        let pending = {
            let mut state = self.state.lock();
            if state.is_released {
                return self.release_signal.clone();
            }
            state.is_released = true;
            self.scheduler.release_locked(&mut state.scheduler)
        };
        info!("Releasing result partition {}", self.partition_id);

        let file = self.file.clone();
        let signal = self.release_signal.clone();
        self.scheduler.finish_release(pending).on_complete(move || {
            file.delete_quietly();
            signal.complete();
        });
        self.release_signal.clone()
    }

    /// Returns true once the partition was released.
    pub fn is_released(&self) -> bool {
        self.state.lock().is_released
    }

    /// Identifier of this partition, used in logs and errors.
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Number of subpartitions in the partition file.
    pub fn num_subpartitions(&self) -> usize {
        self.file.num_subpartitions()
    }

    /// The files backing this partition.
    pub fn file(&self) -> &PartitionedFile {
        &self.file
    }

    /// Number of readers not yet removed by the read scheduler.
    pub fn num_pending_readers(&self) -> usize {
        self.scheduler.num_pending_readers()
    }
}
