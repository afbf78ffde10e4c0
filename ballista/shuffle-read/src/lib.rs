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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Process-wide pool of read buffers shared by all partitions.
pub mod buffer_pool;
/// Configuration options of the shuffle read path.
pub mod config;
/// Error types and result definitions for shuffle reads.
pub mod error;
/// Execution backends for read tasks.
pub mod executor;
/// On-disk layout of sort-merge partition files.
pub mod file;
/// Memory segments and pooled buffers handed to consumers.
pub mod memory;
/// Result partitions served to downstream consumers.
pub mod partition;
/// Offset-ordered read scheduling across subpartition readers.
pub mod scheduler;
/// One-shot completion signals.
pub mod signal;
/// Consumer side of a subpartition read.
pub mod subpartition_reader;

#[cfg(test)]
pub mod test_utils;

pub use buffer_pool::{BatchShuffleReadBufferPool, BufferPool, RequesterId};
pub use config::ShuffleReadConfig;
pub use error::{FailureCause, Result, ShuffleReadError};
pub use executor::{IoExecutor, IoTask, ManuallyTriggeredExecutor};
pub use file::{PartitionedFile, PartitionedFileWriter};
pub use memory::{Buffer, BufferKind, BufferRecycler, MemorySegment};
pub use partition::SortMergeResultPartition;
pub use scheduler::{ReadScheduler, ReadSchedulerState, SchedulerLock};
pub use signal::CompletionSignal;
pub use subpartition_reader::{
    AvailabilityListener, BufferAndBacklog, ReaderId, SortMergeSubpartitionReader,
};
