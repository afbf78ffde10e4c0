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

//! Consumer-side reader of one subpartition of a sort-merge partition.
//!
//! The read scheduler drives [`SortMergeSubpartitionReader::read_buffers`]
//! from its I/O task, while the downstream consumer pulls the read buffers
//! with [`SortMergeSubpartitionReader::next_buffer`] on its own thread.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::error::{FailureCause, Result, ShuffleReadError, panic_message};
use crate::file::FileReader;
use crate::memory::{Buffer, BufferRecycler, MemorySegment};
use crate::signal::CompletionSignal;

/// Identifies a subpartition reader within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(u64);

impl ReaderId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        ReaderId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Notified when a subpartition reader has new buffers or failed.
pub trait AvailabilityListener: Send + Sync {
    /// Called when data becomes available or the reader failed.
    fn notify_data_available(&self);
}

/// A buffer handed to the consumer together with the number of data
/// buffers still queued behind it.
#[derive(Debug)]
pub struct BufferAndBacklog {
    /// The next buffer of the subpartition.
    pub buffer: Buffer,
    /// Data buffers still queued after `buffer`.
    pub buffers_in_backlog: usize,
}

/// Reader of one subpartition, shared between the read scheduler and the
/// downstream consumer.
pub struct SortMergeSubpartitionReader {
    id: ReaderId,
    listener: Arc<dyn AvailabilityListener>,
    /// Mirrors the file reader's next offset so the scheduler can order
    /// readers without taking `inner`.
    next_offset: AtomicU64,
    release_signal: CompletionSignal,
    inner: Mutex<ReaderInner>,
}

struct ReaderInner {
    file_reader: Box<dyn FileReader>,
    buffers_read: VecDeque<Buffer>,
    data_buffers_in_backlog: usize,
    is_released: bool,
    failure_cause: Option<FailureCause>,
}

impl SortMergeSubpartitionReader {
    /// Creates a reader consuming `file_reader`.
    pub fn new(
        listener: Arc<dyn AvailabilityListener>,
        file_reader: Box<dyn FileReader>,
    ) -> Self {
        Self {
            id: ReaderId::next(),
            listener,
            next_offset: AtomicU64::new(file_reader.next_offset()),
            release_signal: CompletionSignal::new(),
            inner: Mutex::new(ReaderInner {
                file_reader,
                buffers_read: VecDeque::new(),
                data_buffers_in_backlog: 0,
                is_released: false,
                failure_cause: None,
            }),
        }
    }

    /// Returns the id of this reader.
    pub fn id(&self) -> ReaderId {
        self.id
    }

    /// File offset of the next byte this reader will read, `u64::MAX` once
    /// all data has been read. Used to serve readers in file order.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Signal completed when this reader is released or failed.
    pub fn release_signal(&self) -> &CompletionSignal {
        &self.release_signal
    }

    /// Reads the current data region of this subpartition into `buffers`.
    ///
    /// Stops at the end of the region or when `buffers` runs out; segments
    /// that were not filled stay in `buffers`. Returns whether more data
    /// remains to be read. When none remains an end-of-partition marker is
    /// queued after the data.
    pub fn read_buffers(
        &self,
        buffers: &mut VecDeque<MemorySegment>,
        recycler: &Arc<dyn BufferRecycler>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.is_released {
            return Err(ShuffleReadError::AlreadyReleased(
                "Subpartition reader has been already released".to_string(),
            ));
        }

        let was_empty = inner.buffers_read.is_empty();
        while inner.file_reader.has_remaining() {
            let Some(mut segment) = buffers.pop_front() else {
                break;
            };
            let read = catch_unwind(AssertUnwindSafe(|| {
                inner.file_reader.read_current_region(&mut segment)
            }));
            let chunk = match read {
                Ok(Ok(chunk)) => chunk,
                // the segment goes back to the batch so the pool gets it back
                Ok(Err(e)) => {
                    buffers.push_front(segment);
                    self.next_offset
                        .store(inner.file_reader.next_offset(), Ordering::Release);
                    return Err(e);
                }
                Err(payload) => {
                    buffers.push_front(segment);
                    return Err(ShuffleReadError::ConsumerReadFailure(panic_message(
                        payload.as_ref(),
                    )));
                }
            };
            inner
                .buffers_read
                .push_back(Buffer::new(segment, chunk.len, recycler.clone()));
            inner.data_buffers_in_backlog += 1;
            if chunk.end_of_region {
                break;
            }
        }

        let has_remaining = inner.file_reader.has_remaining();
        if !has_remaining {
            inner.buffers_read.push_back(Buffer::end_of_partition());
        }
        self.next_offset
            .store(inner.file_reader.next_offset(), Ordering::Release);
        let notify = was_empty && !inner.buffers_read.is_empty();
        drop(inner);

        if notify {
            self.listener.notify_data_available();
        }
        Ok(has_remaining)
    }

    /// Takes the next read buffer, if any.
    ///
    /// Returns the failure cause once this reader has failed.
    pub fn next_buffer(
        &self,
    ) -> std::result::Result<Option<BufferAndBacklog>, FailureCause> {
        let mut inner = self.inner.lock();
        if let Some(cause) = &inner.failure_cause {
            return Err(cause.clone());
        }
        let Some(buffer) = inner.buffers_read.pop_front() else {
            return Ok(None);
        };
        if buffer.is_data() {
            inner.data_buffers_in_backlog -= 1;
        }
        Ok(Some(BufferAndBacklog {
            buffer,
            buffers_in_backlog: inner.data_buffers_in_backlog,
        }))
    }

    /// Number of data buffers read and not yet taken by the consumer.
    pub fn unsynchronized_backlog(&self) -> usize {
        self.inner.lock().data_buffers_in_backlog
    }

    /// Returns true once this reader was released or failed.
    pub fn is_released(&self) -> bool {
        self.inner.lock().is_released
    }

    /// Returns the cause this reader failed with, if any.
    pub fn failure_cause(&self) -> Option<FailureCause> {
        self.inner.lock().failure_cause.clone()
    }

    /// Fails this reader: drops all queued buffers, notifies the consumer
    /// and completes the release signal.
    pub fn fail(&self, cause: FailureCause) {
        self.release_internal(Some(cause));
    }

    /// Releases this reader on behalf of its consumer.
    pub fn release_all_resources(&self) {
        self.release_internal(None);
    }

    fn release_internal(&self, cause: Option<FailureCause>) {
        let notify = cause.is_some();
        let released_buffers = {
            let mut inner = self.inner.lock();
            if inner.is_released {
                return;
            }
            inner.is_released = true;
            if let Some(cause) = cause {
                debug!("Subpartition reader {:?} failed: {cause}", self.id);
                inner.failure_cause = Some(cause);
            }
            inner.data_buffers_in_backlog = 0;
            std::mem::take(&mut inner.buffers_read)
        };
        // recycling takes the scheduler lock, never do it under `inner`
        drop(released_buffers);

        if notify {
            self.listener.notify_data_available();
        }
        self.release_signal.complete();
    }
}

impl Debug for SortMergeSubpartitionReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortMergeSubpartitionReader")
            .field("id", &self.id)
            .field("next_offset", &self.next_offset())
            .finish()
    }
}
