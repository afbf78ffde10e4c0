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

//! Fixed-size read buffers handed out by the shuffle read buffer pool.
//!
//! A [`MemorySegment`] is a plain block of memory owned by whoever holds it.
//! Once filled with shuffle data it is wrapped into a [`Buffer`], which
//! returns the segment to its [`BufferRecycler`] when dropped.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// A fixed-capacity block of memory drawn from a buffer pool.
pub struct MemorySegment {
    data: Box<[u8]>,
}

impl MemorySegment {
    /// Allocates a new zeroed segment of `size` bytes.
    pub fn allocate(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Returns the capacity of this segment in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the whole segment.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the whole segment for writing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Debug for MemorySegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySegment")
            .field("size", &self.data.len())
            .finish()
    }
}

/// Takes back memory segments once their content has been consumed.
pub trait BufferRecycler: Send + Sync {
    /// Returns a single segment.
    fn recycle(&self, segment: MemorySegment);
}

/// Kind of a [`Buffer`] queued for a downstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Shuffle data read from the partitioned file.
    Data,
    /// Marks the end of a subpartition. Carries no memory segment.
    EndOfPartition,
}

/// A memory segment filled with shuffle data, or an end-of-partition marker.
///
/// Dropping a data buffer hands its segment back to the recycler it was
/// created with, exactly once.
pub struct Buffer {
    kind: BufferKind,
    segment: Option<MemorySegment>,
    size: usize,
    recycler: Option<Arc<dyn BufferRecycler>>,
}

impl Buffer {
    /// Wraps the first `size` bytes of `segment` as a data buffer.
    pub fn new(
        segment: MemorySegment,
        size: usize,
        recycler: Arc<dyn BufferRecycler>,
    ) -> Self {
        debug_assert!(size <= segment.size());
        Self {
            kind: BufferKind::Data,
            segment: Some(segment),
            size,
            recycler: Some(recycler),
        }
    }

    /// Creates the marker queued after the last data buffer of a subpartition.
    pub fn end_of_partition() -> Self {
        Self {
            kind: BufferKind::EndOfPartition,
            segment: None,
            size: 0,
            recycler: None,
        }
    }

    /// Returns the kind of this buffer.
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Returns true if this buffer carries shuffle data.
    pub fn is_data(&self) -> bool {
        self.kind == BufferKind::Data
    }

    /// Returns the number of valid bytes in this buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the valid bytes of this buffer.
    pub fn data(&self) -> &[u8] {
        match &self.segment {
            Some(segment) => &segment.as_slice()[..self.size],
            None => &[],
        }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let (Some(segment), Some(recycler)) = (self.segment.take(), self.recycler.take())
        {
            recycler.recycle(segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingRecycler {
        recycled: Mutex<Vec<usize>>,
    }

    impl BufferRecycler for CollectingRecycler {
        fn recycle(&self, segment: MemorySegment) {
            self.recycled.lock().push(segment.size());
        }
    }

    #[test]
    fn test_segment_allocate() {
        let mut segment = MemorySegment::allocate(16);
        assert_eq!(segment.size(), 16);
        segment.as_mut_slice()[..3].copy_from_slice(b"abc");
        assert_eq!(&segment.as_slice()[..3], b"abc");
    }

    #[test]
    fn test_buffer_recycled_once_on_drop() {
        let recycler = Arc::new(CollectingRecycler::default());
        let mut segment = MemorySegment::allocate(8);
        segment.as_mut_slice()[..2].copy_from_slice(b"hi");

        let buffer = Buffer::new(segment, 2, recycler.clone());
        assert!(buffer.is_data());
        assert_eq!(buffer.data(), b"hi");
        assert!(recycler.recycled.lock().is_empty());

        drop(buffer);
        assert_eq!(*recycler.recycled.lock(), vec![8]);
    }

    #[test]
    fn test_end_of_partition_has_no_segment() {
        let buffer = Buffer::end_of_partition();
        assert_eq!(buffer.kind(), BufferKind::EndOfPartition);
        assert!(!buffer.is_data());
        assert_eq!(buffer.size(), 0);
        assert!(buffer.data().is_empty());
    }
}
