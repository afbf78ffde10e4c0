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

//! Reads the data of one subpartition out of a shared partitioned file.

use std::fs::File;
use std::sync::Arc;

use super::index::{num_regions, read_index_entry};
use super::{PartitionedFile, read_exact_at};
use crate::error::{Result, ShuffleReadError};
use crate::memory::MemorySegment;

/// Outcome of reading one chunk of a data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionChunk {
    /// Number of bytes written into the segment.
    pub len: usize,
    /// Whether this chunk completed the current data region.
    pub end_of_region: bool,
}

/// Reads one subpartition's data, region by region, into memory segments.
pub trait FileReader: Send {
    /// Reads the next chunk of the current data region into `segment`.
    ///
    /// Must only be called while [`has_remaining`](Self::has_remaining).
    fn read_current_region(&mut self, segment: &mut MemorySegment) -> Result<RegionChunk>;

    /// Returns true if there is data left to read.
    fn has_remaining(&self) -> bool;

    /// File offset of the next byte to read, `u64::MAX` if none is left.
    fn next_offset(&self) -> u64;
}

/// [`FileReader`] over the sort-merge file layout.
///
/// All readers of a partition share the same open data and index channels.
/// Reads are positional, so the channels carry no per-reader cursor.
#[derive(Debug)]
pub struct PartitionedFileReader {
    data_channel: Arc<File>,
    index_channel: Arc<File>,
    subpartition: usize,
    num_subpartitions: usize,
    num_regions: usize,
    /// Next region whose index entry has not been loaded yet.
    next_region: usize,
    current_offset: u64,
    region_remaining: u64,
}

impl PartitionedFileReader {
    /// Creates a reader of `subpartition` and positions it at the first
    /// non-empty region.
    pub fn try_new(
        file: &PartitionedFile,
        subpartition: usize,
        data_channel: Arc<File>,
        index_channel: Arc<File>,
    ) -> Result<Self> {
        let num_subpartitions = file.num_subpartitions();
        if subpartition >= num_subpartitions {
            return Err(ShuffleReadError::General(format!(
                "Subpartition {subpartition} not found in partitioned file (max: {num_subpartitions})"
            )));
        }

        let num_regions = num_regions(&index_channel, num_subpartitions)?;
        let mut reader = Self {
            data_channel,
            index_channel,
            subpartition,
            num_subpartitions,
            num_regions,
            next_region: 0,
            current_offset: 0,
            region_remaining: 0,
        };
        reader.load_next_region()?;
        Ok(reader)
    }

    /// Returns the subpartition this reader reads.
    pub fn subpartition(&self) -> usize {
        self.subpartition
    }

    fn load_next_region(&mut self) -> Result<()> {
        while self.next_region < self.num_regions {
            let entry = read_index_entry(
                &self.index_channel,
                self.num_subpartitions,
                self.next_region,
                self.subpartition,
            )?;
            self.next_region += 1;
            if entry.length > 0 {
                self.current_offset = entry.offset;
                self.region_remaining = entry.length;
                return Ok(());
            }
        }
        self.region_remaining = 0;
        Ok(())
    }
}

impl FileReader for PartitionedFileReader {
    fn read_current_region(&mut self, segment: &mut MemorySegment) -> Result<RegionChunk> {
        if self.region_remaining == 0 {
            return Ok(RegionChunk {
                len: 0,
                end_of_region: true,
            });
        }

        let len = (segment.size() as u64).min(self.region_remaining) as usize;
        read_exact_at(
            &self.data_channel,
            &mut segment.as_mut_slice()[..len],
            self.current_offset,
        )?;
        self.current_offset += len as u64;
        self.region_remaining -= len as u64;

        let end_of_region = self.region_remaining == 0;
        if end_of_region {
            self.load_next_region()?;
        }
        Ok(RegionChunk { len, end_of_region })
    }

    fn has_remaining(&self) -> bool {
        self.region_remaining > 0
    }

    fn next_offset(&self) -> u64 {
        if self.has_remaining() {
            self.current_offset
        } else {
            u64::MAX
        }
    }
}
