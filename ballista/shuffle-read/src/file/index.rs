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

//! Index file of a sort-merge partitioned file.
//!
//! The data file is a sequence of data regions, each holding a contiguous
//! slice of every subpartition. The index stores, for every region and
//! subpartition, where that slice starts and how long it is. Format:
//!
//! ```text
//! region 0: [u64: offset_0][u64: length_0]...[u64: offset_n-1][u64: length_n-1]
//! region 1: ...
//! ```
//!
//! - All values are little-endian u64
//! - Each region has exactly one entry per subpartition
//! - Empty slices have length 0

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::read_exact_at;
use crate::error::{Result, ShuffleReadError};

/// Size in bytes of one index entry.
pub const INDEX_ENTRY_SIZE: u64 = 16;

/// Location of one subpartition's slice within one data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexEntry {
    /// Byte offset of the slice in the data file.
    pub offset: u64,
    /// Length of the slice in bytes.
    pub length: u64,
}

impl IndexEntry {
    fn to_le_bytes(self) -> [u8; INDEX_ENTRY_SIZE as usize] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    fn from_le_bytes(buf: &[u8; INDEX_ENTRY_SIZE as usize]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[..8]);
        let offset = u64::from_le_bytes(word);
        word.copy_from_slice(&buf[8..]);
        let length = u64::from_le_bytes(word);
        Self { offset, length }
    }
}

/// In-memory index mapping (region, subpartition) to data file slices.
#[derive(Debug, Clone)]
pub struct PartitionIndex {
    num_subpartitions: usize,
    /// Row-major by region: `entries[region * num_subpartitions + subpartition]`.
    entries: Vec<IndexEntry>,
}

impl PartitionIndex {
    /// Creates an index without regions.
    pub fn new(num_subpartitions: usize) -> Self {
        Self {
            num_subpartitions,
            entries: Vec::new(),
        }
    }

    /// Returns the number of subpartitions in this index.
    pub fn num_subpartitions(&self) -> usize {
        self.num_subpartitions
    }

    /// Returns the number of data regions in this index.
    pub fn num_regions(&self) -> usize {
        if self.num_subpartitions == 0 {
            0
        } else {
            self.entries.len() / self.num_subpartitions
        }
    }

    /// Appends a region with one entry per subpartition.
    pub fn add_region(&mut self, entries: &[IndexEntry]) -> Result<()> {
        if entries.len() != self.num_subpartitions {
            return Err(ShuffleReadError::Internal(format!(
                "Region has {} entries but the index has {} subpartitions",
                entries.len(),
                self.num_subpartitions
            )));
        }
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Returns the entry of `subpartition` in `region`.
    ///
    /// # Panics
    /// Panics if `region` or `subpartition` is out of bounds.
    pub fn entry(&self, region: usize, subpartition: usize) -> IndexEntry {
        assert!(subpartition < self.num_subpartitions);
        self.entries[region * self.num_subpartitions + subpartition]
    }

    /// Writes the index to a file.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            writer.write_all(&entry.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads an index of `num_subpartitions` subpartitions from a file.
    pub fn read_from_file(path: &Path, num_subpartitions: usize) -> Result<Self> {
        let file = File::open(path)?;
        let num_regions = num_regions(&file, num_subpartitions)?;
        let mut entries = Vec::with_capacity(num_regions * num_subpartitions);
        for region in 0..num_regions {
            for subpartition in 0..num_subpartitions {
                entries.push(read_index_entry(
                    &file,
                    num_subpartitions,
                    region,
                    subpartition,
                )?);
            }
        }
        Ok(Self {
            num_subpartitions,
            entries,
        })
    }
}

/// Returns the number of regions stored in an open index file.
pub fn num_regions(index_channel: &File, num_subpartitions: usize) -> Result<usize> {
    if num_subpartitions == 0 {
        return Err(ShuffleReadError::Internal(
            "Partitioned file must have at least one subpartition".to_string(),
        ));
    }
    let file_size = index_channel.metadata()?.len();
    let region_size = INDEX_ENTRY_SIZE * num_subpartitions as u64;
    if file_size % region_size != 0 {
        return Err(ShuffleReadError::General(format!(
            "Invalid index file size: {file_size} (must be multiple of {region_size})"
        )));
    }
    Ok((file_size / region_size) as usize)
}

/// Reads a single entry from an open index file without moving any cursor.
pub fn read_index_entry(
    index_channel: &File,
    num_subpartitions: usize,
    region: usize,
    subpartition: usize,
) -> Result<IndexEntry> {
    let position =
        (region * num_subpartitions + subpartition) as u64 * INDEX_ENTRY_SIZE;
    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
    read_exact_at(index_channel, &mut buf, position)?;
    Ok(IndexEntry::from_le_bytes(&buf))
}
