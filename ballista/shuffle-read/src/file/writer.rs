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

//! Writer producing sort-merge partitioned files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;

use super::{IndexEntry, PartitionIndex, PartitionedFile, data_file_path, index_file_path};
use crate::error::{Result, ShuffleReadError};

/// Writes data regions into a data file and records them in an index.
///
/// Each call to [`write_region`](PartitionedFileWriter::write_region) appends
/// one region holding a slice of every subpartition, in subpartition order.
#[derive(Debug)]
pub struct PartitionedFileWriter {
    file: PartitionedFile,
    data: BufWriter<File>,
    index: PartitionIndex,
    bytes_written: u64,
}

impl PartitionedFileWriter {
    /// Creates the data file under `base_path` plus the standard suffix.
    pub fn try_new(base_path: &Path, num_subpartitions: usize) -> Result<Self> {
        if num_subpartitions == 0 {
            return Err(ShuffleReadError::Configuration(
                "Partitioned file must have at least one subpartition".to_string(),
            ));
        }
        let file = PartitionedFile::new(
            data_file_path(base_path),
            index_file_path(base_path),
            num_subpartitions,
        );
        let data = BufWriter::new(File::create(file.data_file_path())?);
        Ok(Self {
            file,
            data,
            index: PartitionIndex::new(num_subpartitions),
            bytes_written: 0,
        })
    }

    /// Appends one region. `slices[i]` is the data of subpartition `i` and
    /// may be empty.
    pub fn write_region<B: AsRef<[u8]>>(&mut self, slices: &[B]) -> Result<()> {
        if slices.len() != self.file.num_subpartitions() {
            return Err(ShuffleReadError::General(format!(
                "Expected {} subpartition slices but got {}",
                self.file.num_subpartitions(),
                slices.len()
            )));
        }

        let mut entries = Vec::with_capacity(slices.len());
        for slice in slices {
            let slice = slice.as_ref();
            self.data.write_all(slice)?;
            entries.push(IndexEntry {
                offset: self.bytes_written,
                length: slice.len() as u64,
            });
            self.bytes_written += slice.len() as u64;
        }
        self.index.add_region(&entries)
    }

    /// Flushes the data file, writes the index and returns the finished file.
    pub fn finish(mut self) -> Result<PartitionedFile> {
        self.data.flush()?;
        self.data.get_ref().sync_all()?;
        self.index.write_to_file(self.file.index_file_path())?;
        debug!(
            "Finished partitioned file {:?} with {} regions and {} bytes",
            self.file.data_file_path(),
            self.index.num_regions(),
            self.bytes_written
        );
        Ok(self.file)
    }
}
