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

//! Sort-merge partitioned files: one data file and one index file shared by
//! all subpartitions of a blocking shuffle partition.

mod index;
mod reader;
mod writer;

pub use index::{INDEX_ENTRY_SIZE, IndexEntry, PartitionIndex};
pub use reader::{FileReader, PartitionedFileReader, RegionChunk};
pub use writer::PartitionedFileWriter;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use log::warn;

/// Suffix of the data file of a partitioned file.
pub const DATA_FILE_SUFFIX: &str = ".shuffle.data";
/// Suffix of the index file of a partitioned file.
pub const INDEX_FILE_SUFFIX: &str = ".shuffle.index";

/// The data and index file pair of one sort-merge shuffle partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionedFile {
    data_file_path: PathBuf,
    index_file_path: PathBuf,
    num_subpartitions: usize,
}

impl PartitionedFile {
    /// Describes an existing partitioned file.
    pub fn new(
        data_file_path: PathBuf,
        index_file_path: PathBuf,
        num_subpartitions: usize,
    ) -> Self {
        Self {
            data_file_path,
            index_file_path,
            num_subpartitions,
        }
    }

    /// Describes the partitioned file stored under `base_path` plus the
    /// standard suffixes.
    pub fn from_base_path(base_path: &Path, num_subpartitions: usize) -> Self {
        Self::new(
            data_file_path(base_path),
            index_file_path(base_path),
            num_subpartitions,
        )
    }

    /// Path of the data file.
    pub fn data_file_path(&self) -> &Path {
        &self.data_file_path
    }

    /// Path of the index file.
    pub fn index_file_path(&self) -> &Path {
        &self.index_file_path
    }

    /// Number of subpartitions stored in this file.
    pub fn num_subpartitions(&self) -> usize {
        self.num_subpartitions
    }

    /// Deletes both files, logging instead of failing.
    pub fn delete_quietly(&self) {
        for path in [&self.data_file_path, &self.index_file_path] {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!("Failed to delete shuffle file {path:?}: {e}");
            }
        }
    }
}

/// Gets the data file path for a base path.
pub fn data_file_path(base_path: &Path) -> PathBuf {
    with_suffix(base_path, DATA_FILE_SUFFIX)
}

/// Gets the index file path for a base path.
pub fn index_file_path(base_path: &Path) -> PathBuf {
    with_suffix(base_path, INDEX_FILE_SUFFIX)
}

fn with_suffix(base_path: &Path, suffix: &str) -> PathBuf {
    let mut path = base_path.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Opens a read-only channel shared by all readers of a partitioned file.
pub(crate) fn open_file_channel(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

/// Fills `buf` from `file` at `offset` without using the file cursor, so
/// one open handle can serve concurrent readers.
#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(
    file: &File,
    mut buf: &mut [u8],
    mut offset: u64,
) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_from_base() {
        let file = PartitionedFile::from_base_path(Path::new("/tmp/job-1/2/0"), 4);
        assert_eq!(
            file.data_file_path(),
            Path::new("/tmp/job-1/2/0.shuffle.data")
        );
        assert_eq!(
            file.index_file_path(),
            Path::new("/tmp/job-1/2/0.shuffle.index")
        );
        assert_eq!(file.num_subpartitions(), 4);
    }

    #[test]
    fn test_read_exact_at() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();

        let file = open_file_channel(&path).unwrap();
        let mut buf = [0u8; 4];
        read_exact_at(&file, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"3456");
        read_exact_at(&file, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"0123");

        let err = read_exact_at(&file, &mut buf, 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_delete_quietly() {
        let temp_dir = TempDir::new().unwrap();
        let file = PartitionedFile::from_base_path(&temp_dir.path().join("p"), 1);
        std::fs::write(file.data_file_path(), b"data").unwrap();
        std::fs::write(file.index_file_path(), b"index").unwrap();

        file.delete_quietly();
        assert!(!file.data_file_path().exists());
        assert!(!file.index_file_path().exists());

        // deleting again is a no-op
        file.delete_quietly();
    }
}
