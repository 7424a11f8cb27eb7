/// Block-oriented file writing. A `FileCreator` owns the destination root
/// and opens one `FileWriter` per FILE command; the writer is positioned at
/// the block offset and tracks exactly how many payload bytes landed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::types::{AllocationStatus, BlockDetails};

pub struct FileCreator {
    root: PathBuf,
}

impl FileCreator {
    pub fn new(root: PathBuf) -> FileCreator {
        FileCreator { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the block's file, pre-sizing it on first allocation and seeking
    /// to the block offset. Each worker holds its own handle; concurrent
    /// writers land on disjoint offsets.
    pub fn open_for_block(&self, thread_index: usize, bd: &BlockDetails) -> io::Result<FileWriter> {
        let rel = sanitize_relative(&bd.file_name)?;
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create(true).open(&path)?;
        if bd.allocation_status == AllocationStatus::NotExists {
            file.set_len(bd.file_size as u64)?;
        }
        file.seek(SeekFrom::Start(bd.offset as u64))?;
        debug!(
            "worker {} opened {} for seq {} at offset {}",
            thread_index,
            path.display(),
            bd.seq_id,
            bd.offset
        );
        Ok(FileWriter {
            file,
            total_written: 0,
        })
    }
}

/// Reject absolute paths and parent-directory escapes from the wire.
fn sanitize_relative(name: &str) -> io::Result<PathBuf> {
    let path = Path::new(name);
    if name.is_empty() || path.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bad file name on wire: {name:?}"),
        ));
    }
    for comp in path.components() {
        match comp {
            Component::Normal(_) => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad file name on wire: {name:?}"),
                ));
            }
        }
    }
    Ok(path.to_path_buf())
}

pub struct FileWriter {
    file: File,
    total_written: i64,
}

impl FileWriter {
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.total_written += buf.len() as i64;
        Ok(())
    }

    pub fn total_written(&self) -> i64 {
        self.total_written
    }
}
