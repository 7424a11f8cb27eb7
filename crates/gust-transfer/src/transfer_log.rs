/// On-disk resumption log. One line per event, appended as blocks complete:
///
/// ```text
/// header <transfer_id> block_mode=<0|1> sender_resuming=<0|1>
/// block <seq_id> <offset> <size> <file_size> <file_name>
/// ```
///
/// The file name is the last field so it may contain spaces. On startup the
/// log is folded back into the per-file chunk inventory handed to a
/// resuming sender, with adjacent ranges merged.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::types::{FileChunksInfo, Interval};

const LOG_FILE_NAME: &str = "gust.transferlog";

pub struct TransferLogManager {
    path: PathBuf,
    file: Mutex<File>,
}

impl TransferLogManager {
    pub fn open(dest_dir: &Path) -> io::Result<TransferLogManager> {
        let path = dest_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(TransferLogManager {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the start of a global session. Best effort: a log write
    /// failure degrades resumption but must not fail the transfer.
    pub fn add_header(&self, transfer_id: &str, block_mode: bool, sender_resuming: bool) {
        let line = format!(
            "header {} block_mode={} sender_resuming={}\n",
            transfer_id,
            u8::from(block_mode),
            u8::from(sender_resuming)
        );
        self.append(&line);
    }

    /// Record one fully received block.
    pub fn add_block_write_entry(
        &self,
        seq_id: i64,
        offset: i64,
        size: i64,
        file_size: i64,
        file_name: &str,
    ) {
        let line = format!("block {seq_id} {offset} {size} {file_size} {file_name}\n");
        self.append(&line);
    }

    fn append(&self, line: &str) {
        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()) {
            error!("transfer log write failed: {}", e);
        }
    }

    /// Fold the log back into per-file received ranges.
    pub fn parse_file_chunks(&self) -> io::Result<Vec<FileChunksInfo>> {
        {
            let mut file = self.file.lock();
            file.flush()?;
        }
        let mut contents = String::new();
        File::open(&self.path)?.read_to_string(&mut contents)?;

        let mut by_seq: BTreeMap<i64, FileChunksInfo> = BTreeMap::new();
        for line in contents.lines() {
            if line.starts_with("header ") || line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(6, ' ');
            let kind = fields.next();
            if kind != Some("block") {
                warn!("skipping unknown transfer log entry: {}", line);
                continue;
            }
            let parsed = (|| {
                let seq_id: i64 = fields.next()?.parse().ok()?;
                let offset: i64 = fields.next()?.parse().ok()?;
                let size: i64 = fields.next()?.parse().ok()?;
                let file_size: i64 = fields.next()?.parse().ok()?;
                let file_name = fields.next()?.to_owned();
                Some((seq_id, offset, size, file_size, file_name))
            })();
            let Some((seq_id, offset, size, file_size, file_name)) = parsed else {
                warn!("skipping malformed transfer log entry: {}", line);
                continue;
            };
            let entry = by_seq.entry(seq_id).or_insert_with(|| FileChunksInfo {
                seq_id,
                file_name,
                file_size,
                chunks: Vec::new(),
            });
            entry.chunks.push(Interval {
                start: offset,
                end: offset + size,
            });
        }

        let mut out: Vec<FileChunksInfo> = by_seq.into_values().collect();
        for info in &mut out {
            merge_intervals(&mut info.chunks);
        }
        if !out.is_empty() {
            info!("transfer log replay found {} partially received files", out.len());
        }
        Ok(out)
    }
}

/// Sort and coalesce touching or overlapping ranges.
fn merge_intervals(chunks: &mut Vec<Interval>) {
    chunks.sort_by_key(|iv| iv.start);
    let mut merged: Vec<Interval> = Vec::with_capacity(chunks.len());
    for iv in chunks.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end => last.end = last.end.max(iv.end),
            _ => merged.push(iv),
        }
    }
    *chunks = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("gust_log_test_{tag}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn replay_groups_and_merges_blocks() {
        let dir = scratch_dir("replay");
        let log = TransferLogManager::open(&dir).unwrap();
        log.add_header("t9", true, false);
        log.add_block_write_entry(0, 0, 100, 300, "a space name.bin");
        log.add_block_write_entry(0, 100, 50, 300, "a space name.bin");
        log.add_block_write_entry(0, 200, 50, 300, "a space name.bin");
        log.add_block_write_entry(1, 0, 64, 64, "b.bin");

        let chunks = log.parse_file_chunks().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].seq_id, 0);
        assert_eq!(chunks[0].file_name, "a space name.bin");
        assert_eq!(
            chunks[0].chunks,
            vec![
                Interval { start: 0, end: 150 },
                Interval { start: 200, end: 250 }
            ]
        );
        assert_eq!(chunks[1].chunks, vec![Interval { start: 0, end: 64 }]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_log_replays_nothing() {
        let dir = scratch_dir("empty");
        let log = TransferLogManager::open(&dir).unwrap();
        assert!(log.parse_file_chunks().unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
