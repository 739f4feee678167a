use serde_derive::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::raft::types::LogIndex;

const HEADER_SIZE: u64 = 8; // bincode-encoded first_index
const RECORD_HEADER_SIZE: u64 = 8; // little-endian record length

/// One file of the journal. Record `i` holds log index `first_index + i`.
#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    first_index: LogIndex,
    positions: Vec<u64>, // record number -> file offset
    end: u64,
    discarded_tail: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    first_index: u64,
}

impl Segment {
    pub fn file_name(first_index: LogIndex) -> String {
        format!("segment_{}.log", first_index)
    }

    /// Parse the first index out of a segment file name.
    pub fn parse_file_name(name: &str) -> Option<LogIndex> {
        name.strip_prefix("segment_")?
            .strip_suffix(".log")?
            .parse()
            .ok()
    }

    /// Open or create the segment file. A partially written trailing record
    /// is cut off.
    pub fn open<P: AsRef<Path>>(path: P, first_index: LogIndex) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            path: path.as_ref().to_path_buf(),
            first_index,
            positions: Vec::new(),
            end: HEADER_SIZE,
            discarded_tail: 0,
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            first_index: self.first_index,
        };
        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if header.first_index != self.first_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "segment {} starts at {} but is named for {}",
                    self.path.display(),
                    header.first_index,
                    self.first_index
                ),
            ));
        }
        Ok(())
    }

    fn read_record_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    fn rebuild_positions(&mut self) -> io::Result<()> {
        self.positions.clear();
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos < len {
            if pos + RECORD_HEADER_SIZE > len {
                break;
            }
            self.file.seek(SeekFrom::Start(pos))?;
            let size = self.read_record_header()?;
            if pos + RECORD_HEADER_SIZE + size > len {
                break;
            }
            self.positions.push(pos);
            pos += RECORD_HEADER_SIZE + size;
        }

        if pos < len {
            self.discarded_tail = len - pos;
            self.file.set_len(pos)?;
            self.file.sync_data()?;
        }
        self.end = pos;
        Ok(())
    }

    /// Append records and flush them to stable storage.
    pub fn append<B: AsRef<[u8]>>(&mut self, records: &[B]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        let mut pos = self.end;
        let mut new_positions = Vec::with_capacity(records.len());
        for record in records {
            let record = record.as_ref();
            new_positions.push(pos);
            buf.extend_from_slice(&(record.len() as u64).to_le_bytes());
            buf.extend_from_slice(record);
            pos += RECORD_HEADER_SIZE + record.len() as u64;
        }

        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        self.positions.extend(new_positions);
        self.end = pos;
        Ok(())
    }

    pub fn read_record(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let pos = *self.positions.get(n).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "record number out of range")
        })?;

        self.file.seek(SeekFrom::Start(pos))?;
        let size = self.read_record_header()?;
        let mut record = vec![0u8; size as usize];
        self.file.read_exact(&mut record)?;
        Ok(record)
    }

    pub fn read_all(&mut self) -> io::Result<Vec<Vec<u8>>> {
        (0..self.positions.len())
            .map(|n| self.read_record(n))
            .collect()
    }

    /// Keep only the first `count` records.
    pub fn truncate(&mut self, count: usize) -> io::Result<()> {
        if count >= self.positions.len() {
            return Ok(());
        }
        let pos = self.positions[count];
        self.file.set_len(pos)?;
        self.file.sync_data()?;
        self.positions.truncate(count);
        self.end = pos;
        Ok(())
    }

    pub fn remove(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Index of the last record, or `first_index - 1` when empty.
    pub fn last_index(&self) -> LogIndex {
        self.first_index + self.positions.len() as u64 - 1
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Bytes cut off a torn trailing record when the file was opened.
    pub fn discarded_tail(&self) -> u64 {
        self.discarded_tail
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
