//! Append-only log segment file I/O.
//!
//! A segment holds serialized commands in creation order. The on-disk layout
//! is:
//!
//! ```text
//! [Segment header: 16 bytes]
//! [Record 0: 12-byte header + payload]
//! [Record 1: 12-byte header + payload]
//! ...
//! ```
//!
//! Each record header carries the payload length and an xxh3 checksum of the
//! payload, so the reader can recognize a torn tail after a crash: scanning
//! stops at the first incomplete or checksum-failing record and everything
//! before it is the valid prefix.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;
use tspace_error::{Result, TspaceError};
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes at the start of every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"TSLG";
/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u16 = 1;
/// Size of the fixed segment header.
pub const SEGMENT_HEADER_SIZE: usize = 16;
/// Size of a per-record header: u32 length + u64 checksum.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Largest record payload we will accept when scanning. Guards the reader
/// against interpreting garbage as a multi-gigabyte length.
pub const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

fn encode_header(seq: u64) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
    buf[4..6].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    // bytes 6..8 reserved
    buf[8..16].copy_from_slice(&seq.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8; SEGMENT_HEADER_SIZE]) -> Result<u64> {
    if buf[0..4] != SEGMENT_MAGIC {
        return Err(TspaceError::LogCorrupt {
            detail: "bad segment magic".to_owned(),
        });
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != SEGMENT_FORMAT_VERSION {
        return Err(TspaceError::LogCorrupt {
            detail: format!("unsupported segment format version {version}"),
        });
    }
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&buf[8..16]);
    Ok(u64::from_le_bytes(seq_bytes))
}

// ---------------------------------------------------------------------------
// SegmentWriter
// ---------------------------------------------------------------------------

/// Appends checksummed records to one segment file.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    seq: u64,
    record_count: u64,
}

impl SegmentWriter {
    /// Create a fresh segment at `path` with sequence number `seq`.
    ///
    /// Fails if the file already exists; segment sequence numbers are never
    /// reused within one log directory.
    pub fn create(path: &Path, seq: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&encode_header(seq))?;
        debug!(seq, path = %path.display(), "log segment created");
        Ok(Self {
            file,
            seq,
            record_count: 0,
        })
    }

    /// Append one record. The payload is framed with its length and xxh3
    /// checksum; no sync is performed here.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| TspaceError::LogCorrupt {
            detail: format!("record payload too large: {} bytes", payload.len()),
        })?;
        if len > MAX_RECORD_LEN {
            return Err(TspaceError::LogCorrupt {
                detail: format!("record payload too large: {len} bytes"),
            });
        }
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&len.to_le_bytes());
        header[4..12].copy_from_slice(&xxh3_64(payload).to_le_bytes());
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.record_count += 1;
        Ok(())
    }

    /// Flush appended records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }
}

// ---------------------------------------------------------------------------
// Segment reading
// ---------------------------------------------------------------------------

/// The valid contents of one segment file.
#[derive(Debug)]
pub struct SegmentContents {
    pub seq: u64,
    pub records: Vec<Vec<u8>>,
    /// True if the scan stopped before end-of-file (torn tail after a crash).
    pub truncated_tail: bool,
}

/// Read the valid record prefix of a segment.
///
/// A short or checksum-failing record terminates the scan without error;
/// everything before it is returned. A bad segment header is a hard
/// [`TspaceError::LogCorrupt`] since nothing in the file can be trusted.
pub fn read_segment(path: &Path) -> Result<SegmentContents> {
    let mut file = File::open(path)?;
    let file_len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    let mut header_buf = [0u8; SEGMENT_HEADER_SIZE];
    if file_len < SEGMENT_HEADER_SIZE as u64 {
        return Err(TspaceError::LogCorrupt {
            detail: format!(
                "segment '{}' too small for header: {file_len} bytes",
                path.display()
            ),
        });
    }
    file.read_exact(&mut header_buf)?;
    let seq = decode_header(&header_buf)?;

    let mut records = Vec::new();
    let mut offset = SEGMENT_HEADER_SIZE as u64;
    let mut truncated_tail = false;

    loop {
        if offset == file_len {
            break;
        }
        if file_len - offset < RECORD_HEADER_SIZE as u64 {
            truncated_tail = true;
            break;
        }
        let mut rec_header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut rec_header)?;
        let len = u32::from_le_bytes([rec_header[0], rec_header[1], rec_header[2], rec_header[3]]);
        let mut sum_bytes = [0u8; 8];
        sum_bytes.copy_from_slice(&rec_header[4..12]);
        let checksum = u64::from_le_bytes(sum_bytes);

        if len > MAX_RECORD_LEN || file_len - offset - (RECORD_HEADER_SIZE as u64) < u64::from(len) {
            truncated_tail = true;
            break;
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        if xxh3_64(&payload) != checksum {
            truncated_tail = true;
            break;
        }
        records.push(payload);
        offset += RECORD_HEADER_SIZE as u64 + u64::from(len);
    }

    if truncated_tail {
        debug!(
            seq,
            valid_records = records.len(),
            path = %path.display(),
            "segment scan stopped at torn tail"
        );
    }

    Ok(SegmentContents {
        seq,
        records,
        truncated_tail,
    })
}
