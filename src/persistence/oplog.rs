use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;

use super::atomic::write_atomic;
use crate::config::Durability;
use crate::error::{Result, ShoalError};
use crate::models::{Operation, SeqNo};

const HEADER_LEN: usize = 8;

/// Append-only operation log for one shard copy.
///
/// Record format:
/// - u32 length (little endian)
/// - u32 crc32 of payload
/// - bincode-encoded [`Operation`]
///
/// Sequence numbers inside the log are strictly increasing. A record that is
/// truncated, fails its checksum, or breaks monotonicity ends the log: it and
/// everything after it are discarded on open.
pub struct OperationLog {
    path: PathBuf,
    durability: Durability,
    state: Mutex<LogState>,
}

/// Failure to inject into the next append; for failure testing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendFailure {
    /// Only part of the record reaches the file
    Torn,
    /// The whole record is written but never synced
    Unsynced,
}

struct LogState {
    file: File,
    /// Lowest retained seq, if any record is retained
    first_seq: Option<SeqNo>,
    /// Highest seq ever appended (survives trimming within a process)
    last_seq: SeqNo,
    entries: usize,
    /// Length of the file up to the end of the last whole record
    bytes: u64,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
    injected: Option<AppendFailure>,
}

/// Result of scanning a log file
struct Scan {
    ops: Vec<Operation>,
    valid_len: u64,
    file_len: u64,
}

impl OperationLog {
    /// Open (or create) the log, returning it with every intact operation it holds
    pub fn open(path: PathBuf, durability: Durability) -> Result<(Self, Vec<Operation>)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let scan = scan_file(&path)?;
        if scan.valid_len < scan.file_len {
            tracing::warn!(
                path = %path.display(),
                valid_bytes = scan.valid_len,
                discarded_bytes = scan.file_len - scan.valid_len,
                "Discarding torn tail of operation log"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let state = LogState {
            file,
            first_seq: scan.ops.first().map(|op| op.seq_no),
            last_seq: scan.ops.last().map(|op| op.seq_no).unwrap_or(0),
            entries: scan.ops.len(),
            bytes: scan.valid_len,
            poisoned: false,
            injected: None,
        };

        tracing::debug!(
            path = %path.display(),
            entries = state.entries,
            last_seq = state.last_seq,
            "Opened operation log"
        );

        Ok((
            Self {
                path,
                durability,
                state: Mutex::new(state),
            },
            scan.ops,
        ))
    }

    /// Append one operation. With `Durability::Request` the record is fsynced before returning.
    ///
    /// A failed append leaves no trace: the file is cut back to the last
    /// whole record, so the same sequence number can be appended again.
    pub fn append(&self, op: &Operation) -> Result<()> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(ShoalError::Internal(format!(
                "operation log {} holds an unrecoverable partial record",
                self.path.display()
            )));
        }
        if op.seq_no <= state.last_seq {
            return Err(ShoalError::SequenceGap {
                expected: state.last_seq + 1,
                actual: op.seq_no,
            });
        }

        let record = encode_record(op)?;
        if let Err(e) = write_record(&mut state, &record, self.durability) {
            let good = state.bytes;
            if let Err(rollback) = state.file.set_len(good).and_then(|_| state.file.sync_all()) {
                tracing::error!(
                    path = %self.path.display(),
                    seq_no = op.seq_no,
                    error = %rollback,
                    "Failed to roll back operation log"
                );
                state.poisoned = true;
            }
            return Err(e);
        }

        if state.first_seq.is_none() {
            state.first_seq = Some(op.seq_no);
        }
        state.last_seq = op.seq_no;
        state.entries += 1;
        state.bytes += record.len() as u64;
        Ok(())
    }

    /// Make the next append fail the given way
    pub fn inject_append_failure(&self, failure: AppendFailure) {
        self.state.lock().injected = Some(failure);
    }

    /// Flush buffered records to stable storage
    pub fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }

    /// All retained operations with `seq_no > after`, in order.
    ///
    /// Fails with `LogTruncated` when operations in that range were already trimmed.
    pub fn read_after(&self, after: SeqNo) -> Result<Vec<Operation>> {
        let state = self.state.lock();
        if after >= state.last_seq {
            return Ok(Vec::new());
        }
        match state.first_seq {
            Some(first) if first <= after + 1 => {}
            _ => return Err(ShoalError::LogTruncated(after + 1)),
        }
        // Holding the lock keeps appends from racing the scan
        let scan = scan_file(&self.path)?;
        Ok(scan
            .ops
            .into_iter()
            .filter(|op| op.seq_no > after)
            .collect())
    }

    /// Drop every operation with `seq_no <= upto`. Returns the number removed.
    pub fn trim_through(&self, upto: SeqNo) -> Result<usize> {
        let mut state = self.state.lock();
        match state.first_seq {
            Some(first) if first <= upto => {}
            _ => return Ok(0),
        }

        state.file.sync_data()?;
        let scan = scan_file(&self.path)?;
        let before = scan.ops.len();
        let kept: Vec<&Operation> = scan.ops.iter().filter(|op| op.seq_no > upto).collect();

        let mut bytes = Vec::new();
        for op in &kept {
            bytes.extend_from_slice(&encode_record(op)?);
        }
        write_atomic(&self.path, &bytes)?;

        state.file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        state.first_seq = kept.first().map(|op| op.seq_no);
        state.entries = kept.len();
        state.bytes = bytes.len() as u64;

        let removed = before - kept.len();
        tracing::debug!(upto, removed, retained = state.entries, "Trimmed operation log");
        Ok(removed)
    }

    pub fn first_seq(&self) -> Option<SeqNo> {
        self.state.lock().first_seq
    }

    pub fn last_seq(&self) -> SeqNo {
        self.state.lock().last_seq
    }

    /// Raise the high-water mark after recovery from segments whose ops were trimmed
    pub fn advance_to(&self, seq: SeqNo) {
        let mut state = self.state.lock();
        if seq > state.last_seq {
            state.last_seq = seq;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_record(state: &mut LogState, record: &[u8], durability: Durability) -> Result<()> {
    match state.injected.take() {
        Some(AppendFailure::Torn) => {
            state.file.write_all(&record[..record.len() / 2])?;
            return Err(injected_failure("torn operation log append"));
        }
        Some(AppendFailure::Unsynced) => {
            state.file.write_all(record)?;
            return Err(injected_failure("operation log sync"));
        }
        None => {}
    }
    // One write call so a crash can only tear the final record
    state.file.write_all(record)?;
    if durability == Durability::Request {
        state.file.sync_data()?;
    }
    Ok(())
}

fn injected_failure(what: &str) -> ShoalError {
    ShoalError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {} failure", what),
    ))
}

fn encode_record(op: &Operation) -> Result<Vec<u8>> {
    let payload = bincode::serialize(op)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc32 = hasher.finalize();

    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&crc32.to_le_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

fn scan_file(path: &Path) -> Result<Scan> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut ops = Vec::new();
    let mut pos = 0usize;
    let mut last_seq = 0;

    while pos + HEADER_LEN <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let stored_crc =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + HEADER_LEN;
        let Some(end) = start.checked_add(len).filter(|end| *end <= data.len()) else {
            break;
        };

        let payload = &data[start..end];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            break;
        }
        let op: Operation = match bincode::deserialize(payload) {
            Ok(op) => op,
            Err(_) => break,
        };
        if op.seq_no <= last_seq {
            break;
        }

        last_seq = op.seq_no;
        ops.push(op);
        pos = end;
    }

    Ok(Scan {
        ops,
        valid_len: pos as u64,
        file_len: data.len() as u64,
    })
}
