use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Size in bytes of one encoded accumulator record (8 x u64).
pub const RECORD_SIZE: usize = Counter::ALL.len() * 8;

/// Errors produced when decoding a raw table value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record size mismatch: expected {expected} bytes, got {actual}")]
    Size { expected: usize, actual: usize },
}

/// Counter identifies one field of an [`AccumulatorRecord`].
/// Order must match `struct profiled_metrics` in `bpf/nodeprof.bpf.c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Counter {
    MemBytesAllocated = 0,
    PageFaults = 1,
    CtxSwitchesGraceful = 2,
    CtxSwitchesForced = 3,
    FsReadCount = 4,
    FsReadSizeKb = 5,
    FsWriteCount = 6,
    FsWriteSizeKb = 7,
}

impl Counter {
    /// All counters in record layout order.
    pub const ALL: [Counter; 8] = [
        Self::MemBytesAllocated,
        Self::PageFaults,
        Self::CtxSwitchesGraceful,
        Self::CtxSwitchesForced,
        Self::FsReadCount,
        Self::FsReadSizeKb,
        Self::FsWriteCount,
        Self::FsWriteSizeKb,
    ];

    /// Returns the canonical metric name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MemBytesAllocated => "mem_bytes_allocated",
            Self::PageFaults => "page_faults",
            Self::CtxSwitchesGraceful => "ctx_switches_graceful",
            Self::CtxSwitchesForced => "ctx_switches_forced",
            Self::FsReadCount => "fs_read_count",
            Self::FsReadSizeKb => "fs_read_size_kb",
            Self::FsWriteCount => "fs_write_count",
            Self::FsWriteSizeKb => "fs_write_size_kb",
        }
    }

    /// Returns the metric help text.
    pub const fn help(self) -> &'static str {
        match self {
            Self::MemBytesAllocated => "Memory bytes allocated in interval.",
            Self::PageFaults => "Page faults recorded in interval.",
            Self::CtxSwitchesGraceful => "Graceful context switches in interval.",
            Self::CtxSwitchesForced => "Forced context switches in interval.",
            Self::FsReadCount => "FS Read calls during interval.",
            Self::FsReadSizeKb => "KB read from FS during interval.",
            Self::FsWriteCount => "FS Write calls during interval.",
            Self::FsWriteSizeKb => "KB written to FS during interval.",
        }
    }

    /// Byte offset of this counter inside an encoded record.
    pub const fn offset(self) -> usize {
        self as usize * 8
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-bucket counter record written by the instrumentation producers.
///
/// Every field is non-decreasing while the bucket is open and frozen once
/// the bucket's interval has elapsed. The drain side only ever copies it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccumulatorRecord {
    pub mem_bytes_allocated: u64,
    pub page_faults: u64,
    pub ctx_switches_graceful: u64,
    pub ctx_switches_forced: u64,
    pub fs_read_count: u64,
    pub fs_read_size_kb: u64,
    pub fs_write_count: u64,
    pub fs_write_size_kb: u64,
}

impl AccumulatorRecord {
    /// Decode a raw native-endian table value.
    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() != RECORD_SIZE {
            return Err(RecordError::Size {
                expected: RECORD_SIZE,
                actual: data.len(),
            });
        }

        let mut record = Self::default();
        for (counter, chunk) in Counter::ALL.iter().zip(data.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            record.set(*counter, u64::from_ne_bytes(word));
        }

        Ok(record)
    }

    /// Encode into the native-endian layout shared with the BPF program.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        for (counter, chunk) in Counter::ALL.iter().zip(out.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&self.get(*counter).to_ne_bytes());
        }
        out
    }

    /// Returns the value of one counter.
    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::MemBytesAllocated => self.mem_bytes_allocated,
            Counter::PageFaults => self.page_faults,
            Counter::CtxSwitchesGraceful => self.ctx_switches_graceful,
            Counter::CtxSwitchesForced => self.ctx_switches_forced,
            Counter::FsReadCount => self.fs_read_count,
            Counter::FsReadSizeKb => self.fs_read_size_kb,
            Counter::FsWriteCount => self.fs_write_count,
            Counter::FsWriteSizeKb => self.fs_write_size_kb,
        }
    }

    /// Sets the value of one counter.
    pub fn set(&mut self, counter: Counter, value: u64) {
        let slot = match counter {
            Counter::MemBytesAllocated => &mut self.mem_bytes_allocated,
            Counter::PageFaults => &mut self.page_faults,
            Counter::CtxSwitchesGraceful => &mut self.ctx_switches_graceful,
            Counter::CtxSwitchesForced => &mut self.ctx_switches_forced,
            Counter::FsReadCount => &mut self.fs_read_count,
            Counter::FsReadSizeKb => &mut self.fs_read_size_kb,
            Counter::FsWriteCount => &mut self.fs_write_count,
            Counter::FsWriteSizeKb => &mut self.fs_write_size_kb,
        };
        *slot = value;
    }
}
