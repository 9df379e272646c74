//! Whole-bucket file I/O strategies
//!
//! Both strategies read or write exactly one bucket per call; there is no
//! partial-bucket I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub use crate::core::config::IoStrategy;

/// Buffer size used by the buffered strategy
const STREAM_BUFFER_SIZE: usize = 1 << 20;

/// Reads and writes complete bucket files
pub trait BucketIo: Send + Sync {
    /// Fill `buf` with the contents of the bucket file at `path`.
    fn read_bucket(&self, path: &Path, buf: &mut [u8]) -> io::Result<()>;

    /// Overwrite the bucket file at `path` with `data`.
    fn write_bucket(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn strategy(&self) -> IoStrategy;
}

/// Buffered reader/writer streams
#[derive(Debug, Default)]
pub struct BufferedIo;

impl BucketIo for BufferedIo {
    fn read_bucket(&self, path: &Path, buf: &mut [u8]) -> io::Result<()> {
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, File::open(path)?);
        reader.read_exact(buf)
    }

    fn write_bucket(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, file);
        writer.write_all(data)?;
        writer.flush()
    }

    fn strategy(&self) -> IoStrategy {
        IoStrategy::Buffered
    }
}

/// Plain file handle, one read/write per bucket
#[derive(Debug, Default)]
pub struct DirectIo;

impl BucketIo for DirectIo {
    fn read_bucket(&self, path: &Path, buf: &mut [u8]) -> io::Result<()> {
        File::open(path)?.read_exact(buf)
    }

    fn write_bucket(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        file.write_all(data)
    }

    fn strategy(&self) -> IoStrategy {
        IoStrategy::Direct
    }
}

/// Instantiate the I/O backend for a strategy
pub fn io_for(strategy: IoStrategy) -> Box<dyn BucketIo> {
    match strategy {
        IoStrategy::Buffered => Box::new(BufferedIo),
        IoStrategy::Direct => Box::new(DirectIo),
    }
}
