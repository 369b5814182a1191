//! Append-only log file writer.
//!
//! Each write is flushed immediately so that several relay processes can
//! share one file and `tail -f` sees complete lines.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// Shared handle to an append-mode log file.
#[derive(Clone)]
pub struct FileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl FileWriter {
    /// Open (or create) `path` in append mode, creating parent directories.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        let written = guard.write(buf)?;
        guard.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// `MakeWriter` implementation handing out clones of one [`FileWriter`].
#[derive(Clone)]
pub struct FileWriterFactory {
    writer: FileWriter,
}

impl FileWriterFactory {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: FileWriter::open(path)?,
        })
    }
}

impl<'a> MakeWriter<'a> for FileWriterFactory {
    type Writer = FileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer.clone()
    }
}
