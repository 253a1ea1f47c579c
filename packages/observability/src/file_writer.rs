//! Append-only writers for JSONL output.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// Line-flushed writer appending to a single log file.
///
/// Each `write` is flushed immediately so concurrent producers of the same
/// file see whole lines.
#[derive(Clone)]
pub struct AppendFileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl AppendFileWriter {
    pub fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }
}

impl Write for AppendFileWriter {
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

/// Target for the JSON layer's lines.
#[derive(Clone)]
enum Target {
    File(AppendFileWriter),
    Stderr,
}

/// `MakeWriter` handing out either the shared file writer or stderr.
#[derive(Clone)]
pub struct WriterFactory {
    target: Target,
}

impl WriterFactory {
    pub fn file(writer: AppendFileWriter) -> Self {
        Self {
            target: Target::File(writer),
        }
    }

    pub fn stderr() -> Self {
        Self {
            target: Target::Stderr,
        }
    }
}

/// Writer produced by [`WriterFactory`].
pub enum FactoryWriter {
    File(AppendFileWriter),
    Stderr(io::Stderr),
}

impl Write for FactoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FactoryWriter::File(w) => w.write(buf),
            FactoryWriter::Stderr(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FactoryWriter::File(w) => w.flush(),
            FactoryWriter::Stderr(w) => w.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for WriterFactory {
    type Writer = FactoryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match &self.target {
            Target::File(w) => FactoryWriter::File(w.clone()),
            Target::Stderr => FactoryWriter::Stderr(io::stderr()),
        }
    }
}
