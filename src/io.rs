//! Stream conventions shared by every pipeline stage: `-` means standard
//! input/output, an empty output name discards that output, and a
//! destination equal to an already-opened destination reuses the same
//! open stream instead of reopening it.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::ops::Deref;
use std::rc::Rc;

/// Whole-document input bytes, either slurped or memory-mapped.
///
/// Every stage consumes its input as one buffer: the scans are single
/// forward passes, but the buffer doubles as the source for verbatim
/// byte copies and for error-context windows.
pub enum InputBytes {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for InputBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            InputBytes::Owned(v) => v,
            InputBytes::Mapped(m) => m,
        }
    }
}

/// Read an input in full. `-` reads standard input; `use_mmap` maps
/// regular files instead of copying them.
pub fn read_input(name: &str, use_mmap: bool) -> Result<InputBytes> {
    if name == "-" {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read standard input")?;
        return Ok(InputBytes::Owned(buf));
    }
    if use_mmap {
        let file = File::open(name).with_context(|| format!("open failed for input file `{name}`"))?;
        // Safety: the mapping is read-only and lives only for this run.
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap failed for input file `{name}`"))?;
        return Ok(InputBytes::Mapped(map));
    }
    std::fs::read(name)
        .map(InputBytes::Owned)
        .with_context(|| format!("open failed for input file `{name}`"))
}

/// A clonable handle to one open output stream. Clones share the
/// underlying writer, which is what lets two output names resolve to a
/// single destination.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Rc<RefCell<Box<dyn Write>>>,
}

impl SharedWriter {
    pub fn new(w: Box<dyn Write>) -> Self {
        Self { inner: Rc::new(RefCell::new(w)) }
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.borrow_mut().flush()
    }
}

/// An in-memory sink whose contents remain readable after writing,
/// for tests and for capturing stage output.
#[derive(Clone, Default)]
pub struct VecSink {
    buf: Rc<RefCell<Vec<u8>>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.borrow().clone()
    }
}

impl Write for VecSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Registry of opened output destinations for one run.
#[derive(Default)]
pub struct OutputSet {
    open: Vec<(String, SharedWriter)>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an output name. Returns `None` for the empty name
    /// (discard). A name seen before yields a clone of the stream
    /// opened for it, including `-`.
    pub fn open(&mut self, name: &str) -> Result<Option<SharedWriter>> {
        if name.is_empty() {
            return Ok(None);
        }
        if let Some((_, w)) = self.open.iter().find(|(n, _)| n == name) {
            return Ok(Some(w.clone()));
        }
        let writer: Box<dyn Write> = if name == "-" {
            Box::new(io::stdout())
        } else {
            let file =
                File::create(name).with_context(|| format!("open failed for output file `{name}`"))?;
            Box::new(BufWriter::new(file))
        };
        let shared = SharedWriter::new(writer);
        self.open.push((name.to_string(), shared.clone()));
        Ok(Some(shared))
    }

    /// Flush every stream opened through this set.
    pub fn flush_all(&mut self) -> Result<()> {
        for (name, w) in &mut self.open {
            w.flush().with_context(|| format!("flush failed for output `{name}`"))?;
        }
        Ok(())
    }
}
