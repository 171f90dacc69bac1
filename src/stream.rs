//! Byte streams over a channel's master side
//!
//! Streams are created lazily, memoized per process, and handed out as
//! `Arc`s so the same stream object is returned on every request. Reading
//! and writing go through `&PtyReader` / `&PtyWriter`, which lets one
//! thread block in `read` while another closes the stream. Closing a stream
//! drops its end of the channel, so its descriptors go with it.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::channel::PtyChannelSet;
use crate::pty::{MasterRead, MasterWrite, PtyDevice};

/// Readable end of a channel
pub struct PtyReader {
    /// `None` once closed; a read in progress holds the read lock
    inner: RwLock<Option<Box<dyn MasterRead>>>,
    closed: AtomicBool,
}

impl PtyReader {
    pub(crate) fn new(inner: Box<dyn MasterRead>) -> Self {
        Self {
            inner: RwLock::new(Some(inner)),
            closed: AtomicBool::new(false),
        }
    }

    /// A stream that is always at end-of-stream
    pub(crate) fn empty() -> Self {
        Self::new(Box::new(EmptyRead))
    }

    /// Close the stream, waking a blocked reader. Closing twice is a no-op.
    ///
    /// Returns once a read in progress has returned and the stream's end of
    /// the channel is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.read().as_ref() {
            inner.close();
        }
        self.inner.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Read for &PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        match self.inner.read().as_ref() {
            Some(inner) => inner.read(buf),
            None => Ok(0),
        }
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }
}

impl fmt::Debug for PtyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyReader")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Writable end of a channel
pub struct PtyWriter {
    inner: RwLock<Option<Box<dyn MasterWrite>>>,
    closed: AtomicBool,
}

impl PtyWriter {
    pub(crate) fn new(inner: Box<dyn MasterWrite>) -> Self {
        Self {
            inner: RwLock::new(Some(inner)),
            closed: AtomicBool::new(false),
        }
    }

    /// Close the stream; later writes fail with `BrokenPipe`. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.read().as_ref() {
            inner.close();
        }
        self.inner.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Write for &PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_stream());
        }
        match self.inner.read().as_ref() {
            Some(inner) => inner.write(buf),
            None => Err(closed_stream()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.inner.read().as_ref() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }
}

impl fmt::Debug for PtyWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_stream() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

struct EmptyRead;

impl MasterRead for EmptyRead {
    fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn close(&self) {}
}

/// Reader adapter that turns a broken pipe into end-of-stream.
///
/// Windows reports a pipe whose writer went away as `ERROR_BROKEN_PIPE`
/// rather than a zero-length read.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) struct BrokenPipeAsEof<R> {
    inner: R,
}

#[cfg_attr(not(windows), allow(dead_code))]
impl<R: Read> BrokenPipeAsEof<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> Read for BrokenPipeAsEof<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(0),
            other => other,
        }
    }
}

fn memoize<T>(
    slot: &mut Option<Arc<T>>,
    name: &'static str,
    open: impl FnOnce() -> io::Result<T>,
) -> io::Result<Arc<T>> {
    if let Some(stream) = slot {
        return Ok(Arc::clone(stream));
    }
    let stream = Arc::new(open()?);
    debug!(stream = name, "materialized stream");
    *slot = Some(Arc::clone(&stream));
    Ok(stream)
}

/// Memoized streams of one process
#[derive(Default)]
pub(crate) struct StreamSlots {
    reader: Option<Arc<PtyReader>>,
    writer: Option<Arc<PtyWriter>>,
    error: Option<Arc<PtyReader>>,
    aux_reader: Option<Arc<PtyReader>>,
    aux_writer: Option<Arc<PtyWriter>>,
}

impl StreamSlots {
    pub(crate) fn reader<D: PtyDevice>(
        &mut self,
        channels: &PtyChannelSet<D>,
    ) -> io::Result<Arc<PtyReader>> {
        memoize(&mut self.reader, "reader", || {
            channels.primary().open_reader().map(PtyReader::new)
        })
    }

    pub(crate) fn writer<D: PtyDevice>(
        &mut self,
        channels: &PtyChannelSet<D>,
    ) -> io::Result<Arc<PtyWriter>> {
        memoize(&mut self.writer, "writer", || {
            channels.primary().open_writer().map(PtyWriter::new)
        })
    }

    pub(crate) fn error_reader<D: PtyDevice>(
        &mut self,
        channels: &PtyChannelSet<D>,
    ) -> io::Result<Arc<PtyReader>> {
        memoize(&mut self.error, "error", || match channels.error() {
            Some(device) if channels.has_distinct_error() => {
                device.open_reader().map(PtyReader::new)
            }
            _ => Ok(PtyReader::empty()),
        })
    }

    pub(crate) fn aux_reader<D: PtyDevice>(
        &mut self,
        channels: &PtyChannelSet<D>,
    ) -> io::Result<Option<Arc<PtyReader>>> {
        channels
            .auxiliary()
            .map(|device| {
                memoize(&mut self.aux_reader, "aux_reader", || {
                    device.open_reader().map(PtyReader::new)
                })
            })
            .transpose()
    }

    pub(crate) fn aux_writer<D: PtyDevice>(
        &mut self,
        channels: &PtyChannelSet<D>,
    ) -> io::Result<Option<Arc<PtyWriter>>> {
        channels
            .auxiliary()
            .map(|device| {
                memoize(&mut self.aux_writer, "aux_writer", || {
                    device.open_writer().map(PtyWriter::new)
                })
            })
            .transpose()
    }

    /// Materialize and close every stream nobody asked for, then release
    /// the devices.
    ///
    /// Streams already handed out are left to their holders and keep their
    /// channel open until they are closed.
    pub(crate) fn drain<D: PtyDevice>(&mut self, channels: &PtyChannelSet<D>) {
        debug!("draining unrequested streams");
        if self.reader.is_none() {
            close_reader(self.reader(channels));
        }
        if self.writer.is_none() {
            close_writer(self.writer(channels));
        }
        if self.error.is_none() {
            close_reader(self.error_reader(channels));
        }
        if self.aux_reader.is_none() {
            if let Some(reader) = self.aux_reader(channels).transpose() {
                close_reader(reader);
            }
        }
        if self.aux_writer.is_none() {
            if let Some(writer) = self.aux_writer(channels).transpose() {
                close_writer(writer);
            }
        }
        channels.release();
    }
}

fn close_reader(stream: io::Result<Arc<PtyReader>>) {
    match stream {
        Ok(stream) => stream.close(),
        Err(e) => debug!(error = %e, "could not open reader while draining"),
    }
}

fn close_writer(stream: io::Result<Arc<PtyWriter>>) {
    match stream {
        Ok(stream) => stream.close(),
        Err(e) => debug!(error = %e, "could not open writer while draining"),
    }
}
