//! File content streams handed out by [`GridFs`](crate::GridFs)

use crate::data::DataManager;
use crate::events::{FsEvent, FsEventKind};
use crate::manager::MetaManager;
use crate::metrics::LocalMetrics;
use gridfs_common::{Entry, EntryId, FsPath, Result, now_millis};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

enum Source {
    Data(Arc<dyn DataManager>),
    Secondary(Box<dyn Read + Send>),
}

/// Reader over the content of a file
pub struct FileReader {
    path: FsPath,
    info: Entry,
    source: Source,
    pos: u64,
    metrics: Arc<LocalMetrics>,
}

impl FileReader {
    pub(crate) fn from_data(
        path: FsPath,
        info: Entry,
        data: Arc<dyn DataManager>,
        metrics: Arc<LocalMetrics>,
    ) -> Self {
        LocalMetrics::incr(&metrics.files_opened_for_read);
        Self {
            path,
            info,
            source: Source::Data(data),
            pos: 0,
            metrics,
        }
    }

    pub(crate) fn from_secondary(
        path: FsPath,
        info: Entry,
        input: Box<dyn Read + Send>,
        metrics: Arc<LocalMetrics>,
    ) -> Self {
        LocalMetrics::incr(&metrics.files_opened_for_read);
        Self {
            path,
            info,
            source: Source::Secondary(input),
            pos: 0,
            metrics,
        }
    }

    #[must_use]
    pub const fn path(&self) -> &FsPath {
        &self.path
    }

    /// Entry of the file as it was when opened
    #[must_use]
    pub const fn info(&self) -> &Entry {
        &self.info
    }

    /// Bytes read so far
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.source {
            Source::Data(data) => data
                .read(&self.info, self.pos, buf)
                .map_err(io::Error::other)?,
            Source::Secondary(input) => input.read(buf)?,
        };
        self.pos += n as u64;
        Ok(n)
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        LocalMetrics::decr(&self.metrics.files_opened_for_read);
    }
}

/// Writer holding the lock of a file until closed
///
/// Content goes to the data manager and, in dual modes, to the secondary
/// file system as well. Closing publishes the new length and modification
/// time and releases the lock. Dropping an open writer closes it and logs
/// any failure.
pub struct FileWriter {
    meta: Arc<MetaManager>,
    data: Arc<dyn DataManager>,
    path: FsPath,
    parent_id: EntryId,
    info: Entry,
    secondary: Option<Box<dyn Write + Send>>,
    offset: u64,
    written: u64,
    closed: bool,
}

impl FileWriter {
    /// `info` must hold the writer lock; writing starts at its length.
    pub(crate) fn new(
        meta: Arc<MetaManager>,
        data: Arc<dyn DataManager>,
        path: FsPath,
        parent_id: EntryId,
        info: Entry,
        secondary: Option<Box<dyn Write + Send>>,
    ) -> Self {
        LocalMetrics::incr(&meta.metrics.files_opened_for_write);
        let offset = info.length();

        Self {
            meta,
            data,
            path,
            parent_id,
            info,
            secondary,
            offset,
            written: 0,
            closed: false,
        }
    }

    #[must_use]
    pub const fn path(&self) -> &FsPath {
        &self.path
    }

    #[must_use]
    pub const fn id(&self) -> EntryId {
        self.info.id()
    }

    /// Bytes written through this writer
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Flush, publish the file length and release the lock.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        LocalMetrics::decr(&self.meta.metrics.files_opened_for_write);

        if let Some(mut out) = self.secondary.take() {
            out.flush()?;
        }

        let length = self.offset + self.written;
        let mtime = now_millis();
        let id = self.info.id();

        self.meta.update_info(id, |e| e.with_length(length))?;
        self.meta.unlock(&self.info, mtime)?;

        let delta = i64::try_from(self.written).unwrap_or(i64::MAX);
        self.meta
            .update_parent_listing(self.parent_id, id, self.path.name(), delta, mtime)?;

        debug!("Closed {} ({} bytes written, length {})", self.path, self.written, length);
        self.meta
            .events
            .record(FsEvent::new(FsEventKind::FileClosedWrite, self.path.clone()));
        Ok(())
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("stream is closed: {}", self.path),
            ));
        }

        self.data
            .write(&self.info, self.offset + self.written, buf)
            .map_err(io::Error::other)?;
        if let Some(out) = self.secondary.as_mut() {
            out.write_all(buf)?;
        }

        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.secondary.as_mut() {
            Some(out) => out.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {}", self.path, e);
        }
    }
}
