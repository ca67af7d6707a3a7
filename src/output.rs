//! Raw output sink for received data.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};

type Writer = Box<dyn Write + Send>;

/// Append-only byte sink shared by the receive task (writer) and the
/// supervisor (owner). After [`OutputSink::close`] every write fails with
/// `BrokenPipe`; the underlying writer is flushed and dropped exactly once.
pub struct OutputSink {
    label: String,
    inner: Mutex<Option<Writer>>,
}

impl OutputSink {
    /// Create (truncating) the file at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        debug!("opened output file {}", path.display());
        Ok(Self::from_writer(
            path.display().to_string(),
            BufWriter::new(file),
        ))
    }

    /// Wrap any writer; `label` only shows up in logs.
    pub fn from_writer(label: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(Some(Box::new(writer))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(w) => w.write_all(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("output {} is closed", self.label),
            )),
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Flush and drop the writer. Closing twice is a no-op.
    pub fn close(&self) -> io::Result<()> {
        let writer = self.lock().take();
        match writer {
            Some(mut w) => {
                let flushed = w.flush();
                drop(w);
                debug!("closed output {}", self.label);
                flushed
            }
            None => Ok(()),
        }
    }

    // A panicking writer poisons the lock; buffered data is still flushed on close.
    fn lock(&self) -> MutexGuard<'_, Option<Writer>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("output {} lock poisoned, recovering", self.label);
            poisoned.into_inner()
        })
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Write `report` as pretty JSON to `path`, replacing any existing file.
pub fn write_report<T: serde::Serialize>(path: &Path, report: &T) -> crate::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report).map_err(io::Error::from)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_until_closed() {
        let buf = Shared::default();
        let sink = OutputSink::from_writer("mem", buf.clone());
        sink.write_all(b"abc").unwrap();
        sink.write_all(b"def").unwrap();
        assert!(!sink.is_closed());

        sink.close().unwrap();
        assert!(sink.is_closed());
        assert_eq!(buf.0.lock().unwrap().as_slice(), b"abcdef");

        let err = sink.write_all(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        // second close is harmless
        sink.close().unwrap();
    }

    #[test]
    fn file_sink_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.bin");
        let sink = OutputSink::create(&path).unwrap();
        sink.write_all(&[1, 2, 3, 4]).unwrap();
        sink.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn report_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&path, &serde_json::json!({ "bytes": 42 })).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["bytes"], 42);
    }
}
