use pyo3::prelude::*;
use pyo3::types::PyModule;
use tracing::warn;

/// Write-only text stream that keeps everything written to it.
#[pyclass(module = "sandbox")]
#[derive(Default)]
pub(crate) struct CaptureStream {
    text: String,
}

#[pymethods]
impl CaptureStream {
    fn write(&mut self, data: &str) -> usize {
        self.text.push_str(data);
        data.chars().count()
    }

    fn writelines(&mut self, lines: &Bound<'_, PyAny>) -> PyResult<()> {
        for line in lines.iter()? {
            let line: String = line?.extract()?;
            self.text.push_str(&line);
        }
        Ok(())
    }

    fn flush(&self) {}

    fn close(&self) {}

    fn isatty(&self) -> bool {
        false
    }

    fn readable(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        true
    }

    fn seekable(&self) -> bool {
        false
    }

    #[getter]
    fn closed(&self) -> bool {
        false
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }

    #[getter]
    fn errors(&self) -> &'static str {
        "strict"
    }
}

/// Swaps `sys.stdout`, `sys.stderr` and `sys.stdin` for the lifetime of one
/// execution. Dropping the guard puts the previous streams back.
pub(crate) struct Redirect<'py> {
    sys: Bound<'py, PyModule>,
    stdout: Bound<'py, CaptureStream>,
    stderr: Bound<'py, CaptureStream>,
    saved: Vec<(&'static str, PyObject)>,
}

impl<'py> Redirect<'py> {
    pub(crate) fn install(sys: &Bound<'py, PyModule>, stdin: Bound<'py, PyAny>) -> PyResult<Self> {
        let py = sys.py();
        let stdout = Bound::new(py, CaptureStream::default())?;
        let stderr = Bound::new(py, CaptureStream::default())?;
        let targets = [
            ("stdout", stdout.clone().into_any()),
            ("stderr", stderr.clone().into_any()),
            ("stdin", stdin),
        ];

        let mut redirect = Self {
            sys: sys.clone(),
            stdout,
            stderr,
            saved: Vec::with_capacity(targets.len()),
        };
        // A failure part-way leaves `redirect` to restore what was swapped.
        for (name, replacement) in targets {
            let previous = sys.getattr(name)?;
            sys.setattr(name, replacement)?;
            redirect.saved.push((name, previous.unbind()));
        }
        Ok(redirect)
    }

    /// Restore the previous streams and return `(stdout, stderr)`.
    pub(crate) fn finish(self) -> (String, String) {
        (take_text(&self.stdout), take_text(&self.stderr))
    }
}

impl Drop for Redirect<'_> {
    fn drop(&mut self) {
        for (name, previous) in self.saved.drain(..).rev() {
            if let Err(e) = self.sys.setattr(name, previous) {
                warn!(stream = name, error = %e, "failed to restore sys stream");
            }
        }
    }
}

fn take_text(stream: &Bound<'_, CaptureStream>) -> String {
    stream
        .try_borrow_mut()
        .map(|mut s| std::mem::take(&mut s.text))
        .unwrap_or_default()
}
