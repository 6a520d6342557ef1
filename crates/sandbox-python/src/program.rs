use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyModule, PyString};

/// Filename reported in guest tracebacks.
pub(crate) const FILENAME: &str = "<sandbox>";

/// Interpreter functions the host needs while guest code runs.
///
/// Resolved once at boot, from the real modules, so nothing the guest
/// rebinds can change how its own code is compiled or reported.
pub(crate) struct HostFunctions {
    parse: PyObject,
    compile: PyObject,
    exec: PyObject,
    eval: PyObject,
    expr_node: PyObject,
    expression_node: PyObject,
    format_exception: PyObject,
    string_io: PyObject,
    collect: PyObject,
    line_cache: Py<PyDict>,
}

/// A submission compiled for execution. `tail` holds the trailing expression,
/// if any, compiled separately so its value can be reported.
struct Program<'py> {
    body: Bound<'py, PyAny>,
    tail: Option<Bound<'py, PyAny>>,
}

impl HostFunctions {
    pub(crate) fn load(py: Python<'_>, builtins: &Bound<'_, PyModule>) -> PyResult<Self> {
        let ast = py.import_bound("ast")?;
        let traceback = py.import_bound("traceback")?;
        let linecache = py.import_bound("linecache")?;
        let io = py.import_bound("io")?;
        let gc = py.import_bound("gc")?;

        Ok(Self {
            parse: ast.getattr("parse")?.unbind(),
            compile: builtins.getattr("compile")?.unbind(),
            exec: builtins.getattr("exec")?.unbind(),
            eval: builtins.getattr("eval")?.unbind(),
            expr_node: ast.getattr("Expr")?.unbind(),
            expression_node: ast.getattr("Expression")?.unbind(),
            format_exception: traceback.getattr("format_exception")?.unbind(),
            string_io: io.getattr("StringIO")?.unbind(),
            collect: gc.getattr("collect")?.unbind(),
            line_cache: linecache.getattr("cache")?.downcast_into::<PyDict>()?.unbind(),
        })
    }

    /// Fresh, empty `sys.stdin` replacement.
    pub(crate) fn empty_stdin<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        self.string_io.bind(py).call0()
    }

    /// Run `source` as a program in `namespace`.
    ///
    /// Returns `str()` of the trailing expression when it is not `None`.
    pub(crate) fn execute(
        &self,
        py: Python<'_>,
        source: &str,
        namespace: &Bound<'_, PyDict>,
    ) -> PyResult<Option<String>> {
        self.register_source(py, source)?;
        let program = self.compile(py, source)?;

        self.exec.bind(py).call1((program.body, namespace))?;
        let Some(tail) = program.tail else {
            return Ok(None);
        };
        let value = self.eval.bind(py).call1((tail, namespace))?;
        if value.is_none() {
            return Ok(None);
        }
        Ok(Some(value.str()?.to_str()?.to_owned()))
    }

    fn compile<'py>(&self, py: Python<'py>, source: &str) -> PyResult<Program<'py>> {
        let compile = self.compile.bind(py);
        let tree = self.parse.bind(py).call1((source, FILENAME))?;
        let body = tree.getattr("body")?.downcast_into::<PyList>()?;

        let mut tail = None;
        if let Some(last_index) = body.len().checked_sub(1) {
            let last = body.get_item(last_index)?;
            if last.is_instance(self.expr_node.bind(py))? {
                body.del_item(last_index)?;
                let expression = self
                    .expression_node
                    .bind(py)
                    .call1((last.getattr("value")?,))?;
                tail = Some(compile.call1((expression, FILENAME, "eval"))?);
            }
        }

        let body = compile.call1((tree, FILENAME, "exec"))?;
        Ok(Program { body, tail })
    }

    /// Make the submission's lines available to traceback formatting.
    fn register_source(&self, py: Python<'_>, source: &str) -> PyResult<()> {
        let lines: Vec<String> = source.split_inclusive('\n').map(str::to_owned).collect();
        self.line_cache
            .bind(py)
            .set_item(FILENAME, (source.len(), py.None(), lines, FILENAME))
    }

    /// Full traceback text, as the interpreter would print it.
    pub(crate) fn format_exception(&self, py: Python<'_>, err: &PyErr) -> PyResult<String> {
        let lines = self.format_exception.bind(py).call1((
            err.get_type_bound(py),
            err.value_bound(py),
            err.traceback_bound(py),
        ))?;
        PyString::new_bound(py, "")
            .call_method1("join", (lines,))?
            .extract()
    }

    /// Run the cycle collector so finalizers fire inside the current capture.
    pub(crate) fn collect_garbage(&self, py: Python<'_>) -> PyResult<()> {
        self.collect.bind(py).call0().map(drop)
    }
}
