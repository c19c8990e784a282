//! Leveled user-facing output.
//!
//! Every component receives an [`Output`] handle instead of writing to the
//! terminal directly. The handle is cheap to clone and safe to use from
//! background tasks: one mutex guards handler dispatch and the registry of
//! open operations.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Quiet,
    Normal,
    Verbose,
    Debug,
}

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
    Aborted,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Failed => "failed",
            Outcome::Aborted => "aborted",
        }
    }
}

/// Renders output events. Calls are serialized by [`Output`].
pub(crate) trait Handler: Send {
    fn message(&mut self, level: Level, text: &str);
    fn warning(&mut self, text: &str);
    fn error(&mut self, text: &str);
    fn start(&mut self, label: &str);
    fn progress(&mut self, label: &str, text: &str);
    fn end(&mut self, label: &str, outcome: Outcome);
    fn flush(&mut self) {}
}

/// Line-oriented handler writing to stderr.
struct ConsoleHandler {
    err: std::io::LineWriter<std::io::Stderr>,
}

impl Handler for ConsoleHandler {
    fn message(&mut self, _level: Level, text: &str) {
        let _ = writeln!(self.err, "{}", text);
    }

    fn warning(&mut self, text: &str) {
        let _ = writeln!(self.err, "Warning: {}", text);
    }

    fn error(&mut self, text: &str) {
        let _ = writeln!(self.err, "Error: {}", text);
    }

    fn start(&mut self, label: &str) {
        let _ = writeln!(self.err, "{}...", label);
    }

    fn progress(&mut self, label: &str, text: &str) {
        let _ = writeln!(self.err, "{}: {}", label, text);
    }

    fn end(&mut self, label: &str, outcome: Outcome) {
        let _ = writeln!(self.err, "{}: {}", label, outcome.as_str());
    }

    fn flush(&mut self) {
        let _ = self.err.flush();
    }
}

struct State {
    handler: Option<Box<dyn Handler>>,
    next_id: u64,
    open: BTreeMap<u64, String>,
}

#[derive(Clone)]
pub struct Output {
    level: Level,
    state: Arc<Mutex<State>>,
}

impl Output {
    pub(crate) fn with_handler(level: Level, handler: Box<dyn Handler>) -> Self {
        Self {
            level,
            state: Arc::new(Mutex::new(State {
                handler: Some(handler),
                next_id: 0,
                open: BTreeMap::new(),
            })),
        }
    }

    /// Output to stderr at the given level.
    pub fn console(level: Level) -> Self {
        Self::with_handler(
            level,
            Box::new(ConsoleHandler {
                err: std::io::LineWriter::new(std::io::stderr()),
            }),
        )
    }

    pub fn level(&self) -> Level {
        self.level
    }

    fn message(&self, level: Level, text: &str) {
        if self.level < level {
            return;
        }
        if let Some(h) = self.state.lock().handler.as_mut() {
            h.message(level, text);
        }
    }

    pub fn info(&self, text: impl AsRef<str>) {
        self.message(Level::Normal, text.as_ref());
    }

    pub fn verbose(&self, text: impl AsRef<str>) {
        self.message(Level::Verbose, text.as_ref());
    }

    pub fn debug(&self, text: impl AsRef<str>) {
        tracing::debug!("{}", text.as_ref());
        self.message(Level::Debug, text.as_ref());
    }

    pub fn warning(&self, text: impl AsRef<str>) {
        if self.level == Level::Quiet {
            return;
        }
        if let Some(h) = self.state.lock().handler.as_mut() {
            h.warning(text.as_ref());
        }
    }

    pub fn error(&self, text: impl AsRef<str>) {
        if let Some(h) = self.state.lock().handler.as_mut() {
            h.error(text.as_ref());
        }
    }

    /// Report the start of an operation.
    ///
    /// Quiet output and closed output still hand back a working
    /// [`Operation`]; it just renders nothing.
    pub fn start(&self, label: impl Into<String>) -> Operation {
        let label = label.into();
        let mut id = None;
        if self.level > Level::Quiet {
            let mut state = self.state.lock();
            if let Some(h) = state.handler.as_mut() {
                h.start(&label);
                let next = state.next_id;
                state.next_id += 1;
                state.open.insert(next, label.clone());
                id = Some(next);
            }
        }
        Operation {
            inner: Arc::new(OpInner {
                id,
                label,
                output: self.clone(),
                ended: AtomicBool::new(id.is_none()),
            }),
        }
    }

    /// Run `f` inside an operation, marking it done or failed by its result.
    pub async fn run<T, E, F, Fut>(&self, label: impl Into<String>, f: F) -> Result<T, E>
    where
        F: FnOnce(Operation) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let op = self.start(label);
        let result = f(op.clone()).await;
        match result {
            Ok(_) => op.done(),
            Err(_) => op.failed(),
        }
        result
    }

    /// Abort every open operation and detach the handler.
    pub fn close(&self) {
        let mut state = self.state.lock();
        let open = std::mem::take(&mut state.open);
        if let Some(mut h) = state.handler.take() {
            for label in open.values() {
                h.end(label, Outcome::Aborted);
            }
            h.flush();
        }
    }

    fn end(&self, id: u64, label: &str, outcome: Outcome) {
        let mut state = self.state.lock();
        if state.open.remove(&id).is_none() {
            return;
        }
        if let Some(h) = state.handler.as_mut() {
            h.end(label, outcome);
        }
    }
}

struct OpInner {
    id: Option<u64>,
    label: String,
    output: Output,
    ended: AtomicBool,
}

impl OpInner {
    fn finish(&self, outcome: Outcome) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.id {
            self.output.end(id, &self.label, outcome);
        }
    }
}

impl Drop for OpInner {
    fn drop(&mut self) {
        self.finish(Outcome::Aborted);
    }
}

/// A running operation. Clones share one underlying operation, so a
/// background task can keep reporting progress after the caller moves on.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OpInner>,
}

impl Operation {
    pub fn progress(&self, text: impl AsRef<str>) {
        let inner = &self.inner;
        if inner.ended.load(Ordering::SeqCst) {
            return;
        }
        let mut state = inner.output.state.lock();
        if let Some(h) = state.handler.as_mut() {
            h.progress(&inner.label, text.as_ref());
        }
    }

    pub fn done(&self) {
        self.inner.finish(Outcome::Done);
    }

    pub fn failed(&self) {
        self.inner.finish(Outcome::Failed);
    }
}
