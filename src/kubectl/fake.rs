//! Scripted stand-in for the control plane used by unit tests.

use super::{Kubectl, KubectlError, LineFn, LineStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Stdout(String),
    Stderr(String),
}

struct Rule {
    prefix: Vec<String>,
    replies: VecDeque<Reply>,
}

/// Answers invocations by longest matching argument prefix. A rule with
/// several replies hands them out in order and then repeats the last one.
/// Unmatched invocations succeed with empty output.
#[derive(Default)]
pub(crate) struct FakeKubectl {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
    inputs: Mutex<Vec<String>>,
    streams: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

impl FakeKubectl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, prefix: &[&str], stdout: impl Into<String>) -> &Self {
        self.script(prefix, vec![Reply::Stdout(stdout.into())])
    }

    pub(crate) fn fail(&self, prefix: &[&str], stderr: impl Into<String>) -> &Self {
        self.script(prefix, vec![Reply::Stderr(stderr.into())])
    }

    pub(crate) fn script(&self, prefix: &[&str], replies: Vec<Reply>) -> &Self {
        self.rules.lock().push(Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            replies: replies.into(),
        });
        self
    }

    /// Lines a streaming invocation with this prefix will emit.
    pub(crate) fn stream(&self, prefix: &[&str], lines: &[&str]) -> &Self {
        self.streams.lock().push((
            prefix.iter().map(|s| s.to_string()).collect(),
            lines.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Number of recorded invocations starting with `prefix`.
    pub(crate) fn count(&self, prefix: &[&str]) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| starts_with(c, prefix))
            .count()
    }

    /// Position of the first invocation starting with `prefix`.
    pub(crate) fn position(&self, prefix: &[&str]) -> Option<usize> {
        self.calls.lock().iter().position(|c| starts_with(c, prefix))
    }

    pub(crate) fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }

    fn reply(&self, args: &[&str]) -> Result<String, KubectlError> {
        self.calls
            .lock()
            .push(args.iter().map(|s| s.to_string()).collect());

        let mut rules = self.rules.lock();
        let best = rules
            .iter_mut()
            .filter(|r| starts_with_owned(args, &r.prefix))
            .max_by_key(|r| r.prefix.len());
        let reply = match best {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front(),
            Some(rule) => rule.replies.front().cloned(),
            None => None,
        };
        match reply {
            Some(Reply::Stdout(s)) => Ok(s),
            Some(Reply::Stderr(stderr)) => Err(KubectlError::Failed {
                program: "kubectl".into(),
                code: Some(1),
                stderr,
            }),
            None => Ok(String::new()),
        }
    }
}

fn starts_with(call: &[String], prefix: &[&str]) -> bool {
    call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b)
}

fn starts_with_owned(call: &[&str], prefix: &[String]) -> bool {
    call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b)
}

#[async_trait]
impl Kubectl for FakeKubectl {
    async fn run(&self, args: &[&str]) -> Result<(), KubectlError> {
        self.reply(args).map(|_| ())
    }

    async fn run_with_input(&self, input: &[u8], args: &[&str]) -> Result<(), KubectlError> {
        self.inputs
            .lock()
            .push(String::from_utf8_lossy(input).into_owned());
        self.reply(args).map(|_| ())
    }

    async fn capture_string(&self, args: &[&str]) -> Result<String, KubectlError> {
        self.reply(args)
    }

    fn stream_lines(&self, args: &[&str], mut on_line: LineFn) -> LineStream {
        self.calls
            .lock()
            .push(args.iter().map(|s| s.to_string()).collect());
        let lines = self
            .streams
            .lock()
            .iter()
            .find(|(prefix, _)| starts_with_owned(args, prefix))
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default();
        for line in &lines {
            on_line(line);
        }
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        LineStream::new(CancellationToken::new(), rx)
    }

    async fn replace_process(&self, args: &[&str]) -> Result<(), KubectlError> {
        self.reply(args).map(|_| ())
    }
}
