//! Port forwarding into pods.

use crate::kubectl::{Kubectl, KubectlError, LineStream};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

const FORWARDING_PREFIX: &str = "Forwarding from 127.0.0.1:";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("portforward: {0}")]
    Kubectl(#[from] KubectlError),

    #[error("portforward: ended before forwarding started")]
    Ended,
}

/// An active forward. Dropping it stops forwarding.
pub struct Forward {
    stream: LineStream,
}

impl Forward {
    pub fn stop(self) {
        self.stream.cancel();
    }
}

/// Local port from a `Forwarding from 127.0.0.1:PORT -> REMOTE` line.
fn local_port(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(FORWARDING_PREFIX)?;
    Some(rest.split(" -> ").next().unwrap_or(rest))
}

/// Start `port-forward` and wait until `ready` accepts a line or the
/// command ends, whichever comes first.
async fn start(
    k: &dyn Kubectl,
    args: &[&str],
    mut ready: impl FnMut(&str) -> bool + Send + 'static,
) -> Result<Forward, ForwardError> {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    let mut stream = k.stream_lines(
        args,
        Box::new(move |line| {
            if ready(line) {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            }
        }),
    );

    let started = tokio::select! {
        biased;
        Ok(()) = rx => true,
        res = stream.wait() => {
            res?;
            false
        }
    };
    if started {
        Ok(Forward { stream })
    } else {
        Err(ForwardError::Ended)
    }
}

/// Forward `specs` (`[LOCAL:]REMOTE`) to `pod` in the current namespace,
/// returning once every port is being forwarded.
pub async fn start_all(k: &dyn Kubectl, pod: &str, specs: &[String]) -> Result<Forward, ForwardError> {
    let target = format!("pod/{pod}");
    let mut args = vec!["port-forward", target.as_str()];
    args.extend(specs.iter().map(String::as_str));

    let wanted = specs.len();
    let mut forwarded = 0;
    start(k, &args, move |line| {
        if local_port(line).is_some() {
            forwarded += 1;
        }
        forwarded == wanted
    })
    .await
}

/// Forward a random local port to `port` on `pod` in `namespace`, returning
/// the local port chosen.
pub async fn start_one(
    k: &dyn Kubectl,
    namespace: &str,
    pod: &str,
    port: u16,
) -> Result<(String, Forward), ForwardError> {
    let target = format!("pod/{pod}");
    let remote = format!(":{port}");
    let local = Arc::new(Mutex::new(String::new()));
    let found = local.clone();
    let forward = start(
        k,
        &["--namespace", namespace, "port-forward", &target, &remote],
        move |line| match local_port(line) {
            Some(p) => {
                *found.lock() = p.to_string();
                true
            }
            None => false,
        },
    )
    .await?;
    let port = local.lock().clone();
    Ok((port, forward))
}
