//! Progress from cluster events about one pod.

use super::compose::AWAIT_BUILD_CONTAINER;
use crate::kubectl::{Kubectl, LineStream};
use crate::output::Operation;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Deserialize)]
struct WatchEvent {
    object: Event,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Event {
    first_timestamp: Option<String>,
    event_time: Option<String>,
    #[serde(default)]
    message: String,
}

/// Turn one line of the event watch into a progress line, dropping events
/// that happened before `since` and anything unparseable.
pub(crate) fn progress_line(line: &str, since: OffsetDateTime) -> Option<String> {
    let event: WatchEvent = serde_json::from_str(line).ok()?;
    let event = event.object;
    let stamp = event.first_timestamp.or(event.event_time)?;
    let at = OffsetDateTime::parse(&stamp, &Rfc3339).ok()?;
    if at < since {
        return None;
    }

    let mut chars = event.message.chars();
    let first = chars.next()?;
    let msg: String = first.to_lowercase().chain(chars).collect();
    if msg == format!("started container {AWAIT_BUILD_CONTAINER}") {
        return Some("awaiting image build".to_string());
    }
    Some(msg)
}

/// Background subscription forwarding events about a pod to an operation.
/// Stops when dropped.
pub struct Tracker {
    stream: LineStream,
}

impl Tracker {
    pub fn start(k: &dyn Kubectl, pod: &str, op: &Operation) -> Self {
        let now = OffsetDateTime::now_utc();
        // Event timestamps only carry whole seconds.
        let since = now.replace_nanosecond(0).unwrap_or(now);
        Self::since(k, pod, op, since)
    }

    pub(crate) fn since(k: &dyn Kubectl, pod: &str, op: &Operation, since: OffsetDateTime) -> Self {
        let op = op.clone();
        let raw = format!("--raw=/api/v1/events?fieldSelector=involvedObject.name={pod}&watch=1");
        let stream = k.stream_lines(
            &["get", &raw],
            Box::new(move |line| {
                if let Some(msg) = progress_line(line, since) {
                    op.progress(msg);
                }
            }),
        );
        Self { stream }
    }

    pub fn stop(self) {
        self.stream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubectl::fake::FakeKubectl;
    use crate::output::{recording, Level};
    use time::macros::datetime;

    const SINCE: OffsetDateTime = datetime!(2024-05-01 10:00:00 UTC);

    fn event(ts: &str, msg: &str) -> String {
        serde_json::json!({
            "type": "ADDED",
            "object": {"firstTimestamp": ts, "message": msg}
        })
        .to_string()
    }

    #[test]
    fn historical_events_are_dropped() {
        assert_eq!(
            progress_line(&event("2024-05-01T09:59:59Z", "Scheduled"), SINCE),
            None
        );
        assert_eq!(
            progress_line(&event("2024-05-01T10:00:00Z", "Pulling image \"alpine\""), SINCE)
                .as_deref(),
            Some("pulling image \"alpine\"")
        );
    }

    #[test]
    fn build_gate_is_rewritten() {
        assert_eq!(
            progress_line(
                &event("2024-05-01T10:00:05Z", "Started container kdo-await-image-build"),
                SINCE
            )
            .as_deref(),
            Some("awaiting image build")
        );
    }

    #[test]
    fn junk_is_ignored() {
        assert_eq!(progress_line("not json", SINCE), None);
        assert_eq!(progress_line(r#"{"object": {"message": "x"}}"#, SINCE), None);
        assert_eq!(progress_line(&event("2024-05-01T10:00:05Z", ""), SINCE), None);
    }

    #[tokio::test]
    async fn tracker_reports_to_operation() {
        let k = FakeKubectl::new();
        k.stream(
            &["get"],
            &[
                &event("2024-05-01T09:00:00Z", "Old news"),
                &event("2024-05-01T10:00:01Z", "Created container web"),
            ],
        );
        let (out, rec) = recording::output(Level::Normal);
        let op = out.start("Creating pod");
        let tracker = Tracker::since(&k, "kdo-h", &op, SINCE);
        tracker.stop();
        op.done();
        assert_eq!(
            rec.lines(),
            vec![
                "Creating pod...",
                "Creating pod: created container web",
                "Creating pod: done"
            ]
        );
        assert_eq!(
            k.calls()[0],
            vec![
                "get",
                "--raw=/api/v1/events?fieldSelector=involvedObject.name=kdo-h&watch=1"
            ]
        );
    }
}
