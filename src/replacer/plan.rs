//! The displacement choreography run by a replacer job.
//!
//! A [`Plan`] is an ordered list of [`Step`]s that only run while the
//! session pod exists. The job always deletes itself afterwards. The plan
//! is rendered to the bash script the job executes; tests run the same plan
//! against a simulated control plane.

use crate::model::Kind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ScaleToZero,
    AwaitPodDeleted,
    RestoreScale,
    AwaitPodReady,
    PointSelectorAtSession,
    /// Blocks until the session pod carries a deletion timestamp.
    AwaitPodDeleting,
    RestoreSelector,
}

impl Step {
    fn command(self) -> &'static str {
        match self {
            Step::ScaleToZero => "$kubectl scale --replicas=0 $KIND/$NAME",
            Step::AwaitPodDeleted => "$kubectl wait --for=delete pod/kdo-$HASH --timeout=-1s",
            Step::RestoreScale => {
                "$kubectl scale --current-replicas=0 --replicas=$REPLICAS $KIND/$NAME"
            }
            Step::AwaitPodReady => {
                "$kubectl wait --for condition=Ready pod/kdo-$HASH --timeout=-1s"
            }
            Step::PointSelectorAtSession => "$kubectl set selector service $NAME kdo-hash=$HASH",
            Step::AwaitPodDeleting => {
                "$kubectl get pod kdo-$HASH -o jsonpath='{.metadata.deletionTimestamp}' -w | read -n1 -s"
            }
            Step::RestoreSelector => "$kubectl set selector service $NAME \"$SELECTOR\"",
        }
    }
}

const WORKLOAD: &[Step] = &[Step::ScaleToZero, Step::AwaitPodDeleted, Step::RestoreScale];

const SERVICE: &[Step] = &[
    Step::AwaitPodReady,
    Step::PointSelectorAtSession,
    Step::AwaitPodDeleting,
    Step::RestoreSelector,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    steps: &'static [Step],
}

impl Plan {
    /// Plan for displacing an object of `kind`, if displacement means
    /// anything for it.
    pub fn for_kind(kind: Kind) -> Option<Self> {
        if kind.is_scalable() {
            Some(Plan { steps: WORKLOAD })
        } else if kind == Kind::Service {
            Some(Plan { steps: SERVICE })
        } else {
            None
        }
    }

    pub fn steps(&self) -> &'static [Step] {
        self.steps
    }

    /// Bash script reading `NAMESPACE`, `KIND`, `NAME`, `REPLICAS`,
    /// `SELECTOR` and `HASH` from the environment.
    pub fn script(&self) -> String {
        let mut s = String::from("set -ex\nkubectl=\"kubectl -n $NAMESPACE\"\n");
        s.push_str("if [ -n \"$($kubectl get pod kdo-$HASH --ignore-not-found)\" ]; then\n");
        for step in self.steps {
            s.push_str("  ");
            s.push_str(step.command());
            s.push('\n');
        }
        s.push_str("fi\n$kubectl delete job kdo-replacer-$HASH --wait=false\n");
        s
    }
}

#[cfg(test)]
pub(crate) mod sim {
    //! A control plane that executes a plan and refuses operations issued
    //! out of order.

    use super::{Plan, Step};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum PodState {
        Absent,
        Pending,
        Ready,
        Deleting,
        Deleted,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct SimCluster {
        pub hash: String,
        pub pod: PodState,
        pub replicas: i64,
        pub selector: String,
        pub job: bool,
        /// Workload state sampled while the session pod was live.
        pub during: Vec<(i64, String)>,
    }

    impl SimCluster {
        pub(crate) fn new(hash: &str, pod: PodState, replicas: i64, selector: &str) -> Self {
            Self {
                hash: hash.to_string(),
                pod,
                replicas,
                selector: selector.to_string(),
                job: true,
                during: Vec::new(),
            }
        }

        fn pod_exists(&self) -> bool {
            matches!(self.pod, PodState::Pending | PodState::Ready)
        }

        /// The user's session ends: its pod is deleted.
        fn end_session(&mut self) {
            self.during.push((self.replicas, self.selector.clone()));
            self.pod = PodState::Deleting;
        }

        fn step(&mut self, step: Step, replicas: i64, selector: &str) -> Result<(), String> {
            if !self.job {
                return Err(format!("{step:?} after the job deleted itself"));
            }
            match step {
                Step::ScaleToZero => {
                    if !self.pod_exists() {
                        return Err("scaled to zero without a session pod".into());
                    }
                    self.replicas = 0;
                }
                Step::PointSelectorAtSession => {
                    if self.pod != PodState::Ready {
                        return Err("selector swapped before the session pod was ready".into());
                    }
                    self.selector = format!("kdo-hash={}", self.hash);
                }
                Step::AwaitPodReady => {
                    if self.pod == PodState::Pending {
                        self.pod = PodState::Ready;
                    }
                }
                Step::AwaitPodDeleting => {
                    if self.pod_exists() {
                        self.end_session();
                    }
                }
                Step::AwaitPodDeleted => {
                    if self.pod_exists() {
                        self.end_session();
                    }
                    self.pod = PodState::Deleted;
                }
                Step::RestoreScale => {
                    if self.pod != PodState::Deleted {
                        return Err("scale restored while the session pod was live".into());
                    }
                    if self.replicas != 0 {
                        return Err("scale restored from a non-zero width".into());
                    }
                    self.replicas = replicas;
                }
                Step::RestoreSelector => {
                    if self.pod_exists() {
                        return Err("selector restored while the session pod was live".into());
                    }
                    self.selector = selector.to_string();
                }
            }
            Ok(())
        }

        /// Execute the job's script with the environment it would receive.
        pub(crate) fn run(&mut self, plan: Plan, replicas: i64, selector: &str) -> Result<(), String> {
            if self.pod_exists() {
                for step in plan.steps() {
                    self.step(*step, replicas, selector)?;
                }
            }
            self.job = false;
            Ok(())
        }
    }
}
