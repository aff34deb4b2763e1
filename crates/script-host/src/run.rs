//! Run scheduling
//!
//! A [`Run`] multiplexes many script instances over the tokio runtime. Each
//! instance gets its own sandbox, context and cancellation token; the only
//! thing they share is the run's [`SharedStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use hostbridge_protocol::{InstanceId, RunId, TestStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::{Collaborators, InstanceContext, InstanceSetup};
use crate::runtime::{CancellationToken, ScriptHost};
use crate::shared::SharedStore;
use crate::{InstanceReport, ScriptConfig, ScriptEvent, ScriptScope, ScriptStatus};

/// One script instance to run: host inputs plus its script chain
#[derive(Debug, Clone, Default)]
pub struct ScriptInstance {
    pub setup: InstanceSetup,
    pub scopes: Vec<ScriptScope>,
}

impl ScriptInstance {
    /// Instance running a single script
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            scopes: vec![ScriptScope::new(name.clone(), source)],
            setup: InstanceSetup::new(name),
        }
    }

    #[must_use]
    pub fn with_scopes(setup: InstanceSetup, scopes: Vec<ScriptScope>) -> Self {
        Self { setup, scopes }
    }
}

/// Handle to an instance running in the background
pub struct RunningInstance {
    context: Arc<InstanceContext>,
    cancellation: CancellationToken,
    handle: JoinHandle<InstanceReport>,
}

impl RunningInstance {
    pub fn id(&self) -> InstanceId {
        self.context.id()
    }

    /// Abort the instance; its suspended operation unwinds with `Cancelled`
    pub fn cancel(&self) {
        tracing::info!(instance = %self.context.id(), "Cancelling script instance");
        self.cancellation.cancel();
    }

    /// Wait for the instance to finish and return its report
    pub async fn join(self) -> InstanceReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(instance = %self.context.id(), error = %e, "Script task failed");
                self.context
                    .finish(ScriptStatus::Error {
                        message: e.to_string(),
                    })
                    .await
            }
        }
    }
}

/// Result of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub instances: Vec<InstanceReport>,
    /// Set when any instance called `test_skip`
    pub skipped: bool,
    /// Shared entries as they stood when the last instance finished
    pub shared: BTreeMap<String, Value>,
}

impl RunReport {
    /// Combined test status
    ///
    /// A skip anywhere skips the whole run; otherwise any failure fails it.
    #[must_use]
    pub fn status(&self) -> TestStatus {
        if self.skipped {
            return TestStatus::Skip;
        }
        let statuses: Vec<TestStatus> = self.instances.iter().map(|i| i.tests.status).collect();
        if statuses.contains(&TestStatus::Fail) {
            TestStatus::Fail
        } else if statuses.contains(&TestStatus::Pass) {
            TestStatus::Pass
        } else {
            TestStatus::None
        }
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.instances.iter().all(|i| i.status.is_success())
    }
}

/// A set of concurrently running instances sharing one [`SharedStore`]
pub struct Run {
    id: RunId,
    config: ScriptConfig,
    shared: SharedStore,
    collaborators: Collaborators,
    events: Option<mpsc::Sender<ScriptEvent>>,
}

impl Run {
    pub fn new(config: ScriptConfig, collaborators: Collaborators) -> Self {
        Self {
            id: RunId::new(),
            config,
            shared: SharedStore::new(),
            collaborators,
            events: None,
        }
    }

    /// Forward every instance's events to `events`
    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<ScriptEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn shared(&self) -> &SharedStore {
        &self.shared
    }

    /// Start an instance in the background
    pub fn spawn(&self, instance: ScriptInstance) -> RunningInstance {
        let mut context = InstanceContext::new(
            instance.setup,
            self.config.clone(),
            self.shared.clone(),
            self.collaborators.clone(),
        );
        if let Some(events) = &self.events {
            context = context.with_events(events.clone());
        }
        let context = Arc::new(context);

        let host = ScriptHost::new(self.config.clone());
        let cancellation = host.cancellation_token();
        let scopes = instance.scopes;
        let task_context = Arc::clone(&context);
        tracing::debug!(run = %self.id, instance = %context.id(), "Spawning script instance");
        let handle = tokio::spawn(async move { host.execute(&scopes, task_context).await });

        RunningInstance {
            context,
            cancellation,
            handle,
        }
    }

    /// Run all instances concurrently and collect their reports in input order
    pub async fn execute(&self, instances: Vec<ScriptInstance>) -> RunReport {
        tracing::info!(run = %self.id, instances = instances.len(), "Starting run");
        let running: Vec<RunningInstance> = instances.into_iter().map(|i| self.spawn(i)).collect();

        let mut reports = Vec::with_capacity(running.len());
        for instance in running {
            reports.push(instance.join().await);
        }

        let report = RunReport {
            run_id: self.id,
            skipped: reports.iter().any(|r| r.tests.skipped),
            instances: reports,
            shared: self.shared.snapshot(),
        };
        tracing::info!(run = %self.id, status = ?report.status(), "Run finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::mocks::{collaborators, MockNetwork};
    use serde_json::json;
    use std::time::Duration;

    fn run() -> Run {
        Run::new(ScriptConfig::default(), collaborators(MockNetwork::ok(200, "{}")))
    }

    async fn until_waiters(run: &Run, key: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while run.shared().waiter_count(key) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("waiters registered");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn consumer_resumes_when_producer_shares_token() {
        let consumer = ScriptInstance::new(
            "consumer",
            r#"
            const token = await host.wait_shared("token");
            assert("abc123", token);
            assert("abc123", host.get_shared("token"));
            "#,
        );
        let producer = ScriptInstance::new(
            "producer",
            r#"
            await sleep(50);
            host.set_shared("token", "abc123");
            "#,
        );

        let report = run().execute(vec![consumer, producer]).await;

        assert!(report.all_succeeded());
        assert_eq!(report.instances[0].name, "consumer");
        assert_eq!(report.instances[0].tests.passed_count(), 2);
        assert_eq!(report.shared.get("token"), Some(&json!("abc123")));
        assert_eq!(report.status(), TestStatus::Pass);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn structured_values_cross_instances() {
        let run = run();
        let reader = run.spawn(ScriptInstance::new(
            "reader",
            r#"
            const user = await host.wait_shared("user");
            assert({id: 7, roles: ["admin"]}, user);
            "#,
        ));
        until_waiters(&run, "user", 1).await;
        let writer = run.spawn(ScriptInstance::new(
            "writer",
            r#"host.set_shared("user", {id: 7, roles: ["admin"]});"#,
        ));

        assert!(writer.join().await.status.is_success());
        let reader = reader.join().await;
        assert!(reader.status.is_success());
        assert_eq!(reader.tests.failed_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelling_one_waiter_leaves_others_parked() {
        let run = run();
        let doomed = run.spawn(ScriptInstance::new(
            "doomed",
            r#"await host.wait_shared("k"); console.log("resumed");"#,
        ));
        let survivor = run.spawn(ScriptInstance::new(
            "survivor",
            r#"console.log("got " + await host.wait_shared("k"));"#,
        ));
        until_waiters(&run, "k", 2).await;

        doomed.cancel();
        let doomed = doomed.join().await;
        assert_eq!(doomed.status, ScriptStatus::Cancelled);
        assert!(doomed.logs.iter().all(|l| l.message != "resumed"));
        assert_eq!(run.shared().waiter_count("k"), 1);

        run.shared().set("k", &json!("v"));
        let survivor = survivor.join().await;
        assert!(survivor.status.is_success());
        assert!(survivor.logs.iter().any(|l| l.message == "got v"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn events_reach_the_host() {
        let (tx, mut rx) = mpsc::channel(64);
        let run = run().with_events(tx);
        let report = run
            .execute(vec![
                ScriptInstance::new("a", r#"console.log("from a");"#),
                ScriptInstance::new("b", r#"console.log("from b");"#),
            ])
            .await;
        drop(run);

        let mut finished = 0;
        let mut logs = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ScriptEvent::Log { entry, .. } => logs.push(entry.message),
                ScriptEvent::Finished { status, .. } => {
                    assert!(status.is_success());
                    finished += 1;
                }
            }
        }
        assert_eq!(finished, 2);
        assert!(logs.contains(&"from a".to_string()));
        assert!(logs.contains(&"from b".to_string()));
        assert_eq!(report.status(), TestStatus::None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failing_instance_fails_the_run() {
        let report = run()
            .execute(vec![
                ScriptInstance::new("ok", "assert(1, 1);"),
                ScriptInstance::new("broken", r#"host.no_such_thing();"#),
            ])
            .await;
        assert!(!report.all_succeeded());
        assert_eq!(report.instances[0].tests.status, TestStatus::Pass);
        assert_eq!(report.instances[1].tests.status, TestStatus::Fail);
        assert!(report.instances[1].abort_reason().unwrap().contains("TypeError"));
        assert_eq!(report.status(), TestStatus::Fail);
        assert!(!report.skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_skip_skips_the_whole_run() {
        let report = run()
            .execute(vec![
                ScriptInstance::new("skipper", "test_skip();"),
                ScriptInstance::new("other", "assert(1, 2);"),
            ])
            .await;
        assert!(report.all_succeeded());
        assert_eq!(report.instances[0].tests.status, TestStatus::Skip);
        assert_eq!(report.instances[1].tests.status, TestStatus::Fail);
        assert!(report.skipped);
        assert_eq!(report.status(), TestStatus::Skip);
    }
}
