//! Per-instance host context
//!
//! One [`InstanceContext`] exists per running script instance. It owns all
//! instance-scoped state (environment view, request mutations, logs, test
//! aggregation) and reaches run-wide state only through the [`SharedStore`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hostbridge_connectors::{ConnectorError, NetworkClient, NlpEngine};
use hostbridge_protocol::{
    EnvOverride, HeaderAddition, HttpResponse, InstanceId, KeyValue, LogEntry, LogLevel,
    ParamAddition, TestReport, TestStatus,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::aggregator::TestAggregator;
use crate::lock::MutexExt;
use crate::normalize::normalize_response;
use crate::registry::{HostOps, OpCall};
use crate::shared::SharedStore;
use crate::{BridgeError, InstanceReport, ScriptConfig, ScriptEvent, ScriptStatus};

/// Host-provided inputs of one instance
#[derive(Debug, Clone, Default)]
pub struct InstanceSetup {
    pub name: String,
    /// Structured test case data returned by `testcase()`
    pub testcase: Value,
    /// Environment visible to `get_env` before any override
    pub env: BTreeMap<String, String>,
    /// Response of the request under test, for post-request scripts
    pub last_response: Option<HttpResponse>,
}

impl InstanceSetup {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// External collaborators shared by every instance of a run
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn NetworkClient>,
    pub nlp: Arc<dyn NlpEngine>,
}

impl Collaborators {
    pub fn new(network: Arc<dyn NetworkClient>, nlp: Arc<dyn NlpEngine>) -> Self {
        Self { network, nlp }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct InstanceState {
    scope: String,
    env: BTreeMap<String, String>,
    env_overrides: Vec<EnvOverride>,
    headers: Vec<HeaderAddition>,
    params: Vec<ParamAddition>,
    logs: Vec<LogEntry>,
    tests: TestAggregator,
}

/// Explicit per-instance context the sandbox calls into
pub struct InstanceContext {
    id: InstanceId,
    name: String,
    config: ScriptConfig,
    shared: SharedStore,
    collaborators: Collaborators,
    testcase: Value,
    last_response: Option<HttpResponse>,
    events: Option<mpsc::Sender<ScriptEvent>>,
    state: Mutex<InstanceState>,
}

impl InstanceContext {
    pub fn new(
        setup: InstanceSetup,
        config: ScriptConfig,
        shared: SharedStore,
        collaborators: Collaborators,
    ) -> Self {
        let state = InstanceState {
            env: setup.env,
            ..Default::default()
        };
        Self {
            id: InstanceId::new(),
            name: setup.name,
            config,
            shared,
            collaborators,
            testcase: setup.testcase,
            last_response: setup.last_response.map(normalize_response),
            events: None,
            state: Mutex::new(state),
        }
    }

    /// Forward log lines and the final status to `events`
    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<ScriptEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    /// Append a line to the instance log under the current scope
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = {
            let mut state = self.state.lock_or_recover();
            let entry = LogEntry::new(level, state.scope.clone(), message);
            state.logs.push(entry.clone());
            entry
        };
        tracing::trace!(instance = %self.id, scope = %entry.scope, "{}", entry.message);

        if let Some(events) = &self.events {
            let event = ScriptEvent::Log {
                instance_id: self.id,
                entry,
            };
            if events.try_send(event).is_err() {
                tracing::debug!(instance = %self.id, "Dropped script log event");
            }
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.state.lock_or_recover().logs.clone()
    }

    pub fn tests(&self) -> TestReport {
        self.state.lock_or_recover().tests.report()
    }

    /// Snapshot everything recorded so far
    ///
    /// A failed or aborted instance that did not skip reports its tests as
    /// failed, whatever the individual records say.
    pub fn report(&self, status: ScriptStatus) -> InstanceReport {
        let state = self.state.lock_or_recover();
        let mut tests = state.tests.report();
        if !status.is_success() && tests.status != TestStatus::Skip {
            tests.status = TestStatus::Fail;
        }
        InstanceReport {
            instance_id: self.id,
            name: self.name.clone(),
            status,
            tests,
            logs: state.logs.clone(),
            env: state.env.clone(),
            env_overrides: state.env_overrides.clone(),
            headers: state.headers.clone(),
            params: state.params.clone(),
        }
    }

    /// Emit the `Finished` event and hand back the final report
    ///
    /// Log events are best-effort, but `Finished` waits for channel capacity.
    pub async fn finish(&self, status: ScriptStatus) -> InstanceReport {
        match &status {
            ScriptStatus::Success => tracing::info!(instance = %self.id, name = %self.name, "Script finished"),
            other => tracing::warn!(instance = %self.id, name = %self.name, status = ?other, "Script stopped early"),
        }
        if let Some(events) = &self.events {
            let event = ScriptEvent::Finished {
                instance_id: self.id,
                status: status.clone(),
            };
            if events.send(event).await.is_err() {
                tracing::debug!(instance = %self.id, "Event receiver gone before finish");
            }
        }
        self.report(status)
    }

    async fn fetch(&self, request: hostbridge_protocol::HttpRequestSpec) -> Result<Value, BridgeError> {
        tracing::debug!(instance = %self.id, method = %request.method, url = %request.url, "Script fetch");
        let response = self
            .collaborators
            .network
            .perform(request)
            .await
            .map_err(|e| match e {
                ConnectorError::InvalidRequest(reason) => BridgeError::invalid("http_fetch", reason),
                other => BridgeError::Network(other.to_string()),
            })?;
        to_value(&normalize_response(response))
    }

    fn record_assert(&self, passed: bool, message: String) {
        self.state
            .lock_or_recover()
            .tests
            .append_assert(passed, message);
    }

    fn nlp_error(e: ConnectorError) -> BridgeError {
        BridgeError::Host(e.to_string())
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::Host(e.to_string()))
}

#[async_trait]
impl HostOps for InstanceContext {
    async fn invoke(&self, call: OpCall) -> Result<Value, BridgeError> {
        match call {
            OpCall::Sleep { ms } => {
                if ms > self.config.max_sleep_ms {
                    return Err(BridgeError::invalid(
                        "sleep",
                        format!("{ms} ms exceeds the {} ms limit", self.config.max_sleep_ms),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            }
            OpCall::HttpFetch(request) => self.fetch(request).await,
            OpCall::WaitShared { key } => {
                let timeout = Duration::from_millis(self.config.wait_shared_timeout_ms);
                match self.shared.wait_timeout(&key, timeout).await {
                    Ok(value) => {
                        self.log(LogLevel::Info, format!("get shared: `{key}` as `{value}`"));
                        Ok(value)
                    }
                    Err(e) => {
                        self.log(LogLevel::Error, format!("get shared `{key}` failed"));
                        Err(e)
                    }
                }
            }
            OpCall::Log { level, message } => {
                self.log(level, message);
                Ok(Value::Null)
            }
            OpCall::GetTestcase => Ok(self.testcase.clone()),
            OpCall::Response => match &self.last_response {
                Some(response) => to_value(response),
                None => Ok(Value::Null),
            },
            OpCall::SetEnv { key, value } => {
                {
                    let mut state = self.state.lock_or_recover();
                    state.env.insert(key.clone(), value.clone());
                    match state.env_overrides.iter().position(|o| o.key == key) {
                        Some(i) => state.env_overrides[i].value = value.clone(),
                        None => state.env_overrides.push(EnvOverride {
                            key: key.clone(),
                            value: value.clone(),
                        }),
                    }
                }
                self.log(LogLevel::Info, format!("set env: `{key}` as `{value}`"));
                Ok(Value::Null)
            }
            OpCall::GetEnv { key } => {
                let value = self.state.lock_or_recover().env.get(&key).cloned();
                match value {
                    Some(value) => Ok(Value::String(value)),
                    None => {
                        self.log(LogLevel::Warn, format!("get env `{key}` failed"));
                        Ok(Value::Null)
                    }
                }
            }
            OpCall::AddHeader { name, value } => {
                self.state
                    .lock_or_recover()
                    .headers
                    .push(KeyValue::new(name.clone(), value.clone()));
                self.log(LogLevel::Info, format!("add header: `{name}` as `{value}`"));
                Ok(Value::Null)
            }
            OpCall::AddParams { name, value } => {
                self.state
                    .lock_or_recover()
                    .params
                    .push(KeyValue::new(name.clone(), value.clone()));
                self.log(LogLevel::Info, format!("add params: `{name}` as `{value}`"));
                Ok(Value::Null)
            }
            OpCall::SetShared { key, value } => {
                self.shared.set(&key, &value);
                self.log(LogLevel::Info, format!("set shared: `{key}` as `{value}`"));
                Ok(Value::Null)
            }
            OpCall::GetShared { key } => match self.shared.get(&key) {
                Some(value) => {
                    self.log(LogLevel::Info, format!("get shared: `{key}` as `{value}`"));
                    Ok(value)
                }
                None => {
                    self.log(LogLevel::Warn, format!("get shared `{key}` failed"));
                    Ok(Value::Null)
                }
            },
            OpCall::OpenTest { name } => {
                self.state.lock_or_recover().tests.open_test(&name);
                Ok(Value::Null)
            }
            OpCall::CloseTest { name } => {
                self.state.lock_or_recover().tests.close_test(&name);
                Ok(Value::Null)
            }
            OpCall::AppendAssert { passed, message } => {
                self.record_assert(passed, message);
                Ok(Value::Null)
            }
            OpCall::TestSkip => {
                self.state.lock_or_recover().tests.test_skip();
                Ok(Value::Null)
            }
            OpCall::Assert { expect, actual } => {
                let passed = expect == actual;
                let message = if passed {
                    format!("Expect equal actual is {expect}")
                } else {
                    format!("Expect is {expect} but actual is {actual}")
                };
                self.record_assert(passed, message);
                Ok(Value::Bool(passed))
            }
            OpCall::AssertNlp {
                expect,
                actual,
                threshold,
            } => {
                let score = self
                    .collaborators
                    .nlp
                    .similarity(&expect, &actual)
                    .map_err(Self::nlp_error)?;
                let passed = score > threshold;
                let message = if passed {
                    format!("Expect similar to `{expect}` with score {score:.3} above {threshold}")
                } else {
                    format!(
                        "Expect similar to `{expect}` but actual is `{actual}` with score {score:.3} not above {threshold}"
                    )
                };
                self.record_assert(passed, message);
                Ok(Value::Bool(passed))
            }
            OpCall::Equal { a, b } => Ok(Value::Bool(a == b)),
            OpCall::NlpKeywords { text, k } => {
                let words = self
                    .collaborators
                    .nlp
                    .keywords(&text, k)
                    .map_err(Self::nlp_error)?;
                to_value(&words)
            }
            OpCall::NlpTags { text } => {
                let tagged = self.collaborators.nlp.tags(&text).map_err(Self::nlp_error)?;
                to_value(&tagged)
            }
            OpCall::NlpTagFilter { text, tags } => {
                let words = self
                    .collaborators
                    .nlp
                    .tag_filter(&text, &tags)
                    .map_err(Self::nlp_error)?;
                to_value(&words)
            }
            OpCall::NlpSimilarity { a, b } => {
                let score = self
                    .collaborators
                    .nlp
                    .similarity(&a, &b)
                    .map_err(Self::nlp_error)?;
                Ok(Value::from(score))
            }
        }
    }

    fn enter_scope(&self, scope: &str) {
        self.state.lock_or_recover().scope = scope.to_string();
    }
}

/// Mock collaborators shared by the crate's tests
#[cfg(test)]
pub(crate) mod mocks {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hostbridge_connectors::{ConnectorError, NetworkClient, NlpEngine};
    use hostbridge_protocol::{HttpRequestSpec, HttpResponse, KeyValue, TaggedWord};

    use super::*;

    /// Network client answering every request with one canned reply
    pub struct MockNetwork {
        reply: Result<(u16, String), String>,
        pub seen: Mutex<Vec<HttpRequestSpec>>,
    }

    impl MockNetwork {
        pub fn ok(status: u16, text: &str) -> Self {
            Self {
                reply: Ok((status, text.to_string())),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(reason: &str) -> Self {
            Self {
                reply: Err(reason.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NetworkClient for MockNetwork {
        async fn perform(&self, request: HttpRequestSpec) -> Result<HttpResponse, ConnectorError> {
            self.seen.lock().unwrap().push(request);
            match &self.reply {
                Ok((status, text)) => Ok(HttpResponse::new(
                    *status,
                    vec![KeyValue::new("content-type", "application/json")],
                    text.clone(),
                )),
                Err(reason) => Err(ConnectorError::Network(reason.clone())),
            }
        }
    }

    /// Word-overlap NLP engine; uppercase-initial words are tagged `NNP`
    pub struct MockNlp;

    fn words(text: &str) -> impl Iterator<Item = &str> {
        text.split_whitespace()
    }

    impl NlpEngine for MockNlp {
        fn keywords(&self, text: &str, k: usize) -> Result<Vec<String>, ConnectorError> {
            Ok(words(text).take(k).map(str::to_owned).collect())
        }

        fn tags(&self, text: &str) -> Result<Vec<TaggedWord>, ConnectorError> {
            Ok(words(text)
                .map(|w| TaggedWord {
                    word: w.to_string(),
                    tag: (if w.starts_with(char::is_uppercase) { "NNP" } else { "NN" }).to_string(),
                })
                .collect())
        }

        fn tag_filter(&self, text: &str, tags: &[String]) -> Result<Vec<String>, ConnectorError> {
            Ok(self
                .tags(text)?
                .into_iter()
                .filter(|t| tags.contains(&t.tag))
                .map(|t| t.word)
                .collect())
        }

        /// Jaccard index of the lowercase word sets
        fn similarity(&self, a: &str, b: &str) -> Result<f64, ConnectorError> {
            let a: BTreeSet<String> = words(a).map(str::to_lowercase).collect();
            let b: BTreeSet<String> = words(b).map(str::to_lowercase).collect();
            let union = a.union(&b).count();
            if union == 0 {
                return Ok(1.0);
            }
            Ok(a.intersection(&b).count() as f64 / union as f64)
        }
    }

    pub fn collaborators(network: MockNetwork) -> Collaborators {
        Collaborators::new(Arc::new(network), Arc::new(MockNlp))
    }

    pub fn context(setup: InstanceSetup) -> InstanceContext {
        InstanceContext::new(
            setup,
            ScriptConfig::default(),
            SharedStore::new(),
            collaborators(MockNetwork::ok(200, "{}")),
        )
    }
}
