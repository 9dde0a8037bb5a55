//! Traffic processing.
//!
//! [`MockServerEngine`] owns every piece of shared state (provisions, key
//! states, events, global variables) and turns one parsed traffic request into
//! a response:
//!
//! 1. classify the uri with the active matching configuration and derive the key
//! 2. admit the request on the key (`recvseq`, current state, lifecycle)
//! 3. pick the provision eligible in the key's state
//! 4. run its transform pipeline
//! 5. apply the resulting state transition and record the event

use crate::command::{CommandRunner, DisabledRunner, ProcessRunner};
use crate::config::ProcessConfig;
use crate::events::{body_snapshot, Event, EventKey, EventStore, RetentionConfig};
use crate::matching::MatchingConfig;
use crate::provision::ProvisionStore;
use crate::state::{Lifecycle, StateTable, Transition};
use crate::transform::{PipelineOutcome, ResponseDraft, TransformContext, TransformInterpreter};
use crate::variables::GlobalVariables;
use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Validates documents against a registered schema id.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema_id: &str, document: &Value) -> Result<(), String>;
}

/// Accepts every document.
pub struct AcceptAllSchemas;

impl SchemaValidator for AcceptAllSchemas {
    fn validate(&self, _schema_id: &str, _document: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// A parsed traffic request.
#[derive(Debug, Clone, Default)]
pub struct TrafficRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Lowercase header names.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub delay_ms: u64,
}

impl TrafficResponse {
    fn empty(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Bytes::new(),
            delay_ms: 0,
        }
    }
}

/// Traffic plane switches exposed through `server/configuration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfiguration {
    pub receive_request_body: bool,
    /// Allocation hint only. Reported and updatable, no effect on responses.
    pub pre_reserve_request_body: bool,
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self {
            receive_request_body: true,
            pre_reserve_request_body: true,
        }
    }
}

enum Verdict {
    Served,
    /// Request schema failed: pipeline skipped, state transition still applies.
    RequestRejected,
    /// Pipeline aborted: state unchanged.
    Aborted,
}

pub struct MockServerEngine {
    provisions: ProvisionStore,
    states: StateTable,
    events: Arc<EventStore>,
    globals: Arc<GlobalVariables>,
    interpreter: TransformInterpreter,
    schemas: Arc<dyn SchemaValidator>,
    server_config: RwLock<ServerConfiguration>,
    server_sequence: AtomicU64,
    /// Total traffic requests processed.
    requests_total: AtomicU64,
    /// Requests answered by a provision.
    requests_provisioned: AtomicU64,
    /// Requests with no eligible provision.
    requests_unprovisioned: AtomicU64,
}

impl MockServerEngine {
    pub fn new(
        retention: RetentionConfig,
        server_config: ServerConfiguration,
        commands: Arc<dyn CommandRunner>,
    ) -> Self {
        let events = Arc::new(EventStore::new(retention));
        let globals = Arc::new(GlobalVariables::new());
        let interpreter = TransformInterpreter::new(globals.clone(), events.clone(), commands);

        Self {
            provisions: ProvisionStore::new(),
            states: StateTable::new(),
            events,
            globals,
            interpreter,
            schemas: Arc::new(AcceptAllSchemas),
            server_config: RwLock::new(server_config),
            server_sequence: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            requests_provisioned: AtomicU64::new(0),
            requests_unprovisioned: AtomicU64::new(0),
        }
    }

    /// Build an engine with the initial state described by the configuration.
    pub fn from_config(config: &ProcessConfig) -> anyhow::Result<Self> {
        let commands: Arc<dyn CommandRunner> = if config.commands.enabled {
            Arc::new(ProcessRunner::from_settings(&config.commands))
        } else {
            Arc::new(DisabledRunner)
        };

        let engine = Self::new(
            RetentionConfig {
                store_events: config.events.store_events,
                store_events_key_history: config.events.store_events_key_history,
                purge_execution: config.events.purge_execution,
            },
            ServerConfiguration {
                receive_request_body: config.traffic.receive_request_body,
                pre_reserve_request_body: config.traffic.pre_reserve_request_body,
            },
            commands,
        );

        if let Some(document) = &config.matching {
            let matching = MatchingConfig::from_json(document).context("initial matching")?;
            engine.provisions.set_matching(matching).context("initial matching")?;
        }
        for document in &config.provisions {
            engine
                .provisions
                .load(document, false)
                .context("initial provisions")?;
        }
        engine
            .globals
            .load_json(&config.global_variables_json())
            .context("initial global variables")?;

        info!(
            provisions = engine.provisions.snapshot().len(),
            global_variables = engine.globals.len(),
            "Mock server engine initialized"
        );
        Ok(engine)
    }

    pub fn with_schema_validator(mut self, schemas: Arc<dyn SchemaValidator>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn provisions(&self) -> &ProvisionStore {
        &self.provisions
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn globals(&self) -> &GlobalVariables {
        &self.globals
    }

    pub fn schemas(&self) -> &dyn SchemaValidator {
        self.schemas.as_ref()
    }

    pub fn server_configuration(&self) -> ServerConfiguration {
        *self.server_config.read()
    }

    pub fn set_server_configuration(&self, config: ServerConfiguration) {
        info!(
            receive_request_body = config.receive_request_body,
            pre_reserve_request_body = config.pre_reserve_request_body,
            "Server configuration updated"
        );
        *self.server_config.write() = config;
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_provisioned(&self) -> u64 {
        self.requests_provisioned.load(Ordering::Relaxed)
    }

    pub fn total_unprovisioned(&self) -> u64 {
        self.requests_unprovisioned.load(Ordering::Relaxed)
    }

    /// Serve one traffic request.
    ///
    /// The key stays locked from admission until its event is recorded, so
    /// overlapping requests for one key see each other's state transitions
    /// and are recorded in `recvseq` order.
    pub async fn handle_traffic(&self, request: TrafficRequest) -> TrafficResponse {
        let set = self.provisions.snapshot();
        let uri = set.matching().classify(&request.path, request.query.as_deref());
        let key = EventKey::new(request.method.as_str(), uri.normalized.clone());
        let _guard = self.states.lock(&key).await;

        let reception_timestamp_us = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let server_sequence = self.server_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let admission = self.states.admit(&key);

        let body: &[u8] = if self.server_configuration().receive_request_body {
            &request.body
        } else {
            &[]
        };
        let request_headers: BTreeMap<String, String> = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut event = Event {
            reception_timestamp_us,
            previous_state: String::new(),
            state: String::new(),
            request_headers: BTreeMap::new(),
            request_body: None,
            response_body: None,
            response_delay_ms: 0,
            response_status_code: 0,
            response_headers: BTreeMap::new(),
            server_sequence,
            recvseq: admission.recvseq,
        };

        if admission.lifecycle == Lifecycle::Deleted {
            debug!(method = %key.method, uri = %key.uri, "Request for deleted key");
            event.previous_state = admission.state.clone();
            event.state = admission.state;
            event.request_headers = request_headers;
            event.request_body = body_snapshot(body);
            event.response_status_code = 404;
            self.events.record(key, event);
            return TrafficResponse::empty(404);
        }

        let Some(provision) = set.find(&request.method, &uri.classification, &admission.state)
        else {
            self.requests_unprovisioned.fetch_add(1, Ordering::Relaxed);
            debug!(
                method = %key.method,
                uri = %key.uri,
                state = %admission.state,
                "No provision found"
            );
            event.response_status_code = 501;
            self.events.record(key, event);
            return TrafficResponse::empty(501);
        };
        self.requests_provisioned.fetch_add(1, Ordering::Relaxed);

        let body_json = serde_json::from_slice::<Value>(body).ok();
        let mut draft = ResponseDraft::from_provision(&provision);

        let request_schema = provision.request_schema_id.as_deref().map(|id| {
            self.schemas
                .validate(id, body_json.as_ref().unwrap_or(&Value::Null))
        });
        let verdict = match request_schema {
            Some(Err(reason)) => {
                warn!(method = %key.method, uri = %key.uri, %reason, "Request schema validation failed");
                draft.status = 400;
                draft.body = None;
                Verdict::RequestRejected
            }
            _ => {
                let ctx = TransformContext {
                    key: &key,
                    uri: &uri,
                    headers: &request.headers,
                    body,
                    body_json: body_json.as_ref(),
                    in_state: &admission.state,
                    recvseq: admission.recvseq,
                };
                match self.interpreter.run(&provision.rules, &ctx, &mut draft).await {
                    PipelineOutcome::Completed => Verdict::Served,
                    PipelineOutcome::Aborted(message) => {
                        draft.status = 400;
                        draft.headers = BTreeMap::from([(
                            "content-type".to_string(),
                            "text/plain".to_string(),
                        )]);
                        draft.body = Some(Value::String(message));
                        draft.body_is_json = false;
                        Verdict::Aborted
                    }
                }
            }
        };

        if let (Verdict::Served, Some(id)) = (&verdict, &provision.response_schema_id) {
            if let Err(reason) = self
                .schemas
                .validate(id, draft.body.as_ref().unwrap_or(&Value::Null))
            {
                warn!(method = %key.method, uri = %key.uri, %reason, "Response schema validation failed");
                draft.status = 500;
            }
        }

        let rendered = Bytes::from(draft.render_body());
        if draft.body_is_json
            && !rendered.is_empty()
            && !draft.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"))
        {
            draft
                .headers
                .insert("content-type".to_string(), "application/json".to_string());
        }

        event.previous_state = admission.state.clone();
        event.state = admission.state;
        event.request_headers = request_headers;
        event.request_body = body_snapshot(body);
        event.response_body = draft.body.clone().filter(|b| !b.is_null());
        event.response_delay_ms = draft.delay_ms;
        event.response_status_code = draft.status;
        event.response_headers = draft.headers.clone();

        let purged = match verdict {
            Verdict::Aborted => false,
            Verdict::Served | Verdict::RequestRejected => {
                let purge_enabled = self.events.retention().purge_execution;
                for (foreign, label) in &draft.foreign_states {
                    self.transition(foreign, &Transition::from_label(label, purge_enabled));
                }
                match Transition::from_label(&draft.out_state, purge_enabled) {
                    Transition::Purge => {
                        self.transition(&key, &Transition::Purge);
                        true
                    }
                    other => {
                        event.state = self.transition(&key, &other);
                        false
                    }
                }
            }
        };

        debug!(
            method = %key.method,
            uri = %key.uri,
            status = draft.status,
            previous_state = %event.previous_state,
            state = %event.state,
            server_sequence,
            "Traffic request served"
        );
        if !purged {
            self.events.record(key, event);
        }

        TrafficResponse {
            status: draft.status,
            headers: draft.headers,
            body: rendered,
            delay_ms: draft.delay_ms,
        }
    }

    /// Move a key to a new state. Purging also drops the key's events.
    fn transition(&self, key: &EventKey, transition: &Transition) -> String {
        if *transition == Transition::Purge {
            debug!(method = %key.method, uri = %key.uri, "Purging key");
            self.events.purge(key);
        }
        self.states.apply(key, transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::MockRunner;
    use crate::command::CommandOutput;
    use crate::error::CommandError;
    use crate::events::EventQuery;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Echoes the command back, taking its time on `slow`.
    struct SlowRunner;

    #[async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(&self, command: &str) -> Result<CommandOutput, CommandError> {
            if command == "slow" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(CommandOutput {
                stdout: command.to_string(),
                return_code: 0,
            })
        }
    }

    fn engine() -> MockServerEngine {
        engine_with(RetentionConfig::default())
    }

    fn engine_with(retention: RetentionConfig) -> MockServerEngine {
        MockServerEngine::new(
            retention,
            ServerConfiguration::default(),
            Arc::new(MockRunner::new("", 0)),
        )
    }

    fn request(method: &str, target: &str, body: &str) -> TrafficRequest {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        TrafficRequest {
            method: method.to_string(),
            path,
            query,
            headers: HashMap::from([("x-trace".to_string(), "1".to_string())]),
            body: Bytes::from(body.to_string()),
        }
    }

    fn json_body(response: &TrafficResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    fn history(engine: &MockServerEngine, method: &str, uri: &str) -> Vec<Value> {
        engine
            .events()
            .query(&EventQuery {
                key: Some(EventKey::new(method, uri)),
                ..Default::default()
            })
            .map(|document| document["requests"].as_array().cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_state_rotation() {
        let engine = engine();
        engine
            .provisions()
            .load(
                &json!([
                    {"requestMethod": "GET", "requestUri": "/app/v1/foo", "responseCode": 200,
                     "responseBody": {"step": "initial"}, "outState": "another"},
                    {"requestMethod": "GET", "requestUri": "/app/v1/foo", "responseCode": 200,
                     "responseBody": {"step": "another"}, "inState": "another", "outState": "initial"}
                ]),
                false,
            )
            .unwrap();

        let mut steps = Vec::new();
        for _ in 0..3 {
            let response = engine.handle_traffic(request("GET", "/app/v1/foo", "")).await;
            assert_eq!(response.status, 200);
            assert_eq!(
                response.headers.get("content-type").map(String::as_str),
                Some("application/json")
            );
            steps.push(json_body(&response)["step"].clone());
        }
        assert_eq!(steps, vec![json!("initial"), json!("another"), json!("initial")]);

        let events = history(&engine, "GET", "/app/v1/foo");
        assert_eq!(events[0]["previousState"], "initial");
        assert_eq!(events[0]["state"], "another");
        assert_eq!(events[1]["state"], "initial");
    }

    #[tokio::test]
    async fn test_recvseq_per_key_and_global_sequence() {
        let engine = engine();
        engine
            .provisions()
            .load(
                &json!({"requestMethod": "GET", "requestUri": "/a", "responseCode": 200,
                        "transform": [{"source": "recvseq", "target": "response.body.unsigned.seq"}]}),
                false,
            )
            .unwrap();

        let mut seqs = Vec::new();
        for _ in 0..4 {
            engine.handle_traffic(request("GET", "/b", "")).await;
            let response = engine.handle_traffic(request("GET", "/a", "")).await;
            seqs.push(json_body(&response)["seq"].as_u64().unwrap());
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        let mut sequences: Vec<u64> = history(&engine, "GET", "/a")
            .into_iter()
            .chain(history(&engine, "GET", "/b"))
            .map(|e| e["serverSequence"].as_u64().unwrap())
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=8).collect::<Vec<_>>());
        assert_eq!(engine.total_requests(), 8);
        assert_eq!(engine.total_unprovisioned(), 4);
    }

    #[tokio::test]
    async fn test_unprovisioned_request_is_recorded() {
        let engine = engine();
        let response = engine
            .handle_traffic(request("POST", "/nothing?b=2&a=1", r#"{"x":1}"#))
            .await;
        assert_eq!(response.status, 501);
        assert!(response.body.is_empty());

        let events = history(&engine, "POST", "/nothing?a=1&b=2");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["responseStatusCode"], 501);
        assert!(events[0].get("previousState").is_none());
        assert!(events[0].get("state").is_none());
        assert!(events[0].get("requestBody").is_none());
    }

    #[tokio::test]
    async fn test_virtual_deletion() {
        let engine = engine();
        engine
            .provisions()
            .load(
                &json!([
                    {"requestMethod": "GET", "requestUri": "/app/v1/foo/bar/13", "responseCode": 200,
                     "responseBody": {"foo": "bar-13"}},
                    {"requestMethod": "DELETE", "requestUri": "/app/v1/foo/bar/13", "responseCode": 200,
                     "outState": "deleted",
                     "transform": [{"source": "value.deleted", "target": "outState.GET"}]}
                ]),
                false,
            )
            .unwrap();

        let response = engine.handle_traffic(request("GET", "/app/v1/foo/bar/13", "")).await;
        assert_eq!(json_body(&response), json!({"foo": "bar-13"}));

        let response = engine
            .handle_traffic(request("DELETE", "/app/v1/foo/bar/13", ""))
            .await;
        assert_eq!(response.status, 200);

        for method in ["GET", "DELETE"] {
            let response = engine.handle_traffic(request(method, "/app/v1/foo/bar/13", "")).await;
            assert_eq!(response.status, 404);
        }
        let events = history(&engine, "GET", "/app/v1/foo/bar/13");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["responseStatusCode"], 404);
        assert_eq!(
            engine.states().lifecycle(&EventKey::new("GET", "/app/v1/foo/bar/13")),
            Lifecycle::Deleted
        );
    }

    #[tokio::test]
    async fn test_purge_on_termination() {
        let engine = engine();
        engine
            .provisions()
            .load(
                &json!([
                    {"requestMethod": "POST", "requestUri": "/session", "responseCode": 201,
                     "outState": "open"},
                    {"requestMethod": "POST", "requestUri": "/session", "responseCode": 200,
                     "inState": "open", "outState": "purge"}
                ]),
                false,
            )
            .unwrap();

        assert_eq!(engine.handle_traffic(request("POST", "/session", "")).await.status, 201);
        assert_eq!(history(&engine, "POST", "/session").len(), 1);
        assert_eq!(engine.handle_traffic(request("POST", "/session", "")).await.status, 200);

        assert!(history(&engine, "POST", "/session").is_empty());
        assert_eq!(
            engine.states().current(&EventKey::new("POST", "/session")),
            "initial"
        );
        assert_eq!(engine.handle_traffic(request("POST", "/session", "")).await.status, 201);
    }

    #[tokio::test]
    async fn test_purge_disabled_is_plain_state() {
        let engine = engine_with(RetentionConfig {
            purge_execution: false,
            ..Default::default()
        });
        engine
            .provisions()
            .load(
                &json!({"requestMethod": "POST", "requestUri": "/s", "responseCode": 200, "outState": "purge"}),
                false,
            )
            .unwrap();

        engine.handle_traffic(request("POST", "/s", "")).await;
        assert_eq!(history(&engine, "POST", "/s").len(), 1);
        assert_eq!(engine.states().current(&EventKey::new("POST", "/s")), "purge");
    }

    #[tokio::test]
    async fn test_retention_policies() {
        let engine = engine_with(RetentionConfig {
            store_events_key_history: false,
            ..Default::default()
        });
        for _ in 0..5 {
            engine.handle_traffic(request("GET", "/x", "")).await;
        }
        assert_eq!(engine.events().history_len(&EventKey::new("GET", "/x")), 1);

        let engine = engine_with(RetentionConfig {
            store_events: false,
            ..Default::default()
        });
        for _ in 0..5 {
            engine.handle_traffic(request("GET", "/x", "")).await;
        }
        assert!(engine.events().query(&EventQuery::default()).is_none());
    }

    #[tokio::test]
    async fn test_receive_request_body_disabled() {
        let engine = engine();
        engine
            .provisions()
            .load(
                &json!({"requestMethod": "POST", "requestUri": "/echo", "responseCode": 200,
                        "transform": [{"source": "request.body", "target": "response.body.object"}]}),
                false,
            )
            .unwrap();

        let response = engine.handle_traffic(request("POST", "/echo", r#"{"a":1}"#)).await;
        assert_eq!(json_body(&response), json!({"a": 1}));

        engine.set_server_configuration(ServerConfiguration {
            receive_request_body: false,
            pre_reserve_request_body: true,
        });
        let response = engine.handle_traffic(request("POST", "/echo", r#"{"a":1}"#)).await;
        assert!(response.body.is_empty());
        assert!(history(&engine, "POST", "/echo")[1].get("requestBody").is_none());
    }

    #[tokio::test]
    async fn test_pre_reserve_flag_does_not_change_responses() {
        let engine = engine();
        engine
            .provisions()
            .load(
                &json!({"requestMethod": "POST", "requestUri": "/echo", "responseCode": 200,
                        "transform": [{"source": "request.body", "target": "response.body.object"}]}),
                false,
            )
            .unwrap();

        engine.set_server_configuration(ServerConfiguration {
            receive_request_body: true,
            pre_reserve_request_body: false,
        });
        let response = engine.handle_traffic(request("POST", "/echo", r#"{"a":1}"#)).await;
        assert_eq!(response.status, 200);
        assert_eq!(json_body(&response), json!({"a": 1}));
        assert_eq!(history(&engine, "POST", "/echo")[0]["requestBody"], json!({"a": 1}));
    }

    struct RejectSchema(&'static str);

    impl SchemaValidator for RejectSchema {
        fn validate(&self, schema_id: &str, _document: &Value) -> Result<(), String> {
            if schema_id == self.0 {
                Err(format!("{schema_id} rejected"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_schema_validation() {
        let engine = engine().with_schema_validator(Arc::new(RejectSchema("strict")));
        engine
            .provisions()
            .load(
                &json!([
                    {"requestMethod": "POST", "requestUri": "/in", "responseCode": 201,
                     "requestSchemaId": "strict", "outState": "next",
                     "responseBody": {"created": true}},
                    {"requestMethod": "POST", "requestUri": "/out", "responseCode": 200,
                     "responseSchemaId": "strict", "responseBody": {"kept": true}}
                ]),
                false,
            )
            .unwrap();

        let response = engine.handle_traffic(request("POST", "/in", "{}")).await;
        assert_eq!(response.status, 400);
        assert!(response.body.is_empty());
        assert_eq!(engine.states().current(&EventKey::new("POST", "/in")), "next");

        let response = engine.handle_traffic(request("POST", "/out", "{}")).await;
        assert_eq!(response.status, 500);
        assert_eq!(json_body(&response), json!({"kept": true}));
    }

    #[tokio::test]
    async fn test_json_constraint_failure() {
        let engine = engine();
        engine
            .provisions()
            .load(
                &json!({"requestMethod": "POST", "requestUri": "/check", "responseCode": 200,
                        "outState": "checked", "responseBody": {"ok": true},
                        "transform": [{"source": "request.body", "target": "var.body",
                                       "filter": {"JsonConstraint": {"id": 1}}}]}),
                false,
            )
            .unwrap();

        let response = engine.handle_traffic(request("POST", "/check", r#"{"id":2}"#)).await;
        assert_eq!(response.status, 400);
        assert!(String::from_utf8_lossy(&response.body).starts_with("JsonConstraint FAILED: "));
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("text/plain")
        );
        assert_eq!(engine.states().current(&EventKey::new("POST", "/check")), "initial");
        assert_eq!(history(&engine, "POST", "/check")[0]["responseStatusCode"], 400);

        let response = engine.handle_traffic(request("POST", "/check", r#"{"id":1}"#)).await;
        assert_eq!(response.status, 200);
        assert_eq!(engine.states().current(&EventKey::new("POST", "/check")), "checked");
    }

    #[tokio::test]
    async fn test_regex_replace_key_and_delay() {
        let engine = engine();
        engine
            .provisions()
            .set_matching(
                MatchingConfig::from_json(&json!({
                    "algorithm": "FullMatchingRegexReplace",
                    "rgx": "(/app/v1/stamp)/[0-9]+",
                    "fmt": "$1"
                }))
                .unwrap(),
            )
            .unwrap();
        engine
            .provisions()
            .load(
                &json!({"requestMethod": "GET", "requestUri": "/app/v1/stamp", "responseCode": 200,
                        "responseDelayMs": 15, "responseBody": "plain"}),
                false,
            )
            .unwrap();

        let response = engine.handle_traffic(request("GET", "/app/v1/stamp/1234", "")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.delay_ms, 15);
        assert_eq!(&response.body[..], b"plain");
        assert!(response.headers.get("content-type").is_none());
        assert_eq!(history(&engine, "GET", "/app/v1/stamp/1234").len(), 1);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config: ProcessConfig = serde_yaml::from_str(
            r#"
commands:
  enabled: false
provisions:
  - requestMethod: GET
    requestUri: /hello
    responseCode: 200
    transform:
      - source: globalVar.greeting
        target: response.body.string.greeting
global_variables:
  greeting: hello
"#,
        )
        .unwrap();
        let engine = MockServerEngine::from_config(&config).unwrap();

        let response = engine.handle_traffic(request("GET", "/hello", "")).await;
        assert_eq!(json_body(&response), json!({"greeting": "hello"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_server_sequence_is_unique() {
        let engine = Arc::new(engine());
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .handle_traffic(request("GET", &format!("/k{}", i % 4), ""))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().status, 501);
        }

        let mut sequences: Vec<u64> = (0..4)
            .flat_map(|k| history(&engine, "GET", &format!("/k{k}")))
            .map(|e| e["serverSequence"].as_u64().unwrap())
            .collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_requests_on_one_key_are_serialized() {
        let engine = Arc::new(MockServerEngine::new(
            RetentionConfig::default(),
            ServerConfiguration::default(),
            Arc::new(SlowRunner),
        ));
        let transform = json!([
            {"source": "request.body.cmd", "target": "var.cmd"},
            {"source": "command.@{cmd}", "target": "response.body.string.out"},
            {"source": "inState", "target": "response.body.string.step"}
        ]);
        engine
            .provisions()
            .load(
                &json!([
                    {"requestMethod": "POST", "requestUri": "/k", "responseCode": 200,
                     "outState": "second", "transform": transform},
                    {"requestMethod": "POST", "requestUri": "/k", "responseCode": 200,
                     "inState": "second", "outState": "initial", "transform": transform}
                ]),
                false,
            )
            .unwrap();

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.handle_traffic(request("POST", "/k", r#"{"cmd":"slow"}"#)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.handle_traffic(request("POST", "/k", r#"{"cmd":"fast"}"#)).await }
        });

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(json_body(&first), json!({"out": "slow", "step": "initial"}));
        assert_eq!(json_body(&second), json!({"out": "fast", "step": "second"}));

        let order: Vec<(u64, u64)> = history(&engine, "POST", "/k")
            .iter()
            .map(|e| (e["recvseq"].as_u64().unwrap(), e["serverSequence"].as_u64().unwrap()))
            .collect();
        assert_eq!(order, vec![(1, 1), (2, 2)]);

        let last = engine.events().event(&EventKey::new("POST", "/k"), -1).unwrap();
        assert_eq!(last.recvseq, 2);
    }

    #[tokio::test]
    async fn test_sorted_query_with_semicolon_separator() {
        let engine = engine();
        engine
            .provisions()
            .set_matching(
                MatchingConfig::from_json(&json!({
                    "algorithm": "FullMatching",
                    "uriPathQueryParameters": {"filter": "Sort", "separator": "Semicolon"}
                }))
                .unwrap(),
            )
            .unwrap();
        engine
            .provisions()
            .load(
                &json!({"requestMethod": "GET", "requestUri": "/foo?a=1;b=2", "responseCode": 200}),
                false,
            )
            .unwrap();

        assert_eq!(engine.handle_traffic(request("GET", "/foo?b=2;a=1", "")).await.status, 200);
        assert_eq!(engine.handle_traffic(request("GET", "/foo?a=1;b=2", "")).await.status, 200);
        assert_eq!(engine.handle_traffic(request("GET", "/foo?a=1&b=2", "")).await.status, 501);
    }
}
