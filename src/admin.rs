//! Admin plane operations.
//!
//! [`AdminApi`] maps an operation path (the part after the admin prefix),
//! method, query and body onto the engine's stores and produces an
//! [`AdminResponse`]. Provisioning outcomes use the
//! `{"result":"true|false","response":"<message>"}` envelope; reads return
//! the documents themselves, with 204 when there is nothing to show.

use crate::engine::{MockServerEngine, ServerConfiguration};
use crate::error::PayloadError;
use crate::events::{EventQuery, RetentionConfig};
use crate::matching::{parse_query, MatchingConfig};
use crate::provision::{HttpMethod, ProvisionFilter};
use bytes::Bytes;
use hyper::Method;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const JSON_CONTENT: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub struct AdminResponse {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Bytes,
}

impl AdminResponse {
    fn envelope(status: u16, message: impl AsRef<str>) -> Self {
        let result = if (200..300).contains(&status) { "true" } else { "false" };
        Self::json(status, &json!({"result": result, "response": message.as_ref()}))
    }

    fn json(status: u16, document: &Value) -> Self {
        Self {
            status,
            content_type: Some(JSON_CONTENT),
            body: Bytes::from(document.to_string()),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
        }
    }

    /// 200 with the document, or 204 when there is none.
    fn document_or_no_content(document: Option<Value>) -> Self {
        match document {
            Some(document) => Self::json(200, &document),
            None => Self::empty(204),
        }
    }

    fn removed(removed: bool) -> Self {
        Self::empty(if removed { 200 } else { 204 })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ServerMatching,
    ServerProvision,
    ServerData,
    ServerDataSummary,
    ServerDataConfiguration,
    GlobalVariable,
    ServerConfiguration,
}

impl Operation {
    fn parse(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "server-matching" => Self::ServerMatching,
            "server-provision" | "server-provisions" => Self::ServerProvision,
            "server-data" => Self::ServerData,
            "server-data/summary" => Self::ServerDataSummary,
            "server-data/configuration" => Self::ServerDataConfiguration,
            "global-variable" | "global-variables" => Self::GlobalVariable,
            "server/configuration" => Self::ServerConfiguration,
            _ => return None,
        })
    }
}

/// Query parameters of one admin request.
struct Params(BTreeMap<String, String>);

impl Params {
    fn parse(query: Option<&str>) -> Self {
        Self(query.map(|q| parse_query(q, '&')).unwrap_or_default())
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// `true`/`false` flag. `Err` on any other value.
    fn flag(&self, name: &str) -> Result<Option<bool>, ()> {
        match self.get(name) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(_) => Err(()),
        }
    }

    /// Optional `requestMethod` + `requestUri` pair.
    fn provision_filter(&self) -> Result<Option<ProvisionFilter>, ()> {
        match (self.get("requestMethod"), self.get("requestUri")) {
            (None, None) => Ok(None),
            (Some(method), Some(uri)) => Ok(Some(ProvisionFilter {
                method: method.parse::<HttpMethod>().map_err(|_| ())?,
                uri: uri.to_string(),
            })),
            _ => Err(()),
        }
    }
}

pub struct AdminApi {
    engine: Arc<MockServerEngine>,
}

impl AdminApi {
    pub fn new(engine: Arc<MockServerEngine>) -> Self {
        Self { engine }
    }

    /// Handle one admin request. `operation` is the path after the admin prefix,
    /// without leading or trailing slashes.
    pub fn handle(
        &self,
        method: &Method,
        operation: &str,
        query: Option<&str>,
        body: &[u8],
    ) -> AdminResponse {
        debug!(%method, operation, "Admin request");

        if operation.is_empty() {
            return AdminResponse::envelope(400, "no operation provided");
        }
        let Some(op) = Operation::parse(operation) else {
            return AdminResponse::envelope(400, "unsupported operation");
        };
        let params = Params::parse(query);

        match (method, op) {
            (&Method::POST, Operation::ServerMatching) => {
                self.with_json(body, |document| self.post_matching(document))
            }
            (&Method::GET, Operation::ServerMatching) => AdminResponse::json(
                200,
                self.engine.provisions().snapshot().matching().document(),
            ),
            (&Method::POST, Operation::ServerProvision) => {
                self.with_json(body, |document| self.load_provisions(document, false))
            }
            (&Method::PUT, Operation::ServerProvision) => {
                self.with_json(body, |document| self.load_provisions(document, true))
            }
            (&Method::GET, Operation::ServerProvision) => match params.provision_filter() {
                Ok(filter) => {
                    let list = self.engine.provisions().list(filter.as_ref());
                    AdminResponse::document_or_no_content(
                        (!list.is_empty()).then_some(Value::Array(list)),
                    )
                }
                Err(()) => AdminResponse::empty(400),
            },
            (&Method::DELETE, Operation::ServerProvision) => match params.provision_filter() {
                Ok(filter) => {
                    let removed = self.engine.provisions().delete(filter.as_ref());
                    info!(removed, "Provisions deleted");
                    AdminResponse::removed(removed > 0)
                }
                Err(()) => AdminResponse::empty(400),
            },
            (&Method::GET, Operation::ServerData) => self.get_server_data(&params),
            (&Method::DELETE, Operation::ServerData) => self.delete_server_data(&params),
            (&Method::GET, Operation::ServerDataSummary) => {
                let max_keys = match params.get("maxKeys").map(str::parse::<usize>) {
                    None => None,
                    Some(Ok(max)) => Some(max),
                    Some(Err(_)) => return AdminResponse::empty(400),
                };
                AdminResponse::json(200, &self.engine.events().summary(max_keys))
            }
            (&Method::GET, Operation::ServerDataConfiguration) => {
                AdminResponse::json(200, &json!(self.engine.events().retention()))
            }
            (&Method::PUT, Operation::ServerDataConfiguration) => {
                self.put_data_configuration(&params)
            }
            (&Method::POST, Operation::GlobalVariable) => {
                self.with_json(body, |document| self.post_global_variables(document))
            }
            (&Method::GET, Operation::GlobalVariable) => self.get_global_variable(&params),
            (&Method::DELETE, Operation::GlobalVariable) => self.delete_global_variable(&params),
            (&Method::GET, Operation::ServerConfiguration) => {
                AdminResponse::json(200, &json!(self.engine.server_configuration()))
            }
            (&Method::PUT, Operation::ServerConfiguration) => {
                self.put_server_configuration(&params)
            }
            _ => AdminResponse::envelope(400, "unsupported operation"),
        }
    }

    fn with_json(&self, body: &[u8], handler: impl FnOnce(&Value) -> AdminResponse) -> AdminResponse {
        match serde_json::from_slice::<Value>(body) {
            Ok(document) => handler(&document),
            Err(e) => {
                warn!(error = %e, "Admin request body is not JSON");
                AdminResponse::envelope(400, "failed to parse json from body request")
            }
        }
    }

    fn post_matching(&self, document: &Value) -> AdminResponse {
        const OP: &str = "server-matching operation; ";

        let result = MatchingConfig::from_json(document)
            .and_then(|matching| self.engine.provisions().set_matching(matching));
        match result {
            Ok(()) => AdminResponse::envelope(201, format!("{OP}valid schema and matching data received")),
            Err(e) => {
                warn!(error = %e, "Matching configuration rejected");
                let reason = if e.is_schema() {
                    "invalid schema"
                } else {
                    "invalid matching data received"
                };
                AdminResponse::envelope(400, format!("{OP}{reason}"))
            }
        }
    }

    fn load_provisions(&self, document: &Value, replace_all: bool) -> AdminResponse {
        const OP: &str = "server-provision operation; ";
        let batch = document.is_array();

        match self.engine.provisions().load(document, replace_all) {
            Ok(_) => {
                let message = if batch {
                    "valid schemas and provisions data received"
                } else {
                    "valid schema and provision data received"
                };
                AdminResponse::envelope(201, format!("{OP}{message}"))
            }
            Err(e) => {
                warn!(error = %e, "Provision rejected");
                let message = match (&e, batch) {
                    (PayloadError::Schema(_), false) => "invalid schema",
                    (PayloadError::Schema(_), true) => "detected one invalid schema",
                    (PayloadError::Data(_), false) => "invalid provision data received",
                    (PayloadError::Data(_), true) => "detected one invalid provision data received",
                };
                AdminResponse::envelope(400, format!("{OP}{message}"))
            }
        }
    }

    fn event_query(params: &Params, number_names: &[&str], path: Option<&str>) -> Result<EventQuery, AdminResponse> {
        let number = number_names.iter().find_map(|name| params.get(name));
        EventQuery::from_params(params.get("requestMethod"), params.get("requestUri"), number, path)
            .map_err(|e| AdminResponse::envelope(400, e.0))
    }

    fn get_server_data(&self, params: &Params) -> AdminResponse {
        match Self::event_query(params, &["eventNumber"], params.get("eventPath")) {
            Ok(query) => AdminResponse::document_or_no_content(self.engine.events().query(&query)),
            Err(response) => response,
        }
    }

    /// Deleting a key's events also resets its state; a full wipe resets every key.
    fn delete_server_data(&self, params: &Params) -> AdminResponse {
        let query = match Self::event_query(params, &["requestNumber", "eventNumber"], None) {
            Ok(query) => query,
            Err(response) => return response,
        };

        let removed = self.engine.events().delete(&query);
        match (&query.key, query.number) {
            (None, _) => self.engine.states().reset_all(),
            (Some(key), None) => {
                self.engine.states().reset(key);
            }
            (Some(_), Some(_)) => {}
        }
        info!(key = ?query.key, number = ?query.number, removed, "Server data deleted");
        AdminResponse::removed(removed)
    }

    fn put_data_configuration(&self, params: &Params) -> AdminResponse {
        let (Ok(discard), Ok(discard_history), Ok(disable_purge)) = (
            params.flag("discard"),
            params.flag("discardKeyHistory"),
            params.flag("disablePurge"),
        ) else {
            return AdminResponse::empty(400);
        };
        if discard.is_none() && discard_history.is_none() && disable_purge.is_none() {
            return AdminResponse::empty(400);
        }
        // Keeping history makes no sense while everything is discarded.
        if discard == Some(true) && discard_history == Some(false) {
            return AdminResponse::empty(400);
        }

        let current = self.engine.events().retention();
        let retention = RetentionConfig {
            store_events: discard.map_or(current.store_events, |d| !d),
            store_events_key_history: discard_history.map_or(current.store_events_key_history, |d| !d),
            purge_execution: disable_purge.map_or(current.purge_execution, |d| !d),
        };
        if retention.purge_execution && !retention.store_events {
            warn!("Purge execution has no effect while events are discarded");
        }
        info!(
            store_events = retention.store_events,
            store_events_key_history = retention.store_events_key_history,
            purge_execution = retention.purge_execution,
            "Server data configuration updated"
        );
        self.engine.events().set_retention(retention);
        AdminResponse::empty(200)
    }

    fn post_global_variables(&self, document: &Value) -> AdminResponse {
        const OP: &str = "global-variable operation; ";

        match self.engine.globals().load_json(document) {
            Ok(count) => {
                info!(count, "Global variables loaded");
                AdminResponse::envelope(201, format!("{OP}valid schema and global variables received"))
            }
            Err(e) => {
                warn!(error = %e, "Global variables rejected");
                AdminResponse::envelope(400, format!("{OP}invalid schema"))
            }
        }
    }

    fn get_global_variable(&self, params: &Params) -> AdminResponse {
        match params.get("name") {
            Some("") => AdminResponse::empty(400),
            Some(name) => match self.engine.globals().get(name) {
                Some(value) => AdminResponse {
                    status: 200,
                    content_type: Some("text/plain"),
                    body: Bytes::from(value),
                },
                None => AdminResponse::empty(204),
            },
            None => {
                let globals = self.engine.globals();
                AdminResponse::document_or_no_content((!globals.is_empty()).then(|| globals.to_json()))
            }
        }
    }

    fn delete_global_variable(&self, params: &Params) -> AdminResponse {
        match params.get("name") {
            Some("") => AdminResponse::empty(400),
            Some(name) => AdminResponse::removed(self.engine.globals().remove(name)),
            None => AdminResponse::removed(self.engine.globals().clear()),
        }
    }

    fn put_server_configuration(&self, params: &Params) -> AdminResponse {
        let (Ok(receive), Ok(pre_reserve)) = (
            params.flag("receiveRequestBody"),
            params.flag("preReserveRequestBody"),
        ) else {
            return AdminResponse::empty(400);
        };
        if receive.is_none() && pre_reserve.is_none() {
            return AdminResponse::empty(400);
        }

        let current = self.engine.server_configuration();
        self.engine.set_server_configuration(ServerConfiguration {
            receive_request_body: receive.unwrap_or(current.receive_request_body),
            pre_reserve_request_body: pre_reserve.unwrap_or(current.pre_reserve_request_body),
        });
        AdminResponse::empty(200)
    }
}
