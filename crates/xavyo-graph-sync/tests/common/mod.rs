//! Common test utilities for xavyo-graph-sync crate tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use xavyo_graph_sync::{
    BatchRequestItem, BatchResponseItem, GraphRequest, GraphResult, GraphSync, GraphSyncConfig,
    GraphSyncError, GraphTransport, MembershipState, Method, ODataResponse,
};

pub const ALREADY_EXISTS_MESSAGE: &str = "One or more added object references already exist \
     for the following modified properties: 'members'.";

/// Builds a `GraphSync` over `transport` with `config`.
pub fn graph_sync(config: GraphSyncConfig, transport: Arc<dyn GraphTransport>) -> GraphSync {
    GraphSync::new(config, transport).expect("valid test config")
}

/// Creates a per-item response with no body.
pub fn status(id: &str, status: u16) -> BatchResponseItem {
    BatchResponseItem {
        id: id.to_string(),
        status,
        headers: HashMap::new(),
        body: None,
    }
}

/// Creates a per-item Graph error response.
pub fn item_error(id: &str, status: u16, code: &str, message: &str) -> BatchResponseItem {
    BatchResponseItem {
        body: Some(create_odata_error(code, message)),
        ..self::status(id, status)
    }
}

/// Creates a throttled per-item response with a Retry-After header.
pub fn throttled(id: &str, retry_after_secs: u64) -> BatchResponseItem {
    let mut response = item_error(id, 429, "TooManyRequests", "Too many requests");
    response
        .headers
        .insert("Retry-After".to_string(), retry_after_secs.to_string());
    response
}

/// Creates a mock OData error body.
pub fn create_odata_error(code: &str, message: &str) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message
        }
    })
}

/// Creates one page of a list or delta response.
pub fn page(
    items: Vec<Value>,
    next_link: Option<&str>,
    delta_link: Option<&str>,
) -> ODataResponse<Value> {
    ODataResponse {
        value: items,
        next_link: next_link.map(String::from),
        delta_link: delta_link.map(String::from),
    }
}

/// Creates a Graph API error as the transport would report it.
pub fn api_error(status: u16, code: &str, message: &str) -> GraphSyncError {
    GraphSyncError::GraphApi {
        status,
        code: code.to_string(),
        message: message.to_string(),
        retry_after_secs: None,
    }
}

/// One `$batch` envelope as received by a fake transport.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub at: Instant,
    pub items: Vec<BatchRequestItem>,
}

impl RecordedBatch {
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

type Responder = dyn Fn(&BatchRequestItem, u32) -> BatchResponseItem + Send + Sync;

/// Transport answering batch items through a closure.
///
/// The closure receives the item and how many times its id has been sent,
/// starting at 1.
pub struct ScriptedTransport {
    responder: Box<Responder>,
    envelope_errors: Mutex<VecDeque<GraphSyncError>>,
    attempts: Mutex<HashMap<String, u32>>,
    batches: Mutex<Vec<RecordedBatch>>,
    pages: Mutex<HashMap<String, VecDeque<GraphResult<ODataResponse<Value>>>>>,
    page_requests: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&BatchRequestItem, u32) -> BatchResponseItem + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            envelope_errors: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(HashMap::new()),
            batches: Mutex::new(Vec::new()),
            pages: Mutex::new(HashMap::new()),
            page_requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every item with 204.
    pub fn always_ok() -> Self {
        Self::new(|item, _| status(&item.id, 204))
    }

    /// Makes the next `send_batch` call fail as a whole.
    pub fn fail_next_envelope(&self, error: GraphSyncError) {
        self.envelope_errors.lock().unwrap().push_back(error);
    }

    /// Queues a response for the next read of `url`.
    pub fn push_page(&self, url: &str, response: GraphResult<ODataResponse<Value>>) {
        self.pages
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_ids(&self) -> Vec<Vec<String>> {
        self.batches().iter().map(RecordedBatch::ids).collect()
    }

    pub fn page_requests(&self) -> Vec<String> {
        self.page_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphTransport for ScriptedTransport {
    async fn send_batch(
        &self,
        requests: Vec<BatchRequestItem>,
    ) -> GraphResult<Vec<BatchResponseItem>> {
        self.batches.lock().unwrap().push(RecordedBatch {
            at: Instant::now(),
            items: requests.clone(),
        });

        if let Some(error) = self.envelope_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut attempts = self.attempts.lock().unwrap();
        Ok(requests
            .iter()
            .map(|item| {
                let attempt = attempts.entry(item.id.clone()).or_insert(0);
                *attempt += 1;
                (self.responder)(item, *attempt)
            })
            .collect())
    }

    async fn get_page(&self, url: &str) -> GraphResult<ODataResponse<Value>> {
        self.page_requests.lock().unwrap().push(url.to_string());
        self.pages
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(api_error(400, "UnexpectedRequest", url)))
    }

    async fn send(&self, _request: &GraphRequest) -> GraphResult<Option<Value>> {
        Ok(None)
    }
}

/// In-memory directory of groups that applies `$ref` requests the way Graph
/// does and records the owner count of every touched group after each
/// envelope.
pub struct DirectoryTransport {
    max_owners: usize,
    groups: Mutex<HashMap<String, MembershipState>>,
    owner_counts: Mutex<HashMap<String, Vec<usize>>>,
    violations: Mutex<Vec<String>>,
    envelopes: Mutex<usize>,
}

impl DirectoryTransport {
    pub fn new(max_owners: usize) -> Self {
        Self {
            max_owners,
            groups: Mutex::new(HashMap::new()),
            owner_counts: Mutex::new(HashMap::new()),
            violations: Mutex::new(Vec::new()),
            envelopes: Mutex::new(0),
        }
    }

    pub fn with_group(self, group_id: &str, state: MembershipState) -> Self {
        self.groups
            .lock()
            .unwrap()
            .insert(group_id.to_string(), state);
        self
    }

    pub fn group(&self, group_id: &str) -> MembershipState {
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Owner counts observed after each envelope touching `group_id`.
    pub fn owner_counts(&self, group_id: &str) -> Vec<usize> {
        self.owner_counts
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Requests Graph would have refused because of an owner limit.
    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }

    pub fn envelopes(&self) -> usize {
        *self.envelopes.lock().unwrap()
    }

    fn apply(
        &self,
        groups: &mut HashMap<String, MembershipState>,
        item: &BatchRequestItem,
    ) -> (Option<String>, BatchResponseItem) {
        let path = item.request.url.trim_start_matches('/');
        let segments: Vec<&str> = path.split('/').collect();
        let (group_id, collection, user_id) = match (item.request.method, segments.as_slice()) {
            (Method::Post, ["groups", group, collection, "$ref"]) => {
                let user = item
                    .request
                    .body
                    .as_ref()
                    .and_then(|body| body["@odata.id"].as_str())
                    .and_then(|reference| reference.rsplit('/').next())
                    .unwrap_or_default();
                (*group, *collection, user.to_string())
            }
            (Method::Delete, ["groups", group, collection, user, "$ref"]) => {
                (*group, *collection, (*user).to_string())
            }
            _ => {
                return (
                    None,
                    item_error(&item.id, 400, "BadRequest", "unsupported request"),
                )
            }
        };

        let Some(group) = groups.get_mut(group_id) else {
            return (
                None,
                item_error(&item.id, 404, "Request_ResourceNotFound", "group not found"),
            );
        };
        let owners = collection == "owners";
        let set = if owners { &mut group.owners } else { &mut group.members };

        let response = match item.request.method {
            Method::Post if set.contains(&user_id) => {
                item_error(&item.id, 400, "Request_BadRequest", ALREADY_EXISTS_MESSAGE)
            }
            Method::Post if owners && set.len() >= self.max_owners => {
                self.violations
                    .lock()
                    .unwrap()
                    .push(format!("{group_id}: owner limit exceeded by {user_id}"));
                item_error(&item.id, 400, "Request_BadRequest", "owner limit reached")
            }
            Method::Post => {
                set.insert(user_id);
                status(&item.id, 204)
            }
            _ if !set.contains(&user_id) => item_error(
                &item.id,
                404,
                "Request_ResourceNotFound",
                "reference not found",
            ),
            _ if owners && set.len() == 1 => {
                self.violations
                    .lock()
                    .unwrap()
                    .push(format!("{group_id}: last owner {user_id} removed"));
                item_error(
                    &item.id,
                    400,
                    "Request_BadRequest",
                    "group must keep one owner",
                )
            }
            _ => {
                set.remove(&user_id);
                status(&item.id, 204)
            }
        };
        (Some(group_id.to_string()), response)
    }
}

#[async_trait]
impl GraphTransport for DirectoryTransport {
    async fn send_batch(
        &self,
        requests: Vec<BatchRequestItem>,
    ) -> GraphResult<Vec<BatchResponseItem>> {
        *self.envelopes.lock().unwrap() += 1;
        let mut groups = self.groups.lock().unwrap();
        let mut touched = Vec::new();
        let mut responses = Vec::with_capacity(requests.len());

        for item in &requests {
            let (group_id, response) = self.apply(&mut groups, item);
            if let Some(group_id) = group_id {
                if !touched.contains(&group_id) {
                    touched.push(group_id);
                }
            }
            responses.push(response);
        }

        let mut counts = self.owner_counts.lock().unwrap();
        for group_id in touched {
            let owners = groups.get(&group_id).map_or(0, |g| g.owners.len());
            counts.entry(group_id).or_default().push(owners);
        }
        Ok(responses)
    }

    async fn get_page(&self, url: &str) -> GraphResult<ODataResponse<Value>> {
        Err(api_error(400, "UnexpectedRequest", url))
    }

    async fn send(&self, _request: &GraphRequest) -> GraphResult<Option<Value>> {
        Ok(None)
    }
}
