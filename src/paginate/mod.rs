//! Checkpointed pagination over one fetch plan.
//!
//! The paginator is pull-based: each `next_batch` call performs at most one
//! page fetch and returns either the batch with its post-advance checkpoint,
//! a blocked event, or the reason the walk is over. The caller decides what
//! to persist and when to stop pulling.

pub mod links;

use std::fmt;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::classify::{classify_block, BlockEvent};
use crate::engine::payload;
use crate::engine::{FetchError, FetchMode, FetchOutcome, FetchRequest, HttpEngine, HttpResponse};
use crate::extract::{extract_html_items, extract_json_items};
use crate::plan::FetchPlan;

use links::{absolutize, extract_cursor_token, extract_next_url, parse_link_next};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationKind {
    Page,
    Offset,
    CursorToken,
    NextUrl,
    #[default]
    Unknown,
}

/// Resumable walk position. Serialized as-is into `run_state.state_json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaginationState {
    pub kind: PaginationKind,
    pub url: String,
    pub page: i64,
    pub offset: i64,
    pub cursor: Option<String>,
    pub next_url: Option<String>,
    /// Count of batches completed across the lifetime of the walk.
    pub batch_idx: u32,
}

impl PaginationState {
    pub fn initial(plan: &FetchPlan) -> Self {
        Self {
            kind: plan.pagination.kind,
            url: plan.url.clone(),
            page: plan.pagination.start_from,
            offset: 0,
            cursor: None,
            next_url: None,
            batch_idx: 0,
        }
    }
}

/// Why the walk ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Per-run batch budget exhausted.
    MaxBatches,
    /// A page came back with nothing extractable.
    NoItems,
    /// Fewer items than `limit` with a limit param in play.
    ShortBatch,
    /// The cursor token repeated or disappeared.
    CursorStalled,
    /// No next URL in the Link header or the JSON envelope.
    LastPage,
    /// Unknown pagination kind fetches exactly one page.
    SinglePage,
    /// The request never produced a usable response.
    Transport(String),
    /// The body could not be used (bad JSON, binary, soft error).
    Payload(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxBatches => write!(f, "max_batches"),
            StopReason::NoItems => write!(f, "no_items"),
            StopReason::ShortBatch => write!(f, "short_batch"),
            StopReason::CursorStalled => write!(f, "cursor_stalled"),
            StopReason::LastPage => write!(f, "last_page"),
            StopReason::SinglePage => write!(f, "single_page"),
            StopReason::Transport(e) => write!(f, "transport:{e}"),
            StopReason::Payload(e) => write!(f, "payload:{e}"),
        }
    }
}

/// Everything the blocked-event queue needs to replay the stalled request.
#[derive(Debug)]
pub struct BlockedBatch {
    pub event: BlockEvent,
    pub error: Option<String>,
    pub url: String,
    pub method: String,
    pub params: serde_json::Map<String, Value>,
    /// Pre-advance state, so resume retries the same page.
    pub state: PaginationState,
}

#[derive(Debug)]
pub enum BatchOutcome {
    Batch {
        records: Vec<Value>,
        checkpoint: PaginationState,
    },
    Blocked(Box<BlockedBatch>),
    Done(StopReason),
}

pub struct Paginator<'a> {
    engine: &'a HttpEngine,
    plan: &'a FetchPlan,
    state: PaginationState,
    /// Batches executed in this run, regardless of lifetime `batch_idx`.
    batches_done: u32,
    max_batches: u32,
    /// Stop decided while emitting the previous batch.
    pending_done: Option<StopReason>,
}

impl<'a> Paginator<'a> {
    pub fn new(engine: &'a HttpEngine, plan: &'a FetchPlan, state: Option<PaginationState>) -> Self {
        Self {
            engine,
            plan,
            state: state.unwrap_or_else(|| PaginationState::initial(plan)),
            batches_done: 0,
            max_batches: plan.pagination.max_batches,
            pending_done: None,
        }
    }

    /// Caps the per-run batch budget below the plan's own.
    pub fn with_max_batches(mut self, max_batches: u32) -> Self {
        self.max_batches = max_batches.min(self.plan.pagination.max_batches);
        self
    }

    pub fn state(&self) -> &PaginationState {
        &self.state
    }

    fn build_request(&self) -> FetchRequest {
        let pg = &self.plan.pagination;
        let mut params = self.plan.base_params.clone();
        let mut url = self.state.url.clone();

        match self.state.kind {
            PaginationKind::Page => {
                params.insert(pg.page_param.clone(), json!(self.state.page));
                if let Some(lp) = &pg.limit_param {
                    params.insert(lp.clone(), json!(pg.limit));
                }
            }
            PaginationKind::Offset => {
                params.insert(pg.offset_param.clone(), json!(self.state.offset));
                if let Some(lp) = &pg.limit_param {
                    params.insert(lp.clone(), json!(pg.limit));
                }
            }
            PaginationKind::CursorToken => {
                if let Some(cursor) = &self.state.cursor {
                    let name = pg.cursor_param.as_deref().unwrap_or("cursor");
                    params.insert(name.to_string(), json!(cursor));
                }
                if let Some(lp) = &pg.limit_param {
                    params.insert(lp.clone(), json!(pg.limit));
                }
            }
            PaginationKind::NextUrl => {
                if let Some(next) = &self.state.next_url {
                    url = next.clone();
                }
            }
            PaginationKind::Unknown => {}
        }

        FetchRequest {
            url,
            method: self.plan.method.clone(),
            params,
            headers: self.plan.headers.clone(),
            body: None,
            timeout: Some(Duration::from_secs_f64(self.plan.timeout)),
            expect: self.plan.extract.mode,
        }
    }

    fn blocked(&self, req: &FetchRequest, event: BlockEvent, error: Option<String>) -> BatchOutcome {
        BatchOutcome::Blocked(Box::new(BlockedBatch {
            event,
            error,
            url: req.url.clone(),
            method: req.method.clone(),
            params: req.params.clone(),
            state: self.state.clone(),
        }))
    }

    /// Reads the page body into records, honoring the extraction mode.
    ///
    /// Returns `(records, parsed_json)` on success; `Err` carries the
    /// outcome that ends the walk (blocked or payload stop).
    fn read_records(
        &self,
        req: &FetchRequest,
        resp: &HttpResponse,
    ) -> Result<(Vec<Value>, Option<Value>), BatchOutcome> {
        let mode = self.plan.extract.mode;
        let mut data_json: Option<Value> = None;
        let mut items: Vec<Value> = Vec::new();

        if matches!(mode, FetchMode::Json | FetchMode::Auto) {
            match payload::read_json(resp, mode == FetchMode::Json, self.engine.soft_errors()) {
                Ok(data) => {
                    items = extract_json_items(&data, &self.plan.extract);
                    data_json = Some(data);
                }
                Err(FetchError::SoftError(rule)) => {
                    warn!(
                        "soft error from {} ({rule}); preview: {}",
                        resp.final_url,
                        payload::preview(&resp.text_lossy())
                    );
                    if let Some(event) = classify_block(resp) {
                        return Err(self.blocked(req, event, Some(format!("soft_error:{rule}"))));
                    }
                    if mode == FetchMode::Json {
                        return Err(BatchOutcome::Done(StopReason::Payload(format!(
                            "soft_error:{rule}"
                        ))));
                    }
                }
                Err(e) => {
                    if mode == FetchMode::Json {
                        return Err(BatchOutcome::Done(StopReason::Payload(e.to_string())));
                    }
                }
            }
        }

        if items.is_empty() && matches!(mode, FetchMode::Html | FetchMode::Auto) {
            items = extract_html_items(&resp.text_lossy(), &self.plan.extract);
        }

        Ok((items, data_json))
    }

    fn advance(&mut self, resp: &HttpResponse, data_json: Option<&Value>, count: usize) {
        let pg = &self.plan.pagination;
        match self.state.kind {
            PaginationKind::Page => {
                self.state.page += 1;
            }
            PaginationKind::Offset => {
                let step = if pg.step > 0 {
                    pg.step
                } else if pg.limit_param.is_some() {
                    i64::from(pg.limit)
                } else {
                    count as i64
                };
                self.state.offset += step;
            }
            PaginationKind::CursorToken => {
                let next = data_json.and_then(extract_cursor_token);
                match next {
                    Some(cursor) if self.state.cursor.as_deref() != Some(cursor.as_str()) => {
                        self.state.cursor = Some(cursor);
                    }
                    _ => self.pending_done = Some(StopReason::CursorStalled),
                }
            }
            PaginationKind::NextUrl => {
                let next = parse_link_next(&resp.headers)
                    .or_else(|| data_json.and_then(extract_next_url));
                match next {
                    Some(next) => {
                        let abs = absolutize(&self.plan.url, &next);
                        self.state.next_url = Some(abs.clone());
                        self.state.url = abs;
                    }
                    None => self.pending_done = Some(StopReason::LastPage),
                }
            }
            PaginationKind::Unknown => {
                self.pending_done = Some(StopReason::SinglePage);
            }
        }
        self.state.batch_idx += 1;

        // A batch under the requested size usually means the collection ended.
        if self.pending_done.is_none()
            && pg.limit_param.is_some()
            && pg.limit > 0
            && count < pg.limit as usize
        {
            self.pending_done = Some(StopReason::ShortBatch);
        }
    }

    pub async fn next_batch(&mut self) -> BatchOutcome {
        if let Some(reason) = self.pending_done.take() {
            return BatchOutcome::Done(reason);
        }
        if self.batches_done >= self.max_batches {
            return BatchOutcome::Done(StopReason::MaxBatches);
        }

        let req = self.build_request();
        debug!(
            "batch {} ({:?}): {} {}",
            self.state.batch_idx, self.state.kind, req.method, req.url
        );

        let resp = match self.engine.fetch(&req).await {
            FetchOutcome::Success(resp) => resp,
            FetchOutcome::Failed {
                response: Some(resp),
                error,
            } => {
                return match classify_block(&resp) {
                    Some(event) => self.blocked(&req, event, Some(error.to_string())),
                    None => BatchOutcome::Done(StopReason::Transport(error.to_string())),
                };
            }
            FetchOutcome::Failed {
                response: None,
                error,
            } => {
                warn!("fetch failed with no response for {}: {error}", req.url);
                return BatchOutcome::Done(StopReason::Transport(error.to_string()));
            }
        };

        let (items, data_json) = match self.read_records(&req, &resp) {
            Ok(pair) => pair,
            Err(outcome) => return outcome,
        };
        if items.is_empty() {
            return BatchOutcome::Done(StopReason::NoItems);
        }

        // downstream expects objects; scalar items get wrapped
        let records: Vec<Value> = items
            .into_iter()
            .map(|it| if it.is_object() { it } else { json!({ "value": it }) })
            .collect();

        self.advance(&resp, data_json.as_ref(), records.len());
        self.batches_done += 1;

        BatchOutcome::Batch {
            records,
            checkpoint: self.state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::FetchPlan;
    use std::collections::BTreeMap;

    fn plan_json(kind: &str) -> FetchPlan {
        serde_json::from_value(json!({
            "name": "demo",
            "url": "https://site.com/api/items",
            "pagination": {"kind": kind, "limit": 2, "limit_param": "limit"}
        }))
        .unwrap()
    }

    #[test]
    fn state_round_trips_through_json() {
        let state = PaginationState {
            kind: PaginationKind::CursorToken,
            url: "https://site.com/api/items".to_string(),
            page: 1,
            offset: 40,
            cursor: Some("abc".to_string()),
            next_url: None,
            batch_idx: 7,
        };
        let text = serde_json::to_string(&state).unwrap();
        let back: PaginationState = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, PaginationKind::CursorToken);
        assert_eq!(back.offset, 40);
        assert_eq!(back.cursor.as_deref(), Some("abc"));
        assert_eq!(back.batch_idx, 7);
    }

    #[test]
    fn page_request_carries_page_and_limit_params() {
        let plan = plan_json("page");
        let engine = HttpEngine::new(reqwest::Client::new());
        let p = Paginator::new(&engine, &plan, None);
        let req = p.build_request();
        assert_eq!(req.params.get("page"), Some(&json!(1)));
        assert_eq!(req.params.get("limit"), Some(&json!(2)));
    }

    #[test]
    fn offset_advance_uses_limit_then_batch_size() {
        let plan = plan_json("offset");
        let engine = HttpEngine::new(reqwest::Client::new());
        let mut p = Paginator::new(&engine, &plan, None);
        let resp = HttpResponse {
            status: 200,
            final_url: plan.url.clone(),
            headers: Default::default(),
            body: Vec::new(),
            elapsed_ms: 0,
        };
        p.advance(&resp, None, 2);
        assert_eq!(p.state.offset, 2);
        // limit_param set, so limit (2) wins over batch size (5)
        p.advance(&resp, None, 5);
        assert_eq!(p.state.offset, 4);
    }

    #[test]
    fn cursor_stall_defers_the_stop_to_the_next_pull() {
        let plan = plan_json("cursor_token");
        let engine = HttpEngine::new(reqwest::Client::new());
        let mut p = Paginator::new(&engine, &plan, None);
        let resp = HttpResponse {
            status: 200,
            final_url: plan.url.clone(),
            headers: Default::default(),
            body: Vec::new(),
            elapsed_ms: 0,
        };

        let first = json!({"next_cursor": "aaa"});
        p.advance(&resp, Some(&first), 2);
        assert_eq!(p.state.cursor.as_deref(), Some("aaa"));
        assert_eq!(p.pending_done, None);

        // same token again: batch still emitted, stop queued
        p.advance(&resp, Some(&first), 2);
        assert_eq!(p.pending_done, Some(StopReason::CursorStalled));
    }

    #[test]
    fn short_batch_queues_a_stop() {
        let plan = plan_json("page");
        let engine = HttpEngine::new(reqwest::Client::new());
        let mut p = Paginator::new(&engine, &plan, None);
        let resp = HttpResponse {
            status: 200,
            final_url: plan.url.clone(),
            headers: Default::default(),
            body: Vec::new(),
            elapsed_ms: 0,
        };
        p.advance(&resp, None, 1);
        assert_eq!(p.state.page, 2);
        assert_eq!(p.pending_done, Some(StopReason::ShortBatch));
    }

    #[test]
    fn next_url_advance_absolutizes_relative_links() {
        let plan = plan_json("next_url");
        let engine = HttpEngine::new(reqwest::Client::new());
        let mut p = Paginator::new(&engine, &plan, None);
        let resp = HttpResponse {
            status: 200,
            final_url: plan.url.clone(),
            headers: Default::default(),
            body: Vec::new(),
            elapsed_ms: 0,
        };
        let data = json!({"next": "https://site.com/api/items?page=2"});
        p.advance(&resp, Some(&data), 2);
        assert_eq!(
            p.state.url,
            "https://site.com/api/items?page=2"
        );

        // Link header beats the JSON envelope
        let resp = HttpResponse {
            headers: BTreeMap::from([(
                "link".to_string(),
                "<https://site.com/api/items?page=3>; rel=\"next\"".to_string(),
            )]),
            ..resp
        };
        p.advance(&resp, Some(&data), 2);
        assert_eq!(p.state.url, "https://site.com/api/items?page=3");
    }
}
