//! Live in-memory mirror of the unified log for active sessions.
//!
//! The mirror exposes the same writer surface as the durable log but keeps
//! rows only while their session is active, evicting them a grace period
//! after the session goes terminal.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use super::row::{CostUpdate, LogRow, NodeType};
use super::writer::{CostApplied, EchoError, LogWriter};

const DEFAULT_GRACE: Duration = Duration::from_secs(30);

#[derive(Default)]
struct MirrorInner {
    rows: Vec<Option<LogRow>>,
    by_trace: FxHashMap<String, usize>,
    by_request: FxHashMap<String, usize>,
    by_session: FxHashMap<String, Vec<usize>>,
    by_cascade: FxHashMap<String, Vec<usize>>,
    by_session_phase: FxHashMap<(String, String), Vec<usize>>,
    ended: FxHashMap<String, DateTime<Utc>>,
}

impl MirrorInner {
    fn insert(&mut self, row: LogRow) {
        let idx = self.rows.len();
        self.by_trace.insert(row.trace_id.clone(), idx);
        if let Some(req) = &row.provider_request_id {
            self.by_request.insert(req.clone(), idx);
        }
        self.by_session
            .entry(row.session_id.clone())
            .or_default()
            .push(idx);
        if let Some(cascade) = &row.cascade_id {
            self.by_cascade.entry(cascade.clone()).or_default().push(idx);
        }
        if let Some(phase) = &row.phase_name {
            self.by_session_phase
                .entry((row.session_id.clone(), phase.clone()))
                .or_default()
                .push(idx);
        }
        self.rows.push(Some(row));
    }

    fn drop_session(&mut self, session_id: &str) {
        if let Some(indices) = self.by_session.remove(session_id) {
            for idx in indices {
                if let Some(row) = self.rows[idx].take() {
                    self.by_trace.remove(&row.trace_id);
                    if let Some(req) = &row.provider_request_id {
                        self.by_request.remove(req);
                    }
                    if let Some(cascade) = &row.cascade_id {
                        if let Some(list) = self.by_cascade.get_mut(cascade) {
                            list.retain(|i| *i != idx);
                        }
                    }
                    if let Some(phase) = &row.phase_name {
                        if let Some(list) = self
                            .by_session_phase
                            .get_mut(&(row.session_id.clone(), phase.clone()))
                        {
                            list.retain(|i| *i != idx);
                        }
                    }
                }
            }
        }
        self.ended.remove(session_id);
    }
}

/// Indexed in-memory row store for active sessions.
pub struct LiveMirror {
    inner: RwLock<MirrorInner>,
    grace: Duration,
}

impl Default for LiveMirror {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl LiveMirror {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: RwLock::new(MirrorInner::default()),
            grace,
        }
    }

    /// Spawn the background scavenger that evicts terminal sessions past the
    /// grace period. Returns the task handle; drop it to stop scavenging.
    pub fn spawn_scavenger(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mirror = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                mirror.scavenge();
            }
        })
    }

    /// Remove rows whose session has been terminal longer than the grace
    /// period.
    pub fn scavenge(&self) {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::seconds(30));
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<String> = inner
            .ended
            .iter()
            .filter(|(_, ended_at)| now.signed_duration_since(**ended_at) > grace)
            .map(|(session, _)| session.clone())
            .collect();
        for session in expired {
            inner.drop_session(&session);
        }
    }

    /// Mark a session terminal; its rows survive for the grace period.
    pub fn end_session(&self, session_id: &str) {
        self.inner
            .write()
            .unwrap()
            .ended
            .insert(session_id.to_string(), Utc::now());
    }

    /// Drop a session's rows immediately.
    pub fn clear_session(&self, session_id: &str) {
        self.inner.write().unwrap().drop_session(session_id);
    }

    #[must_use]
    pub fn row_by_trace(&self, trace_id: &str) -> Option<LogRow> {
        let inner = self.inner.read().unwrap();
        inner
            .by_trace
            .get(trace_id)
            .and_then(|idx| inner.rows[*idx].clone())
    }

    #[must_use]
    pub fn rows_for_session(&self, session_id: &str) -> Vec<LogRow> {
        let inner = self.inner.read().unwrap();
        inner
            .by_session
            .get(session_id)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|idx| inner.rows[*idx].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn rows_for_cascade(&self, cascade_id: &str) -> Vec<LogRow> {
        let inner = self.inner.read().unwrap();
        inner
            .by_cascade
            .get(cascade_id)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|idx| inner.rows[*idx].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn rows_for_phase(&self, session_id: &str, phase: &str) -> Vec<LogRow> {
        let inner = self.inner.read().unwrap();
        inner
            .by_session_phase
            .get(&(session_id.to_string(), phase.to_string()))
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|idx| inner.rows[*idx].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .filter(|r| r.is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogWriter for LiveMirror {
    async fn append(&self, row: LogRow) -> Result<(), EchoError> {
        self.inner.write().unwrap().insert(row);
        Ok(())
    }

    async fn update_cost(
        &self,
        provider_request_id: &str,
        update: &CostUpdate,
    ) -> Result<CostApplied, EchoError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(idx) = inner.by_request.get(provider_request_id).copied() {
            if let Some(row) = inner.rows[idx].as_mut() {
                if row.cost.is_some() && row.tokens_in.is_some() && row.tokens_out.is_some() {
                    return Ok(CostApplied::Ignored);
                }
                row.cost = row.cost.or(update.cost);
                row.tokens_in = row.tokens_in.or(update.tokens_in);
                row.tokens_out = row.tokens_out.or(update.tokens_out);
                row.tokens_reasoning = row.tokens_reasoning.or(update.tokens_reasoning);
                if row.provider.is_none() {
                    row.provider = update.provider.clone();
                }
                return Ok(CostApplied::Updated);
            }
        }
        // Trace unknown to the mirror: surface the cost as a fresh row so
        // per-session aggregations stay correct regardless of ordering.
        let mut row = LogRow::new("unknown", NodeType::CostUpdate, "system")
            .with_content(serde_json::json!({
                "provider_request_id": provider_request_id,
                "cost": update.cost,
                "tokens_in": update.tokens_in,
                "tokens_out": update.tokens_out,
            }));
        row.provider_request_id = Some(provider_request_id.to_string());
        row.cost = update.cost;
        row.tokens_in = update.tokens_in;
        row.tokens_out = update.tokens_out;
        row.tokens_reasoning = update.tokens_reasoning;
        row.provider = update.provider.clone();
        inner.insert(row);
        Ok(CostApplied::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(session: &str, phase: Option<&str>, request: Option<&str>) -> LogRow {
        let mut row = LogRow::new(session, NodeType::TurnOutput, "assistant")
            .with_content(json!("hi"));
        row.phase_name = phase.map(str::to_string);
        row.provider_request_id = request.map(str::to_string);
        row
    }

    #[tokio::test]
    async fn insert_and_query_by_indices() {
        let mirror = LiveMirror::default();
        mirror.append(row("s1", Some("triage"), None)).await.unwrap();
        mirror.append(row("s1", Some("draft"), None)).await.unwrap();
        mirror.append(row("s2", Some("triage"), None)).await.unwrap();

        assert_eq!(mirror.rows_for_session("s1").len(), 2);
        assert_eq!(mirror.rows_for_phase("s1", "triage").len(), 1);
        assert_eq!(mirror.rows_for_session("s2").len(), 1);
    }

    #[tokio::test]
    async fn cost_update_with_fallback_insert() {
        let mirror = LiveMirror::default();
        mirror
            .append(row("s1", None, Some("req-1")))
            .await
            .unwrap();

        let update = CostUpdate {
            cost: Some(0.01),
            tokens_in: Some(100),
            tokens_out: Some(20),
            ..Default::default()
        };
        assert_eq!(
            mirror.update_cost("req-1", &update).await.unwrap(),
            CostApplied::Updated
        );
        // Second application is a no-op.
        assert_eq!(
            mirror.update_cost("req-1", &update).await.unwrap(),
            CostApplied::Ignored
        );
        // Unknown request id inserts a fresh cost_update row.
        assert_eq!(
            mirror.update_cost("req-unknown", &update).await.unwrap(),
            CostApplied::Inserted
        );
    }

    #[tokio::test]
    async fn end_session_evicts_after_grace() {
        let mirror = LiveMirror::new(Duration::from_secs(0));
        mirror.append(row("s1", None, None)).await.unwrap();
        mirror.end_session("s1");
        std::thread::sleep(Duration::from_millis(5));
        mirror.scavenge();
        assert!(mirror.rows_for_session("s1").is_empty());
    }

    #[tokio::test]
    async fn clear_session_is_immediate() {
        let mirror = LiveMirror::default();
        mirror.append(row("s1", None, None)).await.unwrap();
        mirror.clear_session("s1");
        assert!(mirror.is_empty());
    }
}
