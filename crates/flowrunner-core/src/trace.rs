//! Execution trace: one span per handler invocation, nested iteration spans
//! under loop blocks, and run-level cost/token aggregation.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Success,
    Error,
    Skipped,
}

/// Per-model monetary cost.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub fn add(&mut self, other: &CostBreakdown) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }
}

/// One entry in the execution trace. Inputs and outputs are redacted copies,
/// never references into live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub block_id: String,
    pub block_name: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: SpanStatus,
    pub input: Value,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Span>,
}

/// Aggregated run cost: per-model breakdown plus token totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub by_model: BTreeMap<String, CostBreakdown>,
    pub tokens: TokenUsage,
    pub total: f64,
}

impl CostSummary {
    pub fn add(&mut self, model: &str, cost: &CostBreakdown, tokens: &TokenUsage) {
        self.by_model.entry(model.to_string()).or_default().add(cost);
        self.tokens.add(tokens);
        self.total += cost.total;
    }
}

struct LoopFrame {
    started_at: DateTime<Utc>,
    iterations: Vec<Span>,
    current: Vec<Span>,
}

/// Collects spans in start order, routing loop-body spans into per-iteration
/// frames that close into the owning loop block's span.
pub struct TraceCollector {
    spans: Vec<Span>,
    frames: HashMap<String, LoopFrame>,
    cost: CostSummary,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            frames: HashMap::new(),
            cost: CostSummary::default(),
        }
    }

    /// Append a span; `owner` is the innermost enclosing loop, if any.
    pub fn record(&mut self, span: Span, owner: Option<&str>) {
        match owner {
            Some(loop_id) => {
                let frame = self
                    .frames
                    .entry(loop_id.to_string())
                    .or_insert_with(|| LoopFrame {
                        started_at: span.started_at,
                        iterations: Vec::new(),
                        current: Vec::new(),
                    });
                frame.current.push(span);
            }
            None => self.spans.push(span),
        }
    }

    pub fn add_usage(&mut self, model: &str, cost: &CostBreakdown, tokens: &TokenUsage) {
        self.cost.add(model, cost, tokens);
    }

    /// Close the open iteration of a loop into a nested iteration span.
    pub fn close_iteration(&mut self, loop_id: &str, index: u32, results: Value) {
        let Some(frame) = self.frames.get_mut(loop_id) else {
            return;
        };
        let body = std::mem::take(&mut frame.current);
        let mut span = wrap_iteration(loop_id, index, body);
        span.output = results;
        frame.iterations.push(span);
    }

    /// Close a completed loop: its span adopts the iteration spans and is
    /// recorded at the owner level (an outer loop frame, or top level).
    pub fn close_loop(
        &mut self,
        loop_id: &str,
        block_name: &str,
        output: Value,
        owner: Option<&str>,
    ) {
        let frame = self.frames.remove(loop_id);
        let (started_at, iterations) = match frame {
            Some(mut f) => {
                // A partially recorded iteration still counts toward the trace.
                if !f.current.is_empty() {
                    let leftover = std::mem::take(&mut f.current);
                    let index = f.iterations.len() as u32;
                    f.iterations.push(wrap_iteration(loop_id, index, leftover));
                }
                (f.started_at, f.iterations)
            }
            None => (Utc::now(), Vec::new()),
        };
        let ended_at = iterations.last().map(|s| s.ended_at).unwrap_or(started_at);
        let span = Span {
            block_id: loop_id.to_string(),
            block_name: block_name.to_string(),
            kind: "loop".to_string(),
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
            status: SpanStatus::Success,
            input: Value::Null,
            output,
            cost: None,
            tokens: None,
            children: iterations,
        };
        self.record(span, owner);
    }

    /// Flush everything, closing any frames left open by cancellation or a
    /// mid-loop failure.
    pub fn finish(mut self) -> (Vec<Span>, CostSummary) {
        let mut leftover_ids: Vec<String> = self.frames.keys().cloned().collect();
        leftover_ids.sort();
        for loop_id in leftover_ids {
            if let Some(mut frame) = self.frames.remove(&loop_id) {
                if !frame.current.is_empty() {
                    let index = frame.iterations.len() as u32;
                    let body = std::mem::take(&mut frame.current);
                    frame.iterations.push(wrap_iteration(&loop_id, index, body));
                }
                self.spans.extend(frame.iterations);
            }
        }
        (self.spans, self.cost)
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn wrap_iteration(loop_id: &str, index: u32, body: Vec<Span>) -> Span {
    let started_at = body.first().map(|s| s.started_at).unwrap_or_else(Utc::now);
    let ended_at = body.last().map(|s| s.ended_at).unwrap_or(started_at);
    Span {
        block_id: loop_id.to_string(),
        block_name: format!("iteration {index}"),
        kind: "iteration".to_string(),
        started_at,
        ended_at,
        duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
        status: SpanStatus::Success,
        input: Value::Null,
        output: Value::Null,
        cost: None,
        tokens: None,
        children: body,
    }
}
