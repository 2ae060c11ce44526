use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::chart;
use crate::constants::{SQL_PREVIEW_ROWS, TOOL_EXECUTE_SQL, TOOL_RECOMMEND_CHART};
use crate::json_extract::extract_embedded_object;
use crate::types::{
    ChartConfig, ToolCallPayload, ToolCallRecord, ToolCallStatus, ToolResultPayload,
    ToolResultStatus,
};

/// Summary of an `execute_sql` result, shown as a `sql_result` process step.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SqlResultSummary {
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub preview: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivedArtifact {
    SqlResult(SqlResultSummary),
    Chart(ChartConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultDisposition {
    /// No `tool_call` was seen for this id; nothing was recorded.
    UnknownId,
    /// The record already reached a terminal status.
    AlreadySettled,
    Settled {
        record: ToolCallRecord,
        derived: Option<DerivedArtifact>,
    },
}

#[derive(Debug, Default)]
pub struct ToolCallTracker {
    records: Vec<ToolCallRecord>,
    index: HashMap<String, usize>,
}

fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn first_u64(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| map.get(*k).and_then(|v| v.as_u64()))
}

fn first_f64(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| map.get(*k).and_then(|v| v.as_f64()))
}

fn summarize_sql(map: &Map<String, Value>) -> Option<SqlResultSummary> {
    let rows = map.get("rows").and_then(|v| v.as_array());
    let total = first_u64(map, &["total_rows", "row_count", "rowCount", "totalRows"]);
    let row_count = match (total, rows) {
        (Some(n), _) => n,
        (None, Some(rows)) => rows.len() as u64,
        (None, None) => return None,
    };

    let columns = match map.get("columns").and_then(|v| v.as_array()) {
        Some(cols) => cols
            .iter()
            .filter_map(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("name").and_then(|n| n.as_str()).map(str::to_string),
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    };

    let preview = match rows {
        Some(rows) => rows.iter().take(SQL_PREVIEW_ROWS).cloned().collect(),
        None => Vec::new(),
    };

    Some(SqlResultSummary {
        row_count,
        execution_time: first_f64(
            map,
            &["execution_time", "execution_time_ms", "executionTime"],
        ),
        columns,
        sql: map.get("sql").and_then(|v| v.as_str()).map(str::to_string),
        preview,
    })
}

/// `structured_data` first; otherwise dig a JSON object out of the free-text result.
fn derive_sql(payload: &ToolResultPayload) -> Option<SqlResultSummary> {
    let structured = match &payload.structured_data {
        Some(Value::Object(map)) => summarize_sql(map),
        _ => None,
    };
    if structured.is_some() {
        return structured;
    }

    match &payload.result {
        Some(Value::Object(map)) => summarize_sql(map),
        Some(Value::String(text)) => extract_embedded_object(text).and_then(|m| summarize_sql(&m)),
        _ => None,
    }
}

fn derive_chart(payload: &ToolResultPayload) -> Option<ChartConfig> {
    if let Some(config) = payload.structured_data.as_ref().and_then(chart::normalize_value) {
        return Some(config);
    }

    let raw = match &payload.result {
        Some(Value::String(text)) => serde_json::from_str::<Value>(text).ok()?,
        Some(other) => other.clone(),
        None => return None,
    };
    chart::normalize_value(&raw)
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call in `calling` state. Returns `None` for a duplicate id (first one wins).
    pub fn on_call(&mut self, call: ToolCallPayload) -> Option<&ToolCallRecord> {
        if self.index.contains_key(&call.id) {
            tracing::debug!("[TOOLS] Duplicate tool_call id {} ignored", call.id);
            return None;
        }

        tracing::debug!("[TOOLS] Tool call {} started: {}", call.id, call.name);
        let position = self.records.len();
        self.index.insert(call.id.clone(), position);
        self.records.push(ToolCallRecord {
            id: call.id,
            name: call.name,
            arguments: call.arguments,
            status: ToolCallStatus::Calling,
            result: None,
            error: None,
        });
        self.records.get(position)
    }

    pub fn on_result(&mut self, payload: ToolResultPayload) -> ResultDisposition {
        let Some(&position) = self.index.get(&payload.id) else {
            tracing::debug!("[TOOLS] tool_result for unknown id {} dropped", payload.id);
            return ResultDisposition::UnknownId;
        };
        let Some(record) = self.records.get_mut(position) else {
            return ResultDisposition::UnknownId;
        };
        if record.status != ToolCallStatus::Calling {
            tracing::debug!("[TOOLS] Tool call {} already settled", payload.id);
            return ResultDisposition::AlreadySettled;
        }

        let text = payload.result.as_ref().map(result_text);
        let derived = match payload.status {
            ToolResultStatus::Success => {
                record.status = ToolCallStatus::Success;
                record.result = text;
                match record.name.as_str() {
                    TOOL_EXECUTE_SQL => derive_sql(&payload).map(DerivedArtifact::SqlResult),
                    TOOL_RECOMMEND_CHART => derive_chart(&payload).map(DerivedArtifact::Chart),
                    _ => None,
                }
            }
            ToolResultStatus::Error => {
                record.status = ToolCallStatus::Error;
                record.error = match payload.error.clone() {
                    Some(e) => Some(e),
                    None => text.clone(),
                };
                record.result = text;
                tracing::warn!(
                    "[TOOLS] Tool {} ({}) failed: {}",
                    record.name,
                    record.id,
                    record.error.as_deref().unwrap_or("no error message")
                );
                None
            }
        };

        ResultDisposition::Settled {
            record: record.clone(),
            derived,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ToolCallRecord> {
        self.index.get(id).and_then(|&i| self.records.get(i))
    }

    pub fn records(&self) -> &[ToolCallRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ToolCallRecord> {
        self.records
    }
}
