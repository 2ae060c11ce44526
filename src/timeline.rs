use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::tool_calls::SqlResultSummary;
use crate::types::{
    ChartConfig, ProcessStep, ProcessStepKind, RagSource, StepStatus, ToolCallRecord,
    ToolCallStatus,
};

/// Ordered diagnostic log of the work behind one reply.
///
/// Steps are only ever appended. A step that starts `running` is settled at
/// most once; settling never moves it within the list.
#[derive(Debug, Default)]
pub struct ProcessTimeline {
    steps: Vec<ProcessStep>,
    tool_steps: HashMap<String, usize>,
    reasoning_step: Option<usize>,
}

impl ProcessTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        &mut self,
        kind: ProcessStepKind,
        title: String,
        status: StepStatus,
        data: Value,
    ) -> usize {
        let now = Utc::now();
        let end_time = match status {
            StepStatus::Running => None,
            _ => Some(now),
        };
        self.steps.push(ProcessStep {
            id: format!("step_{}", Uuid::new_v4().simple()),
            kind,
            title,
            status,
            start_time: now,
            end_time,
            data,
        });
        self.steps.len() - 1
    }

    fn settle(&mut self, position: usize, status: StepStatus, extra: Option<(&str, Value)>) -> bool {
        let Some(step) = self.steps.get_mut(position) else {
            return false;
        };
        if step.status != StepStatus::Running {
            return false;
        }
        step.status = status;
        step.end_time = Some(Utc::now());
        if let Some((key, value)) = extra {
            if let Value::Object(map) = &mut step.data {
                map.insert(key.to_string(), value);
            }
        }
        true
    }

    /// Opens the reasoning step on the first reasoning text of the reply.
    pub fn begin_reasoning(&mut self) -> bool {
        if self.reasoning_step.is_some() {
            return false;
        }
        let position = self.push(
            ProcessStepKind::Reasoning,
            "Reasoning".to_string(),
            StepStatus::Running,
            json!({}),
        );
        self.reasoning_step = Some(position);
        true
    }

    pub fn end_reasoning(&mut self) -> bool {
        match self.reasoning_step {
            Some(position) => self.settle(position, StepStatus::Success, None),
            None => false,
        }
    }

    pub fn begin_tool_call(&mut self, record: &ToolCallRecord) {
        let position = self.push(
            ProcessStepKind::ToolCall,
            format!("Calling {}", record.name),
            StepStatus::Running,
            json!({
                "toolCallId": record.id,
                "name": record.name,
                "arguments": record.arguments,
            }),
        );
        self.tool_steps.insert(record.id.clone(), position);
    }

    pub fn settle_tool_call(&mut self, record: &ToolCallRecord) -> bool {
        let Some(&position) = self.tool_steps.get(&record.id) else {
            return false;
        };
        let (status, extra) = match record.status {
            ToolCallStatus::Calling => return false,
            ToolCallStatus::Success => (
                StepStatus::Success,
                record.result.clone().map(|r| ("result", Value::String(r))),
            ),
            ToolCallStatus::Error => (
                StepStatus::Error,
                record.error.clone().map(|e| ("error", Value::String(e))),
            ),
        };
        self.settle(position, status, extra)
    }

    pub fn record_sql_result(&mut self, summary: &SqlResultSummary) {
        let data = match serde_json::to_value(summary) {
            Ok(v) => v,
            Err(_) => json!({ "rowCount": summary.row_count }),
        };
        self.push(
            ProcessStepKind::SqlResult,
            format!("Query returned {} rows", summary.row_count),
            StepStatus::Success,
            data,
        );
    }

    pub fn record_chart(&mut self, chart: &ChartConfig) {
        let data = match serde_json::to_value(chart) {
            Ok(v) => v,
            Err(_) => json!({ "chartType": chart.chart_type }),
        };
        self.push(
            ProcessStepKind::ChartConfig,
            format!("Recommended {} chart", chart.chart_type),
            StepStatus::Success,
            data,
        );
    }

    pub fn record_rag_sources(&mut self, sources: &[RagSource]) {
        self.push(
            ProcessStepKind::RagSource,
            format!("Retrieved {} knowledge sources", sources.len()),
            StepStatus::Success,
            json!({ "sources": sources }),
        );
    }

    pub fn steps(&self) -> &[ProcessStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<ProcessStep> {
        self.steps
    }
}
