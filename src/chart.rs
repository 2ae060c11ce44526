//! Chart payload normalization
//!
//! Tool output describing a chart arrives in several shapes: shorthand
//! (`xField`, `yFields`, `valueField` ...), explicit axis/series objects, or an
//! already canonical [`ChartConfig`]. [`normalize`] runs a fixed, ordered rule
//! table over the raw object; a later rule overrides what an earlier one set.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::constants::CHART_PALETTE;
use crate::types::{AxisSpec, ChartConfig, SeriesSpec};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChartRejection {
    #[error("chart payload is not a JSON object")]
    NotAnObject,
    #[error("chart payload has no chart type")]
    MissingType,
    #[error("chart payload has no data rows")]
    MissingData,
}

/// A JSON object believed to describe a chart, shape unknown.
#[derive(Debug, Clone)]
pub struct RawChartPayload(Map<String, Value>);

impl RawChartPayload {
    /// Accepts an object, unwrapping a `chart_config` / `chartConfig` envelope.
    pub fn from_value(value: &Value) -> Result<Self, ChartRejection> {
        let map = value.as_object().ok_or(ChartRejection::NotAnObject)?;
        for envelope in ["chart_config", "chartConfig"] {
            if let Some(Value::Object(inner)) = map.get(envelope) {
                return Ok(Self(inner.clone()));
            }
        }
        Ok(Self(map.clone()))
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    fn text(&self, key: &str) -> Option<String> {
        non_empty_str(self.0.get(key)?)
    }
}

#[derive(Debug, Default)]
struct ChartDraft {
    chart_type: Option<String>,
    title: Option<String>,
    x_axis: Option<AxisSpec>,
    y_axis: Option<AxisSpec>,
    series: Vec<SeriesSpec>,
    data: Option<Vec<Value>>,
    image_url: Option<String>,
}

type Rule = fn(&RawChartPayload, &mut ChartDraft);

/// Applied top to bottom.
const RULES: &[(&str, Rule)] = &[
    ("chart_type", apply_chart_type),
    ("data", apply_data),
    ("title", apply_title),
    ("shorthand", apply_shorthand),
    ("explicit_axes", apply_explicit_axes),
    ("explicit_series", apply_explicit_series),
    ("image_url", apply_image_url),
];

fn non_empty_str(value: &Value) -> Option<String> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Some(s.to_string()),
        _ => None,
    }
}

fn palette_color(index: usize) -> String {
    CHART_PALETTE[index % CHART_PALETTE.len()].to_string()
}

/// `[key_a, key_b]`: the last key present wins.
fn last_of(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(non_empty_str))
        .last()
}

fn apply_chart_type(raw: &RawChartPayload, draft: &mut ChartDraft) {
    if let Some(t) = last_of(&raw.0, &["type", "chartType"]) {
        draft.chart_type = Some(t);
    }
}

fn apply_data(raw: &RawChartPayload, draft: &mut ChartDraft) {
    if let Some(Value::Array(rows)) = raw.get("data") {
        draft.data = Some(rows.clone());
    }
}

fn apply_title(raw: &RawChartPayload, draft: &mut ChartDraft) {
    if let Some(title) = raw.text("title") {
        draft.title = Some(title);
    }
}

fn apply_shorthand(raw: &RawChartPayload, draft: &mut ChartDraft) {
    if let Some(field) = last_of(&raw.0, &["xField", "nameField"]) {
        draft.x_axis = Some(AxisSpec { field, label: None });
    }

    let mut fields: Option<Vec<String>> = None;
    match raw.get("yFields") {
        Some(Value::Array(items)) => {
            fields = Some(items.iter().filter_map(non_empty_str).collect());
        }
        Some(single) => {
            if let Some(f) = non_empty_str(single) {
                fields = Some(vec![f]);
            }
        }
        None => {}
    }
    if let Some(f) = raw.text("valueField") {
        fields = Some(vec![f]);
    }

    if let Some(fields) = fields {
        draft.series = fields
            .into_iter()
            .enumerate()
            .map(|(i, field)| SeriesSpec {
                field,
                label: None,
                color: Some(palette_color(i)),
            })
            .collect();
    }
}

fn explicit_axis(value: &Value) -> Option<(Option<String>, Option<String>)> {
    let map = value.as_object()?;
    let field = last_of(map, &["dataKey", "field"]);
    let label = last_of(map, &["name", "label"]);
    Some((field, label))
}

fn merge_axis(current: &mut Option<AxisSpec>, explicit: Option<&Value>) {
    let Some((field, label)) = explicit.and_then(explicit_axis) else {
        return;
    };
    match (field, current.as_mut()) {
        (Some(field), _) => *current = Some(AxisSpec { field, label }),
        (None, Some(axis)) => {
            if label.is_some() {
                axis.label = label;
            }
        }
        (None, None) => {}
    }
}

fn apply_explicit_axes(raw: &RawChartPayload, draft: &mut ChartDraft) {
    merge_axis(&mut draft.x_axis, raw.get("xAxis"));
    merge_axis(&mut draft.y_axis, raw.get("yAxis"));
}

fn apply_explicit_series(raw: &RawChartPayload, draft: &mut ChartDraft) {
    let Some(Value::Array(entries)) = raw.get("series") else {
        return;
    };
    draft.series = entries
        .iter()
        .filter_map(|entry| {
            let map = entry.as_object()?;
            Some(SeriesSpec {
                field: last_of(map, &["dataKey", "field"])?,
                label: last_of(map, &["name", "label"]),
                color: map.get("color").and_then(non_empty_str),
            })
        })
        .collect();
}

fn apply_image_url(raw: &RawChartPayload, draft: &mut ChartDraft) {
    if let Some(url) = last_of(&raw.0, &["image_url", "imageUrl"]) {
        draft.image_url = Some(url);
    }
}

pub fn normalize(raw: &RawChartPayload) -> Result<ChartConfig, ChartRejection> {
    let mut draft = ChartDraft::default();
    for (name, rule) in RULES {
        rule(raw, &mut draft);
        tracing::trace!("[CHART] applied rule {}", name);
    }

    let chart_type = draft.chart_type.ok_or(ChartRejection::MissingType)?;
    let data = match draft.data {
        Some(rows) if !rows.is_empty() => rows,
        _ => return Err(ChartRejection::MissingData),
    };

    Ok(ChartConfig {
        chart_type,
        title: draft.title,
        x_axis: draft.x_axis,
        y_axis: draft.y_axis,
        series: draft.series,
        data,
        image_url: draft.image_url,
    })
}

/// Convenience entry point for tool payloads; failures are logged and swallowed.
pub fn normalize_value(value: &Value) -> Option<ChartConfig> {
    let outcome = RawChartPayload::from_value(value).and_then(|raw| normalize(&raw));
    match outcome {
        Ok(config) => Some(config),
        Err(reason) => {
            tracing::debug!("[CHART] payload skipped: {}", reason);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(config: &ChartConfig) -> Vec<&str> {
        config.series.iter().map(|s| s.field.as_str()).collect()
    }

    #[test]
    fn test_shorthand_bar_chart() {
        let raw = json!({
            "type": "bar",
            "xField": "month",
            "yFields": ["revenue", "cost"],
            "data": [{"month": "1月", "revenue": 42, "cost": 28}]
        });
        let config = normalize_value(&raw).expect("chart should normalize");
        assert_eq!(config.chart_type, "bar");
        assert_eq!(config.x_axis.as_ref().map(|a| a.field.as_str()), Some("month"));
        assert_eq!(fields(&config), vec!["revenue", "cost"]);
        assert_eq!(config.series[0].color.as_deref(), Some(CHART_PALETTE[0]));
        assert_eq!(config.series[1].color.as_deref(), Some(CHART_PALETTE[1]));
    }

    #[test]
    fn test_explicit_objects_override_shorthand() {
        let raw = json!({
            "chartType": "line",
            "nameField": "day",
            "valueField": "pv",
            "xAxis": {"dataKey": "date", "name": "Date"},
            "series": [{"dataKey": "uv", "name": "Visitors", "color": "#000"}],
            "data": [{"date": "2024-01-01", "uv": 3}]
        });
        let config = normalize_value(&raw).expect("chart should normalize");
        let x = config.x_axis.expect("x axis");
        assert_eq!(x.field, "date");
        assert_eq!(x.label.as_deref(), Some("Date"));
        assert_eq!(config.series.len(), 1);
        assert_eq!(config.series[0].field, "uv");
        assert_eq!(config.series[0].label.as_deref(), Some("Visitors"));
        assert_eq!(config.series[0].color.as_deref(), Some("#000"));
    }

    #[test]
    fn test_later_keys_win_within_a_rule() {
        let raw = json!({
            "type": "bar",
            "chartType": "pie",
            "xField": "a",
            "nameField": "b",
            "yFields": ["c", "d"],
            "valueField": "e",
            "data": [{"b": 1}]
        });
        let config = normalize_value(&raw).expect("chart should normalize");
        assert_eq!(config.chart_type, "pie");
        assert_eq!(config.x_axis.clone().map(|a| a.field), Some("b".to_string()));
        assert_eq!(fields(&config), vec!["e"]);
    }

    #[test]
    fn test_explicit_axis_label_only_keeps_shorthand_field() {
        let raw = json!({
            "type": "bar",
            "xField": "region",
            "xAxis": {"label": "Region"},
            "data": [{"region": "north"}]
        });
        let x = normalize_value(&raw).and_then(|c| c.x_axis).expect("x axis");
        assert_eq!(x.field, "region");
        assert_eq!(x.label.as_deref(), Some("Region"));
    }

    #[test]
    fn test_required_fields() {
        let no_type = RawChartPayload::from_value(&json!({"data": [{"a": 1}]}))
            .and_then(|raw| normalize(&raw));
        assert_eq!(no_type, Err(ChartRejection::MissingType));

        let empty_data = RawChartPayload::from_value(&json!({"type": "bar", "data": []}))
            .and_then(|raw| normalize(&raw));
        assert_eq!(empty_data, Err(ChartRejection::MissingData));

        assert_eq!(
            RawChartPayload::from_value(&json!(["bar"])).err(),
            Some(ChartRejection::NotAnObject)
        );
    }

    #[test]
    fn test_envelope_and_image_url() {
        let raw = json!({
            "type": "chart_config",
            "chart_config": {
                "type": "wordcloud",
                "imageUrl": "https://charts.local/1.png",
                "data": [{"word": "sql", "weight": 3}]
            }
        });
        let config = normalize_value(&raw).expect("chart should normalize");
        assert_eq!(config.chart_type, "wordcloud");
        assert_eq!(config.image_url.as_deref(), Some("https://charts.local/1.png"));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let inputs = [
            json!({
                "type": "bar",
                "title": "Revenue",
                "xField": "month",
                "yFields": ["revenue", "cost"],
                "data": [{"month": "1月", "revenue": 42, "cost": 28}]
            }),
            json!({
                "chartType": "scatter",
                "xAxis": {"field": "x", "label": "X"},
                "yAxis": {"dataKey": "y"},
                "series": [{"field": "y", "label": "Y"}],
                "imageUrl": "https://charts.local/2.png",
                "data": [{"x": 1, "y": 2}]
            }),
        ];
        for input in inputs {
            let first = normalize_value(&input).expect("first pass");
            let reencoded = serde_json::to_value(&first).expect("serialize");
            let second = normalize_value(&reencoded).expect("second pass");
            assert_eq!(first, second);
        }
    }
}
