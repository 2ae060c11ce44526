use std::panic;
use std::path::Path;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;

use crate::redaction::RedactingWriter;
use crate::types::StreamEvent;

/// Installs the global subscriber: env filter, redacted daily log file, span traces.
/// Keep the returned guard alive for the lifetime of the process.
pub fn init_tracing(log_dir: &Path, json: bool) -> WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "chatflow=info".into(),
    };

    ensure_log_dir(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "chatflow.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(RedactingWriter::new(file_appender));

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking.clone())
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
    {
        eprintln!("Tracing already initialized: {}", e);
    }

    guard
}

/// The subscriber is not installed yet, so failures go to stderr.
fn ensure_log_dir(log_dir: &Path) -> bool {
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
            false
        }
    }
}

/// Sets up a global panic hook that logs panics through tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            "FATAL: chatflow panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-stream counters, summarized in one log line when the stream ends.
#[derive(Debug, Default)]
pub struct StreamMetric {
    pub frames: usize,
    pub dropped_frames: usize,
    pub unknown_kinds: usize,
    pub text_chars: usize,
    pub reasoning_chars: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        self.frames += 1;
        match event {
            StreamEvent::ContentDelta(text) => self.text_chars += text.chars().count(),
            StreamEvent::ReasoningDelta(text) => self.reasoning_chars += text.chars().count(),
            StreamEvent::ToolCall(call) => self.tool_names.push(call.name.clone()),
            _ => {}
        }
    }

    pub fn record_dropped(&mut self) {
        self.frames += 1;
        self.dropped_frames += 1;
    }

    pub fn record_unknown(&mut self) {
        self.frames += 1;
        self.unknown_kinds += 1;
    }

    pub fn log_summary(&self, outcome: &str) {
        let tools_str = if self.tool_names.is_empty() {
            "0".to_string()
        } else {
            format!("{} ({})", self.tool_names.len(), self.tool_names.join(", "))
        };

        tracing::info!(
            "[STREAM END] Outcome: {} | Frames: {} (dropped {}, unknown {}) | Tools: {} | Text: {} chars | Reasoning: {} chars",
            outcome,
            self.frames,
            self.dropped_frames,
            self.unknown_kinds,
            tools_str,
            self.text_chars,
            self.reasoning_chars
        );
    }
}
