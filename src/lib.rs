pub mod assembler;
pub mod cancellation;
pub mod chart;
pub mod config;
pub mod constants;
pub mod json_extract;
pub mod logging;
pub mod orchestrator;
pub mod redaction;
pub mod streaming;
pub mod timeline;
pub mod tool_calls;
pub mod transport;
pub mod types;

pub use types::*;

pub use cancellation::{CancellationController, SendState};
pub use config::Args;
pub use orchestrator::{ChatSettings, SendOutcome, StreamOrchestrator, StreamingView};
pub use streaming::{EventStreamReader, ReadOutcome, StreamCallbacks};
pub use transport::{ConversationApi, HttpClient, StreamTransport};
