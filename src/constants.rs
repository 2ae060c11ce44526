/// Backend endpoints, relative to the configured base URL
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api/v1";
pub const CHAT_STREAM_PATH: &str = "/chat/stream";
pub const CONVERSATIONS_PATH: &str = "/conversations";

pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Stream framing limits
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Appended to the content of a reply the user stopped mid-stream.
pub const STOP_MARKER: &str = "\n\n[generation stopped]";

/// Content of a failed reply that produced no text before the failure.
pub const FAILURE_NOTICE_PREFIX: &str = "[request failed] ";

/// Tools with derived behavior
pub const TOOL_EXECUTE_SQL: &str = "execute_sql";
pub const TOOL_RECOMMEND_CHART: &str = "recommend_chart";

pub const SQL_PREVIEW_ROWS: usize = 5;

/// Default series colors, cycled by series index.
pub const CHART_PALETTE: &[&str] = &[
    "#5470c6", "#91cc75", "#fac858", "#ee6666", "#73c0de", "#3ba272", "#fc8452", "#9a60b4",
    "#ea7ccc",
];
