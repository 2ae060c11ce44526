use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_FRAME_BYTES;
use crate::logging::StreamMetric;
use crate::transport::StreamTransport;
use crate::types::*;

/// Receives decoded events in arrival order. Every method defaults to a no-op.
pub trait StreamCallbacks {
    fn on_meta(&mut self, _meta: MetaPayload) {}
    fn on_memory_recall(&mut self, _memories: Vec<MemoryItem>) {}
    fn on_rag_source(&mut self, _sources: Vec<RagSource>) {}
    fn on_tool_call(&mut self, _call: ToolCallPayload) {}
    fn on_tool_result(&mut self, _result: ToolResultPayload) {}
    fn on_reasoning(&mut self, _delta: String) {}
    fn on_content(&mut self, _delta: String) {}
    fn on_done(&mut self) {}
    fn on_error(&mut self, _message: String) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A `done` frame arrived.
    Done,
    /// The body ended without a terminal frame.
    Eof,
    /// The server sent an `error` frame.
    ServerError(String),
    /// The cancellation token fired.
    Aborted,
}

impl ReadOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Eof => "eof",
            Self::ServerError(_) => "server_error",
            Self::Aborted => "aborted",
        }
    }
}

/// One line of the body, split on `\n` before any text decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Text(String),
    /// Not valid UTF-8. Only the frame it belongs to is lost.
    Invalid,
    /// Longer than the limit. Its bytes were skipped up to the next `\n`.
    Oversized,
}

/// Splits the body into lines at the byte level.
///
/// Unlike `LinesCodec`, a bad line is reported as an item instead of an
/// error, so `FramedRead` keeps going and only the damaged frame is dropped.
#[derive(Debug)]
pub struct EventLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl EventLineCodec {
    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for EventLineCodec {
    fn default() -> Self {
        Self::new_with_max_length(MAX_FRAME_BYTES)
    }
}

fn decode_line(mut line: BytesMut) -> RawLine {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    match String::from_utf8(line.to_vec()) {
        Ok(text) => RawLine::Text(text),
        Err(_) => RawLine::Invalid,
    }
}

impl Decoder for EventLineCodec {
    type Item = RawLine;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<RawLine>> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                    return Ok(Some(RawLine::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    return Ok(Some(decode_line(line)));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<RawLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(RawLine::Oversized));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(Some(decode_line(rest)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

#[derive(Debug)]
enum Assembled {
    Frame(SseFrame),
    Damaged {
        event: Option<String>,
        reason: &'static str,
    },
}

/// Accumulates `event:` / `data:` lines until a blank line closes the frame.
#[derive(Debug, Default)]
struct FrameBuilder {
    event: Option<String>,
    data: Vec<String>,
    damage: Option<&'static str>,
}

impl FrameBuilder {
    fn push_line(&mut self, line: RawLine) -> Option<Assembled> {
        match line {
            RawLine::Text(text) => self.push_text(&text),
            RawLine::Invalid => {
                self.damage = Some("line is not valid UTF-8");
                None
            }
            RawLine::Oversized => {
                self.damage = Some("line exceeds the frame size limit");
                None
            }
        }
    }

    fn push_text(&mut self, line: &str) -> Option<Assembled> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.trim().to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<Assembled> {
        if let Some(reason) = self.damage.take() {
            let event = self.event.take();
            self.data.clear();
            return Some(Assembled::Damaged { event, reason });
        }
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let event = match self.event.take() {
            Some(e) => e,
            None => "message".to_string(),
        };
        let data = self.data.join("\n");
        self.data.clear();
        Some(Assembled::Frame(SseFrame { event, data }))
    }
}

fn snippet(data: &str) -> &str {
    match data.char_indices().nth(120) {
        Some((idx, _)) => &data[..idx],
        None => data,
    }
}

fn dispatch<C: StreamCallbacks + ?Sized>(event: StreamEvent, callbacks: &mut C) -> Option<ReadOutcome> {
    match event {
        StreamEvent::Meta(meta) => callbacks.on_meta(meta),
        StreamEvent::MemoryRecall(memories) => callbacks.on_memory_recall(memories),
        StreamEvent::RagSource(sources) => callbacks.on_rag_source(sources),
        StreamEvent::ToolCall(call) => callbacks.on_tool_call(call),
        StreamEvent::ToolResult(result) => callbacks.on_tool_result(result),
        StreamEvent::ReasoningDelta(delta) => callbacks.on_reasoning(delta),
        StreamEvent::ContentDelta(delta) => callbacks.on_content(delta),
        StreamEvent::Done => {
            callbacks.on_done();
            return Some(ReadOutcome::Done);
        }
        StreamEvent::Error(message) => {
            callbacks.on_error(message.clone());
            return Some(ReadOutcome::ServerError(message));
        }
    }
    None
}

fn handle_frame<C: StreamCallbacks + ?Sized>(
    assembled: Assembled,
    callbacks: &mut C,
    metrics: &mut StreamMetric,
) -> Option<ReadOutcome> {
    let frame = match assembled {
        Assembled::Frame(frame) => frame,
        Assembled::Damaged { event, reason } => {
            metrics.record_dropped();
            tracing::warn!(
                "[STREAM] Dropped damaged '{}' frame: {}",
                event.as_deref().unwrap_or("message"),
                reason
            );
            return None;
        }
    };

    match parse_frame(&frame.event, &frame.data) {
        FrameEvent::Event(event) => {
            metrics.record_event(&event);
            tracing::trace!("[STREAM] Event: {}", event.kind());
            dispatch(event, callbacks)
        }
        FrameEvent::Unknown(kind) => {
            metrics.record_unknown();
            tracing::debug!("[STREAM] Ignoring unknown event kind '{}'", kind);
            None
        }
        FrameEvent::Malformed(reason) => {
            metrics.record_dropped();
            tracing::warn!(
                "[STREAM] Dropped malformed '{}' frame: {} (data: {})",
                frame.event,
                reason,
                snippet(&frame.data)
            );
            None
        }
    }
}

/// Decodes a framed event-stream body and dispatches each event.
///
/// The token is checked at every await on the next line; a callback that has
/// started always runs to completion first. Only a failing body is an error:
/// a damaged or oversized frame is dropped and reading continues.
pub async fn pump<S, C>(
    body: S,
    cancel: &CancellationToken,
    callbacks: &mut C,
) -> Result<ReadOutcome>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    C: StreamCallbacks + ?Sized,
{
    let lines = FramedRead::new(StreamReader::new(body), EventLineCodec::default());
    pump_lines(lines, cancel, callbacks).await
}

async fn pump_lines<L, C>(
    mut lines: L,
    cancel: &CancellationToken,
    callbacks: &mut C,
) -> Result<ReadOutcome>
where
    L: Stream<Item = std::io::Result<RawLine>> + Unpin,
    C: StreamCallbacks + ?Sized,
{
    let mut builder = FrameBuilder::default();
    let mut metrics = StreamMetric::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                metrics.log_summary(ReadOutcome::Aborted.label());
                return Ok(ReadOutcome::Aborted);
            }
            line = lines.next() => line,
        };

        match next {
            Some(Ok(line)) => {
                if let Some(assembled) = builder.push_line(line) {
                    if let Some(outcome) = handle_frame(assembled, callbacks, &mut metrics) {
                        metrics.log_summary(outcome.label());
                        return Ok(outcome);
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!("[STREAM] Body read error: {}", e);
                metrics.log_summary("transport_error");
                return Err(ChatflowError::Io(e).into());
            }
            None => break,
        }
    }

    if let Some(assembled) = builder.flush() {
        if let Some(outcome) = handle_frame(assembled, callbacks, &mut metrics) {
            metrics.log_summary(outcome.label());
            return Ok(outcome);
        }
    }

    metrics.log_summary(ReadOutcome::Eof.label());
    Ok(ReadOutcome::Eof)
}

/// Opens one stream per request through the transport and pumps it.
pub struct EventStreamReader<T> {
    transport: T,
}

impl<T: StreamTransport> EventStreamReader<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn run<C: StreamCallbacks + ?Sized>(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        callbacks: &mut C,
    ) -> Result<ReadOutcome> {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ReadOutcome::Aborted),
            opened = self.transport.open(request) => match opened {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("[STREAM] Failed to open stream: {}", e.inner);
                    return Err(e);
                }
            },
        };
        pump(body, cancel, callbacks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl StreamCallbacks for Recorder {
        fn on_meta(&mut self, meta: MetaPayload) {
            self.seen.push(format!("meta:{}", meta.conversation_id));
        }
        fn on_reasoning(&mut self, delta: String) {
            self.seen.push(format!("reasoning:{}", delta));
        }
        fn on_content(&mut self, delta: String) {
            self.seen.push(format!("content:{}", delta));
        }
        fn on_tool_call(&mut self, call: ToolCallPayload) {
            self.seen.push(format!("tool_call:{}", call.id));
        }
        fn on_tool_result(&mut self, result: ToolResultPayload) {
            self.seen.push(format!("tool_result:{}", result.id));
        }
        fn on_done(&mut self) {
            self.seen.push("done".to_string());
        }
        fn on_error(&mut self, message: String) {
            self.seen.push(format!("error:{}", message));
        }
    }

    fn chunked(body: &str, size: usize) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        let chunks: Vec<std::io::Result<Bytes>> = body
            .as_bytes()
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    #[tokio::test]
    async fn test_frames_dispatch_in_arrival_order_across_chunk_boundaries() {
        let body = "event: meta\ndata: {\"conversation_id\":\"c1\"}\n\n\
                    event: reasoning\ndata: {\"text\":\"思考\"}\n\n\
                    : keep-alive\n\n\
                    event: content\r\ndata: {\"text\":\"结果\"}\r\n\r\n\
                    event: done\ndata: {}\n\n\
                    event: content\ndata: {\"text\":\"after done\"}\n\n";
        let mut recorder = Recorder::default();
        let outcome = pump(chunked(body, 5), &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(
            recorder.seen,
            vec!["meta:c1", "reasoning:思考", "content:结果", "done"]
        );
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_do_not_end_stream() {
        let body = "event: tool_call\ndata: {\"id\": \n\n\
                    event: telemetry\ndata: {\"x\":1}\n\n\
                    event: content\ndata: {\"text\":\"still here\"}\n\n";
        let mut recorder = Recorder::default();
        let outcome = pump(chunked(body, 64), &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::Eof);
        assert_eq!(recorder.seen, vec!["content:still here"]);
    }

    #[tokio::test]
    async fn test_multiline_data_and_trailing_frame_without_blank_line() {
        let body = "event: content\ndata: line one\ndata: line two\n\nevent: content\ndata: tail";
        let mut recorder = Recorder::default();
        let outcome = pump(chunked(body, 3), &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::Eof);
        assert_eq!(
            recorder.seen,
            vec!["content:line one\nline two", "content:tail"]
        );
    }

    #[tokio::test]
    async fn test_error_frame_is_terminal() {
        let body = "event: content\ndata: {\"text\":\"a\"}\n\nevent: error\ndata: {\"message\":\"boom\"}\n\n";
        let mut recorder = Recorder::default();
        let outcome = pump(chunked(body, 16), &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::ServerError("boom".to_string()));
        assert_eq!(recorder.seen, vec!["content:a", "error:boom"]);
    }

    #[tokio::test]
    async fn test_io_error_surfaces_as_transport_error() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"event: content\ndata: {\"text\":\"partial\"}\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut recorder = Recorder::default();
        let result = pump(stream::iter(chunks), &CancellationToken::new(), &mut recorder).await;

        match result {
            Err(e) => assert!(e.inner.is_transport()),
            Ok(outcome) => panic!("Expected transport error, got {:?}", outcome),
        }
        assert_eq!(recorder.seen, vec!["content:partial"]);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_pending_read() {
        let first: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(
            b"event: content\ndata: {\"text\":\"x\"}\n\n",
        ))];
        let body = stream::iter(first).chain(stream::pending());
        let cancel = CancellationToken::new();
        let mut recorder = Recorder::default();

        let stopper = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };
        let (outcome, _) = tokio::join!(pump(body, &cancel, &mut recorder), stopper);

        assert_eq!(outcome.expect("pump"), ReadOutcome::Aborted);
        assert_eq!(recorder.seen, vec!["content:x"]);
    }

    #[tokio::test]
    async fn test_tool_result_over_a_megabyte_is_delivered() {
        let rows: Vec<serde_json::Value> = (0..40_000)
            .map(|i| serde_json::json!({ "region": format!("region-{}", i), "revenue": i }))
            .collect();
        let payload = serde_json::json!({
            "id": "t1",
            "name": "execute_sql",
            "status": "success",
            "structured_data": { "type": "sql_result", "rows": rows }
        })
        .to_string();
        assert!(payload.len() > 1024 * 1024);

        let body = format!(
            "event: tool_result\ndata: {}\n\nevent: content\ndata: after\n\nevent: done\ndata: [DONE]\n\n",
            payload
        );
        let mut recorder = Recorder::default();
        let outcome = pump(chunked(&body, 64 * 1024), &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(recorder.seen, vec!["tool_result:t1", "content:after", "done"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_drops_only_its_frame() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"event: content\ndata: a")),
            Ok(Bytes::from_static(b"\xff\n\nevent: content\ndata: b\n\n")),
            Ok(Bytes::from_static(b"event: done\ndata: {}\n\n")),
        ];
        let mut recorder = Recorder::default();
        let outcome = pump(stream::iter(chunks), &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(recorder.seen, vec!["content:b", "done"]);
    }

    #[tokio::test]
    async fn test_line_over_limit_drops_its_frame_and_reading_continues() {
        let body = "event: content\ndata: this line is far too long\ndata: more\n\n\
                    event: content\ndata: ok\n\n\
                    event: content\ndata: also far too long at the end";
        let lines = FramedRead::new(
            StreamReader::new(chunked(body, 7)),
            EventLineCodec::new_with_max_length(16),
        );
        let mut recorder = Recorder::default();
        let outcome = pump_lines(lines, &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::Eof);
        assert_eq!(recorder.seen, vec!["content:ok"]);
    }

    #[test]
    fn test_codec_splits_lines_at_the_byte_level() {
        let mut codec = EventLineCodec::new_with_max_length(8);
        let mut buf = BytesMut::from(&b"short\r\n\xfe\nwaytoolongline\nend"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RawLine::Text("short".to_string())));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RawLine::Invalid));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RawLine::Oversized));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(RawLine::Text("end".to_string())));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_raw_delta_text_is_kept_verbatim() {
        let pieces = ["Use ", "\"quotes\"", "{}", "[DONE]", " tail"];
        let mut body = String::new();
        for piece in pieces {
            body.push_str(&format!("event: content\ndata: {}\n\n", piece));
        }
        body.push_str("event: done\ndata: [DONE]\n\n");

        let mut recorder = Recorder::default();
        let outcome = pump(chunked(&body, 9), &CancellationToken::new(), &mut recorder)
            .await
            .expect("pump");

        assert_eq!(outcome, ReadOutcome::Done);
        let content: String = recorder
            .seen
            .iter()
            .filter_map(|s| s.strip_prefix("content:"))
            .collect();
        assert_eq!(content, "Use \"quotes\"{}[DONE] tail");
        assert_eq!(recorder.seen.last().map(String::as_str), Some("done"));
    }
}
