use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::assembler::MessageAssembler;
use crate::cancellation::{CancellationController, SendState};
use crate::constants::{DEFAULT_MODEL, FAILURE_NOTICE_PREFIX, STOP_MARKER};
use crate::streaming::{EventStreamReader, ReadOutcome, StreamCallbacks};
use crate::timeline::ProcessTimeline;
use crate::tool_calls::{DerivedArtifact, ResultDisposition, ToolCallTracker};
use crate::transport::StreamTransport;
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSettings {
    pub model: String,
    pub thinking_enabled: bool,
    pub kb_ids: Vec<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            thinking_enabled: false,
            kb_ids: Vec::new(),
        }
    }
}

/// What the UI renders while a reply is streaming.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamingView {
    pub is_streaming: bool,
    pub streaming_content: String,
    pub streaming_reasoning: String,
    pub process_steps: Vec<ProcessStep>,
    pub tool_calls: Vec<ToolCallRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub state: SendState,
    /// `None` only when a stop arrived before anything was buffered.
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Default)]
struct Session {
    conversation_id: Option<ConversationId>,
    history: Arc<Vec<ChatMessage>>,
}

/// Everything collected for the reply currently being streamed.
#[derive(Default)]
struct TurnState {
    assembler: MessageAssembler,
    tracker: ToolCallTracker,
    timeline: ProcessTimeline,
    rag_sources: Vec<RagSource>,
    memories: Vec<MemoryItem>,
    chart_config: Option<ChartConfig>,
}

/// Routes decoded events into the turn state and mirrors them into the view.
struct TurnSink<'a> {
    turn: TurnState,
    session: &'a RwLock<Session>,
    view: &'a watch::Sender<StreamingView>,
}

impl TurnSink<'_> {
    fn publish_steps(&self) {
        let steps = self.turn.timeline.steps().to_vec();
        self.view.send_modify(|v| v.process_steps = steps);
    }

    fn publish_tools(&self) {
        let records = self.turn.tracker.records().to_vec();
        self.view.send_modify(|v| v.tool_calls = records);
    }
}

impl StreamCallbacks for TurnSink<'_> {
    fn on_meta(&mut self, meta: MetaPayload) {
        tracing::debug!("[SESSION] Conversation id {}", meta.conversation_id);
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        session.conversation_id = Some(meta.conversation_id);
    }

    fn on_memory_recall(&mut self, memories: Vec<MemoryItem>) {
        self.turn.memories.extend(memories);
    }

    fn on_rag_source(&mut self, sources: Vec<RagSource>) {
        self.turn.timeline.record_rag_sources(&sources);
        self.turn.rag_sources.extend(sources);
        self.publish_steps();
    }

    fn on_tool_call(&mut self, call: ToolCallPayload) {
        self.turn.timeline.end_reasoning();
        if let Some(record) = self.turn.tracker.on_call(call) {
            self.turn.timeline.begin_tool_call(record);
        }
        self.publish_steps();
        self.publish_tools();
    }

    fn on_tool_result(&mut self, result: ToolResultPayload) {
        let ResultDisposition::Settled { record, derived } = self.turn.tracker.on_result(result)
        else {
            return;
        };

        self.turn.timeline.settle_tool_call(&record);
        match derived {
            Some(DerivedArtifact::SqlResult(summary)) => {
                self.turn.timeline.record_sql_result(&summary);
            }
            Some(DerivedArtifact::Chart(chart)) => {
                self.turn.timeline.record_chart(&chart);
                self.turn.chart_config = Some(chart);
            }
            None => {}
        }
        self.publish_steps();
        self.publish_tools();
    }

    fn on_reasoning(&mut self, delta: String) {
        if !self.turn.assembler.push_reasoning(&delta) {
            return;
        }
        let opened = self.turn.timeline.begin_reasoning();
        self.view.send_modify(|v| v.streaming_reasoning.push_str(&delta));
        if opened {
            self.publish_steps();
        }
    }

    fn on_content(&mut self, delta: String) {
        if !self.turn.assembler.push_content(&delta) {
            return;
        }
        let closed = self.turn.timeline.end_reasoning();
        self.view.send_modify(|v| v.streaming_content.push_str(&delta));
        if closed {
            self.publish_steps();
        }
    }

    fn on_error(&mut self, message: String) {
        tracing::warn!("[SESSION] Server error frame: {}", message);
    }
}

/// One chat session: history, observable streaming state and the
/// send → stream → finalize lifecycle.
pub struct StreamOrchestrator<T> {
    reader: EventStreamReader<T>,
    settings: RwLock<ChatSettings>,
    session: RwLock<Session>,
    view: watch::Sender<StreamingView>,
    cancel: CancellationController,
}

impl<T: StreamTransport> StreamOrchestrator<T> {
    pub fn new(transport: T, settings: ChatSettings) -> Self {
        let (view, _) = watch::channel(StreamingView::default());
        Self {
            reader: EventStreamReader::new(transport),
            settings: RwLock::new(settings),
            session: RwLock::new(Session::default()),
            view,
            cancel: CancellationController::new(),
        }
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamingView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> StreamingView {
        self.view.borrow().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.cancel.is_streaming()
    }

    /// The session-owned stop handle, for callers that cannot reach the orchestrator.
    pub fn cancellation(&self) -> CancellationController {
        self.cancel.clone()
    }

    pub fn transport(&self) -> &T {
        self.reader.transport()
    }

    pub fn history(&self) -> Arc<Vec<ChatMessage>> {
        Arc::clone(&self.read_session().history)
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.read_session().conversation_id.clone()
    }

    pub fn settings(&self) -> ChatSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Settings changes apply to the next request; a stream in flight keeps its own copy.
    pub fn update_settings(&self, apply: impl FnOnce(&mut ChatSettings)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut settings);
    }

    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        self.update_settings(|s| s.model = model);
    }

    pub fn set_thinking(&self, enabled: bool) {
        self.update_settings(|s| s.thinking_enabled = enabled);
    }

    pub fn set_kb_ids(&self, kb_ids: Vec<String>) {
        self.update_settings(|s| s.kb_ids = kb_ids);
    }

    /// Replaces the session with a conversation fetched from the backend.
    pub fn load_conversation(&self, id: ConversationId, messages: Vec<ChatMessage>) -> Result<()> {
        if self.is_streaming() {
            return Err(ChatflowError::Busy.into());
        }
        let mut session = self.write_session();
        session.conversation_id = Some(id);
        session.history = Arc::new(messages);
        Ok(())
    }

    pub fn start_new_conversation(&self) -> Result<()> {
        if self.is_streaming() {
            return Err(ChatflowError::Busy.into());
        }
        *self.write_session() = Session::default();
        Ok(())
    }

    /// History is swapped as a whole so readers never see a partial update.
    fn replace_history(&self, edit: impl FnOnce(&mut Vec<ChatMessage>)) {
        let mut session = self.write_session();
        let mut next = (*session.history).clone();
        edit(&mut next);
        session.history = Arc::new(next);
    }

    pub fn stop_streaming(&self) -> bool {
        self.cancel.stop()
    }

    pub async fn send_message(&self, text: &str) -> Result<SendOutcome> {
        let token = self.cancel.begin()?;
        let user = UserMessage::new(text);
        tracing::info!("[SESSION] Sending message {} ({} chars)", user.id, text.chars().count());
        self.replace_history(|h| h.push(ChatMessage::User(user)));
        self.stream_reply(text.to_string(), token).await
    }

    /// Streams a fresh reply to the user message at or before `message_id`,
    /// dropping everything after that user message.
    pub async fn regenerate(&self, message_id: &MessageId) -> Result<SendOutcome> {
        if self.is_streaming() {
            return Err(ChatflowError::Busy.into());
        }
        if self.replay_point(message_id).is_none() {
            return Err(ChatflowError::NotFound(message_id.to_string()).into());
        }

        let token = self.cancel.begin()?;
        let prompt = {
            let mut session = self.write_session();
            match Self::find_replay_point(&session.history, message_id) {
                Some((index, prompt)) => {
                    let mut next = (*session.history).clone();
                    next.truncate(index + 1);
                    session.history = Arc::new(next);
                    prompt
                }
                None => {
                    drop(session);
                    self.cancel.abandon();
                    return Err(ChatflowError::NotFound(message_id.to_string()).into());
                }
            }
        };

        tracing::info!("[SESSION] Regenerating reply for {}", message_id);
        self.stream_reply(prompt, token).await
    }

    fn replay_point(&self, message_id: &MessageId) -> Option<(usize, String)> {
        Self::find_replay_point(&self.read_session().history, message_id)
    }

    /// Index and text of the user message to replay.
    fn find_replay_point(history: &[ChatMessage], message_id: &MessageId) -> Option<(usize, String)> {
        let position = history.iter().position(|m| m.id() == message_id)?;
        history[..=position]
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, m)| match m {
                ChatMessage::User(u) => Some((i, u.content.clone())),
                ChatMessage::Assistant(_) => None,
            })
    }

    async fn stream_reply(&self, prompt: String, token: CancellationToken) -> Result<SendOutcome> {
        let settings = self.settings();
        let request = ChatRequest {
            conversation_id: self.conversation_id(),
            model: settings.model.clone(),
            content: prompt,
            thinking_enabled: settings.thinking_enabled,
            kb_ids: if settings.kb_ids.is_empty() {
                None
            } else {
                Some(settings.kb_ids.clone())
            },
        };

        self.view.send_replace(StreamingView {
            is_streaming: true,
            ..StreamingView::default()
        });

        let mut sink = TurnSink {
            turn: TurnState::default(),
            session: &self.session,
            view: &self.view,
        };
        let span = tracing::info_span!(
            "stream",
            conversation = ?request.conversation_id.as_ref().map(|c| c.short().to_string()),
            model = %request.model
        );
        let read = self
            .reader
            .run(&request, &token, &mut sink)
            .instrument(span)
            .await;

        let (state, error) = match read {
            Ok(ReadOutcome::Done) | Ok(ReadOutcome::Eof) => (SendState::Completed, None),
            Ok(ReadOutcome::Aborted) => (SendState::Aborted, None),
            Ok(ReadOutcome::ServerError(message)) => {
                (SendState::Failed, Some(ObservedError::from(ChatflowError::Remote(message))))
            }
            Err(e) => (SendState::Failed, Some(e)),
        };

        let message = if self.cancel.finish(state) {
            self.finalize(sink.turn, state, error.as_ref(), &settings.model)
        } else {
            None
        };
        self.view.send_replace(StreamingView::default());

        match error {
            Some(e) => Err(e),
            None => Ok(SendOutcome { state, message }),
        }
    }

    fn finalize(
        &self,
        mut turn: TurnState,
        state: SendState,
        error: Option<&ObservedError>,
        model: &str,
    ) -> Option<AssistantMessage> {
        turn.timeline.end_reasoning();
        let nothing_buffered = turn.assembler.is_empty();
        let (mut content, reasoning) = turn.assembler.into_parts();

        let status = match state {
            SendState::Aborted => {
                if nothing_buffered {
                    tracing::info!("[SESSION] Stopped before any output; no reply recorded");
                    return None;
                }
                content.push_str(STOP_MARKER);
                MessageStatus::Stopped
            }
            SendState::Failed => {
                if content.is_empty() {
                    let reason = match error {
                        Some(e) => e.inner.to_string(),
                        None => "unknown error".to_string(),
                    };
                    content = format!("{}{}", FAILURE_NOTICE_PREFIX, reason);
                }
                MessageStatus::Failed
            }
            _ => MessageStatus::Complete,
        };

        let message = AssistantMessage {
            id: MessageId::new(),
            content,
            reasoning: if reasoning.is_empty() {
                None
            } else {
                Some(reasoning)
            },
            tool_calls: turn.tracker.into_records(),
            rag_sources: turn.rag_sources,
            memories: turn.memories,
            chart_config: turn.chart_config,
            process_steps: turn.timeline.into_steps(),
            status,
            model: model.to_string(),
            created_at: Utc::now(),
        };

        tracing::info!(
            "[SESSION] Reply {} finalized as {:?}: {} chars, {} tool calls, chart: {}",
            message.id,
            message.status,
            message.content.chars().count(),
            message.tool_calls.len(),
            message.chart_config.is_some()
        );
        self.replace_history(|h| h.push(ChatMessage::Assistant(message.clone())));
        Some(message)
    }
}
