use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{InboundFrame, OutboundFrame, TranscriptEntry, TurnQueue, USER_TURN};
use crate::llm::{
    ChatTurn, LlmClient, StreamError, TerminalResponse, guarded::open_stream,
};
use crate::store::StoreProfile;
use crate::tools::ToolDispatcher;

/// Spoken when a response is requested on an empty transcript.
const NUDGE_MESSAGE: &str = "I'm listening. How can I help?";
/// Spoken when the model fails outright mid-turn.
const APOLOGY_MESSAGE: &str = "I'm sorry, could you please say that again?";

/// Reserved response id for the unsolicited greeting.
pub const GREETING_RESPONSE_ID: u64 = 0;

pub type ActiveSessionRef = Arc<ActiveSession>;
pub type FrameSender = mpsc::UnboundedSender<OutboundFrame>;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Wall-clock bound on the model's first streaming response.
    pub stream_timeout: Duration,
    /// Hidden single-turn prompt that produces the opening utterance.
    pub greeting_prompt: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stream_timeout: crate::llm::guarded::DEFAULT_STREAM_TIMEOUT,
            greeting_prompt: crate::config::default_greeting_prompt(),
        }
    }
}

/// Per-connection voice session.
///
/// Owns the conversation history, the live turn token and the turn queue.
/// History is mutated only from inside queued turn tasks, so mutations never
/// overlap; the inbound classifier only touches the token slots.
pub struct ActiveSession {
    pub tenant_id: String,
    pub call_id: String,
    pub profile: Arc<StoreProfile>,
    pub cancel_token: CancellationToken,
    llm: Arc<dyn LlmClient>,
    dispatcher: ToolDispatcher,
    options: SessionOptions,
    history: Mutex<Vec<ChatTurn>>,
    current_token: Mutex<Option<Arc<CancellationToken>>>,
    /// The greeting's token. Taken and cancelled by the first
    /// `response_required`; ordinary turns are only cancelled by barge-in.
    greeting_token: Mutex<Option<Arc<CancellationToken>>>,
    is_generating: AtomicBool,
    turn_queue: TurnQueue,
    frame_sender: FrameSender,
}

/// Scope guard for the generation lock. Armed as the first statement of a
/// turn task; dropping it on any exit path, including the task future being
/// dropped, releases the lock so the serializer can always advance.
struct GeneratingGuard<'a>(&'a AtomicBool);

impl<'a> GeneratingGuard<'a> {
    fn arm(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ActiveSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        call_id: impl Into<String>,
        profile: Arc<StoreProfile>,
        llm: Arc<dyn LlmClient>,
        dispatcher: ToolDispatcher,
        options: SessionOptions,
        frame_sender: FrameSender,
        cancel_token: CancellationToken,
    ) -> ActiveSessionRef {
        let call_id = call_id.into();
        let turn_queue = TurnQueue::new(call_id.clone(), cancel_token.child_token());
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            call_id,
            profile,
            cancel_token,
            llm,
            dispatcher,
            options,
            history: Mutex::new(Vec::new()),
            current_token: Mutex::new(None),
            greeting_token: Mutex::new(None),
            is_generating: AtomicBool::new(false),
            turn_queue,
            frame_sender,
        })
    }

    /// Enqueue the unsolicited greeting. Called once right after the
    /// transport is accepted.
    pub fn start_greeting(self: &Arc<Self>) {
        let token = Arc::new(CancellationToken::new());
        *self.current_token.lock().unwrap() = Some(token.clone());
        *self.greeting_token.lock().unwrap() = Some(token.clone());
        let session = self.clone();
        self.turn_queue
            .enqueue(async move { session.run_greeting(token).await });
    }

    /// Classify one inbound frame. Runs on the transport receive loop,
    /// concurrently with whatever turn task is executing.
    pub fn handle_frame(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            InboundFrame::UpdateOnly { turntaking } => {
                // update_only arrives continuously during normal user speech;
                // only the explicit turn-taking marker while a generation is
                // live is a barge-in.
                if turntaking.as_deref() == Some(USER_TURN)
                    && self.is_generating.load(Ordering::SeqCst)
                {
                    if let Some(token) = self.current_token.lock().unwrap().as_ref() {
                        info!(call_id = self.call_id, "barge-in, cancelling current turn");
                        token.cancel();
                    }
                }
            }
            InboundFrame::ResponseRequired {
                response_id,
                transcript,
            } => {
                // A new request supersedes anything still queued but does not
                // cancel an in-flight turn; only barge-in does. The greeting
                // is the exception: any real request obsoletes it.
                if let Some(greeting) = self.greeting_token.lock().unwrap().take() {
                    greeting.cancel();
                }
                let token = Arc::new(CancellationToken::new());
                *self.current_token.lock().unwrap() = Some(token.clone());
                let session = self.clone();
                self.turn_queue.enqueue(async move {
                    session.run_turn(response_id, transcript, token).await
                });
            }
            InboundFrame::Other => {}
        }
    }

    /// Transport closed: trip the in-flight turn and stop the queue worker.
    pub fn close(&self) {
        if let Some(token) = self.current_token.lock().unwrap().as_ref() {
            token.cancel();
        }
        self.cancel_token.cancel();
    }

    pub fn is_generating(&self) -> bool {
        self.is_generating.load(Ordering::SeqCst)
    }

    pub fn history_snapshot(&self) -> Vec<ChatTurn> {
        self.history.lock().unwrap().clone()
    }

    async fn run_turn(
        self: Arc<Self>,
        response_id: u64,
        transcript: Vec<TranscriptEntry>,
        token: Arc<CancellationToken>,
    ) -> Result<()> {
        if !self.token_is_current(&token) {
            debug!(
                call_id = self.call_id,
                response_id, "turn superseded before start"
            );
            return Ok(());
        }
        // The lock must be visible before the first suspension point so a
        // barge-in arriving mid-stream sees a generation to cancel.
        let _generating = GeneratingGuard::arm(&self.is_generating);

        let utterance = last_user_utterance(&transcript);
        if utterance.is_empty() {
            self.send_frame(OutboundFrame::complete(response_id, NUDGE_MESSAGE));
            return Ok(());
        }

        let checkpoint = {
            let mut history = self.history.lock().unwrap();
            let checkpoint = history.len();
            history.push(ChatTurn::user_text(utterance));
            checkpoint
        };

        let phase1 = match self.stream_phase(response_id, &token).await {
            Ok(terminal) => terminal,
            Err(e) => {
                self.abort_turn(e, checkpoint, response_id, &token);
                return Ok(());
            }
        };

        let Some(call) = phase1.tool_call else {
            self.history
                .lock()
                .unwrap()
                .push(ChatTurn::model_text(phase1.text));
            self.send_frame(OutboundFrame::complete(response_id, ""));
            return Ok(());
        };

        self.history
            .lock()
            .unwrap()
            .push(ChatTurn::tool_call(call.name.clone(), call.arguments.clone()));

        // Guaranteed not to fail; failures come back as voiceable payloads.
        let payload = self.dispatcher.dispatch(&call.name, &call.arguments).await;
        if token.is_cancelled() {
            self.abort_turn(StreamError::Cancelled, checkpoint, response_id, &token);
            return Ok(());
        }
        self.history
            .lock()
            .unwrap()
            .push(ChatTurn::tool_result(call.name.clone(), payload));

        let phase2 = match self.stream_phase(response_id, &token).await {
            Ok(terminal) => terminal,
            Err(e) => {
                self.abort_turn(e, checkpoint, response_id, &token);
                return Ok(());
            }
        };
        if let Some(chained) = &phase2.tool_call {
            // One tool call per turn; a second one cannot be voiced.
            warn!(
                call_id = self.call_id,
                tool = chained.name,
                "ignoring chained tool call"
            );
        }
        self.history
            .lock()
            .unwrap()
            .push(ChatTurn::model_text(phase2.text));
        self.send_frame(OutboundFrame::complete(response_id, ""));
        Ok(())
    }

    /// Opening utterance from a hidden single-turn prompt. The prompt is
    /// ephemeral persona seeding and is never committed to history.
    async fn run_greeting(self: Arc<Self>, token: Arc<CancellationToken>) -> Result<()> {
        if !self.token_is_current(&token) {
            return Ok(());
        }
        let _generating = GeneratingGuard::arm(&self.is_generating);

        let prompt = vec![ChatTurn::user_text(self.options.greeting_prompt.clone())];
        let result = self
            .stream_over(&prompt, GREETING_RESPONSE_ID, &token)
            .await;
        self.greeting_token.lock().unwrap().take();
        match result {
            Ok(_) => {
                self.send_frame(OutboundFrame::complete(GREETING_RESPONSE_ID, ""));
            }
            Err(e) if e.is_cancellation() => {
                debug!(call_id = self.call_id, "greeting cancelled");
            }
            Err(e) => {
                warn!(call_id = self.call_id, "greeting failed: {}", e);
            }
        }
        Ok(())
    }

    /// One streaming pass over the committed history: guarded open, chunk
    /// loop with cancellation checks and partial-frame emission, drain,
    /// post-drain cancellation re-check.
    async fn stream_phase(
        &self,
        response_id: u64,
        token: &CancellationToken,
    ) -> Result<TerminalResponse, StreamError> {
        let history = self.history.lock().unwrap().clone();
        self.stream_over(&history, response_id, token).await
    }

    async fn stream_over(
        &self,
        history: &[ChatTurn],
        response_id: u64,
        token: &CancellationToken,
    ) -> Result<TerminalResponse, StreamError> {
        let mut handle = open_stream(
            self.llm.as_ref(),
            history,
            token,
            self.options.stream_timeout,
        )
        .await?;

        while let Some(chunk) = handle.next_chunk().await {
            if token.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            let chunk = chunk?;
            let text = chunk.text();
            if !text.is_empty() {
                self.send_frame(OutboundFrame::partial(response_id, text));
            }
        }

        let terminal = handle.drain().await?;
        if token.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        Ok(terminal)
    }

    /// Roll history back to the checkpoint. Cancellations and timeouts stay
    /// silent (the transport will re-request); anything else gets a single
    /// spoken apology while the socket is open and the turn still current.
    fn abort_turn(
        &self,
        error: StreamError,
        checkpoint: usize,
        response_id: u64,
        token: &CancellationToken,
    ) {
        self.history.lock().unwrap().truncate(checkpoint);
        match &error {
            StreamError::Cancelled => {
                info!(call_id = self.call_id, response_id, "turn abandoned");
            }
            StreamError::TimedOut(timeout) => {
                warn!(
                    call_id = self.call_id,
                    response_id,
                    ?timeout,
                    "model stream initiation timed out"
                );
            }
            StreamError::Provider(e) => {
                warn!(call_id = self.call_id, response_id, "model error: {:#}", e);
                if !token.is_cancelled() && !self.frame_sender.is_closed() {
                    self.send_frame(OutboundFrame::complete(response_id, APOLOGY_MESSAGE));
                }
            }
        }
    }

    fn token_is_current(&self, token: &Arc<CancellationToken>) -> bool {
        match self.current_token.lock().unwrap().as_ref() {
            Some(current) => Arc::ptr_eq(current, token),
            None => false,
        }
    }

    fn send_frame(&self, frame: OutboundFrame) {
        // The receiver is gone once the socket closes; frames written after
        // that are dropped on purpose.
        self.frame_sender.send(frame).ok();
    }
}

fn last_user_utterance(transcript: &[TranscriptEntry]) -> String {
    transcript
        .iter()
        .rev()
        .find(|entry| entry.role == "user")
        .map(|entry| entry.content.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(role: &str, content: &str) -> TranscriptEntry {
        TranscriptEntry {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn last_user_utterance_skips_agent_entries() {
        let transcript = vec![
            entry("user", "first"),
            entry("agent", "reply"),
            entry("user", "  second  "),
            entry("agent", "trailing"),
        ];
        assert_eq!(last_user_utterance(&transcript), "second");
    }

    #[test]
    fn last_user_utterance_on_empty_transcript_is_empty() {
        assert_eq!(last_user_utterance(&[]), "");
        assert_eq!(last_user_utterance(&[entry("agent", "hi")]), "");
    }

    #[test]
    fn generating_guard_releases_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = GeneratingGuard::arm(&flag);
            assert!(flag.load(Ordering::SeqCst));
        }
        assert!(!flag.load(Ordering::SeqCst));
    }
}
