use crate::{LlmClient, LlmError};
use blocksmith_core::{CancellationToken, ChatRequest, LlmResponse, StreamCallback, StreamChunk};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

const WAIT_POLL_MS: u64 = 50;

#[derive(Default)]
struct GateState {
    partial: String,
    cancelled: bool,
    terminal: Option<Result<LlmResponse, LlmError>>,
}

/// Single-use rendezvous between one streaming call and the session thread.
///
/// The first terminal event (completion, failure or cancellation) wins; every
/// later callback is ignored, so a late token or a completion racing a
/// cancellation can never reach the session.
#[derive(Default)]
pub struct StreamGate {
    state: Mutex<GateState>,
    ready: Condvar,
}

impl StreamGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a token. Returns `false` once the gate has been released.
    pub fn push_token(&self, text: &str) -> bool {
        let mut state = self.lock();
        if state.cancelled || state.terminal.is_some() {
            return false;
        }
        state.partial.push_str(text);
        true
    }

    pub fn complete(&self, response: LlmResponse) {
        self.settle(Ok(response));
    }

    pub fn fail(&self, err: LlmError) {
        self.settle(Err(err));
    }

    pub fn cancel(&self) {
        let mut state = self.lock();
        if state.terminal.is_none() {
            state.cancelled = true;
            state.terminal = Some(Err(LlmError::Cancelled));
            self.ready.notify_all();
        }
    }

    fn settle(&self, outcome: Result<LlmResponse, LlmError>) {
        let mut state = self.lock();
        if state.cancelled || state.terminal.is_some() {
            return;
        }
        state.terminal = Some(outcome);
        self.ready.notify_all();
    }

    pub fn is_released(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Text streamed so far. After cancellation this is what the user saw.
    pub fn partial(&self) -> String {
        self.lock().partial.clone()
    }

    /// Block until the gate is released or `cancel` is set, whichever is first.
    pub fn wait(&self, cancel: &CancellationToken) -> Result<LlmResponse, LlmError> {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.terminal {
                return outcome.clone();
            }
            if cancel.is_cancelled() {
                state.cancelled = true;
                state.terminal = Some(Err(LlmError::Cancelled));
                return Err(LlmError::Cancelled);
            }
            state = match self
                .ready
                .wait_timeout(state, Duration::from_millis(WAIT_POLL_MS))
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Run one streaming request on a worker thread and return its gate.
///
/// Content deltas are forwarded to `on_chunk` only while the gate is open.
/// The worker is detached: after cancellation it may keep reading until the
/// transport notices, but nothing it produces is observed.
pub fn spawn_chat_stream(
    llm: Arc<dyn LlmClient + Send + Sync>,
    req: ChatRequest,
    cancel: CancellationToken,
    on_chunk: StreamCallback,
) -> Arc<StreamGate> {
    let gate = Arc::new(StreamGate::new());
    let worker_gate = Arc::clone(&gate);
    thread::spawn(move || {
        let cb_gate = Arc::clone(&worker_gate);
        let cb: StreamCallback = Arc::new(move |chunk| match chunk {
            StreamChunk::ContentDelta(text) => {
                if cb_gate.push_token(&text) {
                    on_chunk(StreamChunk::ContentDelta(text));
                }
            }
            other => {
                if !cb_gate.is_released() {
                    on_chunk(other);
                }
            }
        });
        match llm.complete_chat_streaming(&req, cb, &cancel) {
            Ok(response) => worker_gate.complete(response),
            Err(err) => match LlmError::from_client_error(&err, &cancel) {
                LlmError::Cancelled => worker_gate.cancel(),
                other => worker_gate.fail(other),
            },
        }
    });
    gate
}
