use crate::{
    client::{CancelHandle, CancelSignal, OracleClient, cancel_pair},
    error::OracleError,
    model::{InferenceTicket, ModelSelector},
};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};

type EngineReply = Result<HomyEngineResponse, HomyEngineFailure>;

/// Where the request the engine is working on currently stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestPhase {
    /// Nothing in flight.
    Idle,
    /// The transaction is being simulated, broadcast and mined.
    Submitting { id: u64 },
    /// Mined; waiting for the oracle to write its output.
    AwaitingResult { id: u64, ticket: InferenceTicket },
}

impl RequestPhase {
    /// Short label for logs and progress output.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Idle => "idle",
            RequestPhase::Submitting { .. } => "submitting",
            RequestPhase::AwaitingResult { .. } => "awaiting_result",
        }
    }
}

/// A queued prompt.
pub struct HomyEngineRequest {
    /// The id returned by [`HomyEngine::schedule_inference`].
    pub id: u64,
    /// The model pair to submit with.
    pub selector: ModelSelector,
    /// The prompt text sent on chain.
    pub prompt: String,
    /// Fired by [`HomyEngine::cancel`] for this id.
    pub cancel: CancelSignal,
}

/// A request the oracle answered.
pub struct HomyEngineResponse {
    /// The id returned by [`HomyEngine::schedule_inference`].
    pub id: u64,
    /// The prompt text sent on chain.
    pub prompt: String,
    /// The mined transaction and its request id.
    pub ticket: InferenceTicket,
    /// When the worker picked the request up.
    pub start_time: Instant,
    /// Time from pickup to the answer.
    pub duration: Duration,
    /// The decoded answer.
    pub response: String,
}

/// A request that ended without an answer.
#[derive(Debug)]
pub struct HomyEngineFailure {
    /// The id returned by [`HomyEngine::schedule_inference`].
    pub id: u64,
    /// The prompt text.
    pub prompt: String,
    /// Set once the transaction was mined, so the result can still be
    /// recovered later.
    pub ticket: Option<InferenceTicket>,
    /// Why the request ended.
    pub error: OracleError,
}

/// What [`HomyEngine::try_poll_response`] found.
pub enum HomyEngineResult {
    /// The oracle answered.
    Success(HomyEngineResponse),
    /// Nothing finished yet, with the current phase.
    Empty(RequestPhase),
    /// The request ended without an answer.
    Failed(HomyEngineFailure),
    /// The engine itself is gone.
    Error(String),
}

/// Runs inference requests one at a time on a background task.
///
/// Callers schedule prompts and poll for outcomes without blocking, which
/// lets a UI keep "still thinking" apart from failure and success.
pub struct HomyEngine {
    state: Arc<Mutex<RequestPhase>>,
    last_ticket: Arc<Mutex<Option<InferenceTicket>>>,
    // handles of queued and running requests, by id
    cancels: Arc<Mutex<HashMap<u64, CancelHandle>>>,
    req_tx: Option<mpsc::UnboundedSender<HomyEngineRequest>>,
    rep_rx: Mutex<mpsc::UnboundedReceiver<EngineReply>>,
    task: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
    models: ModelSelector,
}

impl HomyEngine {
    /// Spawns the worker task. Must be called from within a tokio runtime.
    pub fn new(client: Arc<OracleClient>) -> Self {
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<HomyEngineRequest>();
        let (rep_tx, rep_rx) = mpsc::unbounded_channel::<EngineReply>();
        let state = Arc::new(Mutex::new(RequestPhase::Idle));
        let last_ticket = Arc::new(Mutex::new(None));
        let cancels = Arc::new(Mutex::new(HashMap::new()));
        let models = client.models();

        let task = tokio::spawn({
            let state = state.clone();
            let last_ticket = last_ticket.clone();
            let cancels = cancels.clone();
            async move {
                while let Some(req) = req_rx.recv().await {
                    if req.cancel.is_cancelled() {
                        log::debug!("inference {} cancelled before submission", req.id);
                        lock(&cancels).remove(&req.id);
                        let _ = rep_tx.send(Err(HomyEngineFailure {
                            id: req.id,
                            prompt: req.prompt,
                            ticket: None,
                            error: OracleError::Submission(
                                "cancelled before submission".to_string(),
                            ),
                        }));
                        continue;
                    }
                    log::debug!("scheduling inference {}", req.id);

                    set(&state, RequestPhase::Submitting { id: req.id });
                    let start_time = Instant::now();

                    let reply = match client.start(req.selector, &req.prompt).await {
                        Ok(ticket) => {
                            set(&last_ticket, Some(ticket));
                            set(
                                &state,
                                RequestPhase::AwaitingResult {
                                    id: req.id,
                                    ticket,
                                },
                            );
                            client
                                .poll_for_result_until(
                                    ticket.request_id,
                                    client.poll_policy(),
                                    req.cancel.clone(),
                                )
                                .await
                                .map(|response| HomyEngineResponse {
                                    id: req.id,
                                    prompt: req.prompt.clone(),
                                    ticket,
                                    start_time,
                                    duration: start_time.elapsed(),
                                    response,
                                })
                                .map_err(|error| HomyEngineFailure {
                                    id: req.id,
                                    prompt: req.prompt.clone(),
                                    ticket: Some(ticket),
                                    error,
                                })
                        }
                        Err(error) => Err(HomyEngineFailure {
                            id: req.id,
                            prompt: req.prompt.clone(),
                            ticket: None,
                            error,
                        }),
                    };

                    match &reply {
                        Ok(_) => log::debug!("inference {} completed", req.id),
                        Err(failure) => {
                            log::warn!("inference {} failed: {}", req.id, failure.error)
                        }
                    }

                    lock(&cancels).remove(&req.id);
                    let _ = rep_tx.send(reply);
                    set(&state, RequestPhase::Idle);
                }
            }
        });

        Self {
            state,
            last_ticket,
            cancels,
            req_tx: Some(req_tx),
            rep_rx: Mutex::new(rep_rx),
            task: Some(task),
            id_counter: AtomicU64::new(0),
            models,
        }
    }

    /// The phase of the request being worked on.
    pub fn state(&self) -> RequestPhase {
        lock(&self.state).clone()
    }

    /// The ticket of the most recently mined request.
    pub fn last_ticket(&self) -> Option<InferenceTicket> {
        *lock(&self.last_ticket)
    }

    /// Queues `prompt` with the client's default models and returns its id.
    pub fn schedule_inference(&self, prompt: impl Into<String>) -> u64 {
        self.schedule_inference_with(self.models, prompt)
    }

    /// Queues `prompt` with an explicit model pair and returns its id.
    pub fn schedule_inference_with(&self, selector: ModelSelector, prompt: impl Into<String>) -> u64 {
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = &self.req_tx {
            let (handle, signal) = cancel_pair();
            lock(&self.cancels).insert(id, handle);
            let request = HomyEngineRequest {
                id,
                selector,
                prompt: prompt.into(),
                cancel: signal,
            };
            if tx.send(request).is_err() {
                lock(&self.cancels).remove(&id);
            }
        }
        id
    }

    /// Returns a finished outcome if one is available, without waiting.
    pub fn try_poll_response(&self) -> HomyEngineResult {
        match lock(&self.rep_rx).try_recv() {
            Ok(Ok(response)) => HomyEngineResult::Success(response),
            Ok(Err(failure)) => HomyEngineResult::Failed(failure),
            Err(TryRecvError::Empty) => HomyEngineResult::Empty(self.state()),
            Err(TryRecvError::Disconnected) => {
                log::error!("Response channel disconnected");
                HomyEngineResult::Error("Response channel disconnected".to_string())
            }
        }
    }

    /// Cancels the request `id`. Returns `false` if it already finished.
    ///
    /// A queued request is dropped without being submitted. A request being
    /// submitted stops once it is mined, and one awaiting its result stops
    /// polling. A broadcast transaction cannot be withdrawn; its ticket
    /// stays available through [`last_ticket`](Self::last_ticket).
    pub fn cancel(&self, id: u64) -> bool {
        match lock(&self.cancels).get(&id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Closes the queue and waits for queued requests to finish.
    pub async fn shutdown(mut self) {
        self.req_tx.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Closes the queue and aborts the worker.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HomyEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set<T>(mutex: &Mutex<T>, value: T) {
    *lock(mutex) = value;
}
