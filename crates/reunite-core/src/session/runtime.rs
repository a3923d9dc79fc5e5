//! Per-session event loop.
//!
//! One task owns the `ConversationController` and is the only place state is
//! mutated. Commands arrive from any number of `SessionHandle`s, gateway calls run
//! on spawned tasks and report back on a completion channel, and live inserts are
//! merged as they arrive. The loop never awaits a gateway call itself, so the view
//! stays responsive while sends and read writes are in flight.
//!
//! A live feed that ends or reports `SubscriptionClosed` is re-opened in the
//! background, followed by a catch-up query; until that succeeds it is retried on
//! every retry tick and the snapshot shows `live_connected: false`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::MessagingConfig;
use crate::error::{GatewayError, GatewayResult, MessagingError};
use crate::gateway::{Directory, MessageFilter, MessageGateway};
use crate::models::{ConversationFilter, Message, MessageDraft, NewMessage};
use crate::session::controller::{ConversationController, SendTarget};
use crate::session::live_feed::LiveFeed;
use crate::session::snapshot::SessionSnapshot;
use crate::store::{EnrichmentRequest, MergeOutcome, ReadBatch};

type SendReply = oneshot::Sender<Result<Message, MessagingError>>;
type UnitReply = oneshot::Sender<Result<(), MessagingError>>;

pub enum SessionCommand {
    Select {
        thread_id: String,
        counterpart_id: Option<String>,
        response_tx: UnitReply,
    },
    ClearSelection {
        response_tx: UnitReply,
    },
    Send {
        draft: MessageDraft,
        response_tx: SendReply,
    },
    MarkRead {
        ids: Vec<String>,
        response_tx: UnitReply,
    },
    RetrySend {
        correlation_id: String,
        response_tx: SendReply,
    },
    DiscardFailedSend {
        correlation_id: String,
        response_tx: UnitReply,
    },
    SetFilter {
        filter: ConversationFilter,
        response_tx: UnitReply,
    },
    Shutdown,
}

/// Results of spawned gateway calls, fed back into the loop.
enum Completion {
    Contact {
        thread_id: String,
        draft: MessageDraft,
        result: GatewayResult<String>,
        response_tx: SendReply,
    },
    Inserted {
        correlation_id: String,
        result: GatewayResult<Message>,
    },
    ReadFlag {
        batch: ReadBatch,
        result: GatewayResult<Vec<String>>,
        response_tx: Option<UnitReply>,
    },
    Enriched {
        request: EnrichmentRequest,
        result: GatewayResult<String>,
    },
    /// New live feed plus everything stored for the viewer, queried after it opened
    Resubscribed {
        result: GatewayResult<(LiveFeed, Vec<Message>)>,
    },
}

#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<Arc<SessionSnapshot>>,
}

impl SessionHandle {
    async fn command(&self, command: SessionCommand) -> Result<(), MessagingError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| MessagingError::SessionClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, MessagingError>>) -> SessionCommand,
    ) -> Result<T, MessagingError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(build(response_tx)).await?;
        response_rx.await.map_err(|_| MessagingError::SessionClosed)?
    }

    /// Open a conversation. Without a counterpart, the latest conversation on the
    /// listing is used (or none yet, for a first message). Returns once the
    /// conversation has been rendered; read marking continues in the background.
    pub async fn select(
        &self,
        thread_id: impl Into<String>,
        counterpart_id: Option<String>,
    ) -> Result<(), MessagingError> {
        let thread_id = thread_id.into();
        self.request(|response_tx| SessionCommand::Select {
            thread_id,
            counterpart_id,
            response_tx,
        })
        .await
    }

    pub async fn clear_selection(&self) -> Result<(), MessagingError> {
        self.request(|response_tx| SessionCommand::ClearSelection { response_tx })
            .await
    }

    /// Send to the active conversation and wait for the store's copy.
    /// Empty drafts fail here, before anything reaches the session.
    pub async fn send(&self, draft: MessageDraft) -> Result<Message, MessagingError> {
        draft.validate()?;
        self.request(|response_tx| SessionCommand::Send { draft, response_tx })
            .await
    }

    pub async fn mark_read(&self, ids: Vec<String>) -> Result<(), MessagingError> {
        self.request(|response_tx| SessionCommand::MarkRead { ids, response_tx })
            .await
    }

    pub async fn retry_send(
        &self,
        correlation_id: impl Into<String>,
    ) -> Result<Message, MessagingError> {
        let correlation_id = correlation_id.into();
        self.request(|response_tx| SessionCommand::RetrySend {
            correlation_id,
            response_tx,
        })
        .await
    }

    pub async fn discard_failed_send(
        &self,
        correlation_id: impl Into<String>,
    ) -> Result<(), MessagingError> {
        let correlation_id = correlation_id.into();
        self.request(|response_tx| SessionCommand::DiscardFailedSend {
            correlation_id,
            response_tx,
        })
        .await
    }

    pub async fn set_filter(&self, filter: ConversationFilter) -> Result<(), MessagingError> {
        self.request(|response_tx| SessionCommand::SetFilter {
            filter,
            response_tx,
        })
        .await
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshots.clone()
    }

    /// Wait for the first snapshot satisfying `predicate`, the current one included.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<Arc<SessionSnapshot>, MessagingError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| MessagingError::SessionClosed)?;
        Ok(snapshot.clone())
    }

    pub async fn shutdown(&self) -> Result<(), MessagingError> {
        self.command(SessionCommand::Shutdown).await
    }
}

pub struct SessionRuntime {
    handle: SessionHandle,
    worker_handle: Option<JoinHandle<()>>,
}

impl SessionRuntime {
    /// Start a session for `viewer`.
    ///
    /// Both live subscriptions are opened before the initial query so no insert
    /// can fall between them; the overlap is removed by dedup.
    pub async fn start(
        config: MessagingConfig,
        viewer: impl Into<String>,
        gateway: Arc<dyn MessageGateway>,
        directory: Arc<dyn Directory>,
    ) -> Result<Self> {
        let viewer = viewer.into();
        let feed = LiveFeed::open(gateway.as_ref(), &viewer)
            .await
            .context("Failed to open live message feed")?;
        let initial = gateway
            .query_messages(MessageFilter::participant(viewer.clone()))
            .await
            .context("Initial message query failed")?;

        let mut controller = ConversationController::new(viewer.clone(), &config);
        controller.set_live_connected(true);
        let fetched = initial.len();
        let inserted = controller.load_initial(initial);
        tracing::info!(
            %viewer,
            fetched,
            inserted,
            conversations = controller.current_snapshot().conversations.len(),
            "session started"
        );

        let channel_size = config.completion_channel_size.max(1);
        let (command_tx, command_rx) = mpsc::channel(channel_size);
        let (completion_tx, completion_rx) = mpsc::channel(channel_size);

        let handle = SessionHandle {
            command_tx,
            snapshots: controller.subscribe(),
        };
        let worker = SessionWorker {
            config,
            controller,
            gateway,
            directory,
            feed: Some(feed),
            resubscribing: false,
            command_rx,
            completion_tx,
            completion_rx,
            send_waiters: HashMap::new(),
        };
        let worker_handle = tokio::spawn(worker.run());

        Ok(Self {
            handle,
            worker_handle: Some(worker_handle),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for it. In-flight gateway calls are not cancelled;
    /// their results are dropped.
    pub async fn shutdown(&mut self) {
        let _ = self.handle.shutdown().await;
        if let Some(worker_handle) = self.worker_handle.take() {
            if let Err(e) = worker_handle.await {
                tracing::error!("session worker panicked: {}", e);
            }
        }
    }
}

struct SessionWorker {
    config: MessagingConfig,
    controller: ConversationController,
    gateway: Arc<dyn MessageGateway>,
    directory: Arc<dyn Directory>,
    feed: Option<LiveFeed>,
    /// A re-open of the live feed is in flight
    resubscribing: bool,
    command_rx: mpsc::Receiver<SessionCommand>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    /// Callers waiting on a send, by correlation reference
    send_waiters: HashMap<String, SendReply>,
}

impl SessionWorker {
    async fn run(mut self) {
        let mut retry_tick = tokio::time::interval(self.config.enrichment_retry_interval());
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.dispatch_enrichment();
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                }
                item = next_live(&mut self.feed) => match item {
                    Some(Ok(message)) => self.handle_live(message),
                    Some(Err(e)) => self.feed_lost(&e.to_string()),
                    None => self.feed_lost("stream ended"),
                },
                _ = retry_tick.tick() => {
                    for request in self.controller.due_enrichment_retries() {
                        self.spawn_lookup(request);
                    }
                    if self.feed.is_none() {
                        self.spawn_resubscribe();
                    }
                }
            }
            self.dispatch_enrichment();
        }

        tracing::info!(viewer = self.controller.viewer(), "session stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Select {
                thread_id,
                counterpart_id,
                response_tx,
            } => {
                tracing::debug!(%thread_id, ?counterpart_id, "select conversation");
                // publishes the rendered view first, then marks
                self.controller.select_conversation(thread_id, counterpart_id);
                self.mark_active_read();
                let _ = response_tx.send(Ok(()));
            }
            SessionCommand::ClearSelection { response_tx } => {
                self.controller.clear_selection();
                let _ = response_tx.send(Ok(()));
            }
            SessionCommand::Send { draft, response_tx } => {
                match self.controller.prepare_send(&draft) {
                    Ok(SendTarget::Known {
                        thread_id,
                        recipient_id,
                    }) => self.stage_and_insert(&thread_id, &recipient_id, draft, response_tx),
                    Ok(SendTarget::NeedsContact { thread_id }) => {
                        self.spawn_contact_lookup(thread_id, draft, response_tx)
                    }
                    Err(e) => {
                        let _ = response_tx.send(Err(e));
                    }
                }
            }
            SessionCommand::MarkRead { ids, response_tx } => match self.controller.mark_read(&ids) {
                Ok(Some(batch)) => self.spawn_read_write(batch, Some(response_tx)),
                Ok(None) => {
                    let _ = response_tx.send(Ok(()));
                }
                Err(e) => {
                    let _ = response_tx.send(Err(e));
                }
            },
            SessionCommand::RetrySend {
                correlation_id,
                response_tx,
            } => match self.controller.retry_send(&correlation_id) {
                Ok(payload) => {
                    tracing::info!(correlation = %correlation_id, "retrying send");
                    self.send_waiters.insert(correlation_id, response_tx);
                    self.spawn_insert(payload);
                }
                Err(e) => {
                    let _ = response_tx.send(Err(e));
                }
            },
            SessionCommand::DiscardFailedSend {
                correlation_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.controller.discard_failed_send(&correlation_id));
            }
            SessionCommand::SetFilter {
                filter,
                response_tx,
            } => {
                self.controller.set_filter(filter);
                let _ = response_tx.send(Ok(()));
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Contact {
                thread_id,
                draft,
                result,
                response_tx,
            } => match result {
                Ok(contact) => self.stage_and_insert(&thread_id, &contact, draft, response_tx),
                Err(e) => {
                    tracing::warn!(%thread_id, "listing contact lookup failed: {}", e);
                    let _ = response_tx.send(Err(e.into()));
                }
            },
            Completion::Inserted {
                correlation_id,
                result,
            } => {
                let reply = self.controller.confirm_send(&correlation_id, result);
                if let Some(response_tx) = self.send_waiters.remove(&correlation_id) {
                    let _ = response_tx.send(reply);
                }
            }
            Completion::ReadFlag {
                batch,
                result,
                response_tx,
            } => {
                let reply = self.controller.apply_read_result(&batch, result);
                if let Some(response_tx) = response_tx {
                    let _ = response_tx.send(reply);
                }
            }
            Completion::Enriched { request, result } => {
                self.controller.apply_enrichment(&request, result);
            }
            Completion::Resubscribed { result } => {
                self.resubscribing = false;
                match result {
                    Ok((feed, stored)) => {
                        self.feed = Some(feed);
                        let missed = self.controller.merge_catch_up(stored);
                        self.controller.set_live_connected(true);
                        tracing::info!(
                            viewer = self.controller.viewer(),
                            missed = missed.len(),
                            "live feed re-opened"
                        );
                        let active = self.controller.active_key();
                        if active.is_some_and(|key| missed.contains(&key)) {
                            self.mark_active_read();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            viewer = self.controller.viewer(),
                            "live feed re-open failed, retrying: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    fn feed_lost(&mut self, reason: &str) {
        tracing::warn!(viewer = self.controller.viewer(), reason, "live feed lost");
        self.feed = None;
        self.controller.set_live_connected(false);
        self.spawn_resubscribe();
    }

    fn handle_live(&mut self, message: Message) {
        let outcome = self.controller.merge_live(message);
        if let MergeOutcome::Inserted(key) = outcome {
            if self.controller.active_key().as_ref() == Some(&key) {
                self.mark_active_read();
            }
        }
    }

    fn mark_active_read(&mut self) {
        if let Some(batch) = self.controller.mark_active_read() {
            self.spawn_read_write(batch, None);
        }
    }

    fn stage_and_insert(
        &mut self,
        thread_id: &str,
        recipient_id: &str,
        draft: MessageDraft,
        response_tx: SendReply,
    ) {
        match self.controller.stage_send(thread_id, recipient_id, draft) {
            Ok(payload) => {
                self.send_waiters
                    .insert(payload.client_ref.clone(), response_tx);
                self.spawn_insert(payload);
            }
            Err(e) => {
                let _ = response_tx.send(Err(e));
            }
        }
    }

    fn dispatch_enrichment(&mut self) {
        for request in self.controller.take_enrichment_requests() {
            self.spawn_lookup(request);
        }
    }

    // ===== Gateway calls =====

    fn spawn_insert(&self, payload: NewMessage) {
        let gateway = self.gateway.clone();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let correlation_id = payload.client_ref.clone();
            let result = gateway.insert_message(payload).await;
            let _ = completion_tx
                .send(Completion::Inserted {
                    correlation_id,
                    result,
                })
                .await;
        });
    }

    fn spawn_read_write(&self, batch: ReadBatch, response_tx: Option<UnitReply>) {
        let gateway = self.gateway.clone();
        let completion_tx = self.completion_tx.clone();
        let viewer = self.controller.viewer().to_string();
        tokio::spawn(async move {
            let result = gateway.update_read_flag(batch.ids.clone(), viewer).await;
            let _ = completion_tx
                .send(Completion::ReadFlag {
                    batch,
                    result,
                    response_tx,
                })
                .await;
        });
    }

    fn spawn_contact_lookup(&self, thread_id: String, draft: MessageDraft, response_tx: SendReply) {
        let directory = self.directory.clone();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = directory.resolve_subject_contact(&thread_id).await;
            let _ = completion_tx
                .send(Completion::Contact {
                    thread_id,
                    draft,
                    result,
                    response_tx,
                })
                .await;
        });
    }

    /// Subscribe before querying, as at start, so nothing falls in between.
    fn spawn_resubscribe(&mut self) {
        if self.resubscribing {
            return;
        }
        self.resubscribing = true;
        let gateway = self.gateway.clone();
        let completion_tx = self.completion_tx.clone();
        let viewer = self.controller.viewer().to_string();
        tokio::spawn(async move {
            let result = async {
                let feed = LiveFeed::open(gateway.as_ref(), &viewer).await?;
                let stored = gateway
                    .query_messages(MessageFilter::participant(viewer.clone()))
                    .await?;
                Ok::<_, GatewayError>((feed, stored))
            }
            .await;
            let _ = completion_tx
                .send(Completion::Resubscribed { result })
                .await;
        });
    }

    fn spawn_lookup(&self, request: EnrichmentRequest) {
        let directory = self.directory.clone();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = match &request {
                EnrichmentRequest::DisplayName { user_id } => {
                    directory.resolve_display_identity(user_id).await
                }
                EnrichmentRequest::SubjectTitle { thread_id } => {
                    directory.resolve_subject_title(thread_id).await
                }
            };
            let _ = completion_tx
                .send(Completion::Enriched { request, result })
                .await;
        });
    }
}

/// Next live item, or pending while there is no feed.
async fn next_live(feed: &mut Option<LiveFeed>) -> Option<GatewayResult<Message>> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}
