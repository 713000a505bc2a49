//! Per-document actor.
//!
//! ```text
//!   Binder (handle, Clone)                 BinderLoop (one tokio task)
//!  ┌───────────────────────┐  subscribe   ┌───────────────────────────┐
//!  │ subscribe / users /   │ ───────────► │ OtBuffer                  │
//!  │ kick / close          │              │ clients: Vec<Client>      │
//!  └───────────────────────┘              │ flush ticker              │
//!   Portal (per session)      transform   │ inactivity deadline       │
//!  ┌───────────────────────┐ ───────────► │                           │
//!  │ send_transform /      │  message     │ fan-out: join_all of      │
//!  │ send_message / exit   │ ───────────► │ send_timeout(kick_period) │
//!  └───────────────────────┘ ◄─────────── └───────────────────────────┘
//!                               corrected transforms, updates
//! ```
//!
//! All mutation of the buffer and the roster happens inside the loop, so the
//! buffer observes a strict total order of submissions. A client that cannot
//! take a broadcast within `kick_period` is dropped from the roster, which
//! closes its portal channels.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_text::{BufferConfig, FlushError, OtBuffer, TransformError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::audit::Auditor;
use crate::portal::{ClientInfo, ClientUpdate, MessageSubmission, Portal, TransformSubmission};
use crate::store::{Document, Store, StoreError};

const INBOX_CAPACITY: usize = 16;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Error)]
pub enum BinderError {
    #[error("request timed out")]
    Timeout,
    #[error("attempted to send transforms through a read only portal")]
    ReadOnlyPortal,
    #[error("binder is closed")]
    Closed,
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Binder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// How often unapplied transforms are written to the store (default: 500ms)
    pub flush_period_ms: u64,
    /// How long applied transforms are kept for correcting stale submissions (default: 60s)
    pub retention_period_s: i64,
    /// Deadline for a broadcast to reach a client before it is kicked (default: 200ms)
    pub kick_period_ms: u64,
    /// How long a binder without clients stays open (default: 5min)
    pub close_inactivity_period_ms: u64,
    /// Capacity of each client's outgoing channels (default: 16)
    pub client_buffer: usize,
    pub transform_buffer: BufferConfig,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            flush_period_ms: 500,
            retention_period_s: 60,
            kick_period_ms: 200,
            close_inactivity_period_ms: 300_000,
            client_buffer: 16,
            transform_buffer: BufferConfig::default(),
        }
    }
}

impl BinderConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms.max(1))
    }

    pub fn kick_period(&self) -> Duration {
        Duration::from_millis(self.kick_period_ms)
    }

    pub fn close_inactivity_period(&self) -> Duration {
        Duration::from_millis(self.close_inactivity_period_ms.max(1))
    }
}

/// Sent by a binder that wants to be closed: `error` is `None` after an
/// inactivity period, `Some` when a flush failed and the binder stopped.
#[derive(Debug, Clone)]
pub struct BinderShutdown {
    pub id: String,
    pub error: Option<BinderError>,
    pub(crate) instance: u64,
}

struct SubscribeRequest {
    user_id: String,
    read_only: bool,
    reply: oneshot::Sender<Result<Portal, BinderError>>,
}

struct KickRequest {
    user_id: String,
    reply: oneshot::Sender<usize>,
}

/// Handle to the actor owning one open document.
#[derive(Clone)]
pub struct Binder {
    id: String,
    instance: u64,
    subscribe_tx: mpsc::Sender<SubscribeRequest>,
    users_tx: mpsc::Sender<oneshot::Sender<Vec<ClientInfo>>>,
    kick_tx: mpsc::Sender<KickRequest>,
    close_tx: mpsc::Sender<()>,
    closed_rx: watch::Receiver<bool>,
}

impl Binder {
    /// Read the document from `store` and start its loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn Store>,
        config: BinderConfig,
        shutdown_tx: mpsc::UnboundedSender<BinderShutdown>,
        auditor: Option<Arc<dyn Auditor>>,
    ) -> Result<Self, BinderError> {
        let id = id.into();
        let document = store.read(&id)?;
        let buffer = OtBuffer::new(&document.content, config.transform_buffer.clone());
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);

        let (subscribe_tx, subscribe_rx) = mpsc::channel(INBOX_CAPACITY);
        let (transform_tx, transform_rx) = mpsc::channel(INBOX_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(INBOX_CAPACITY);
        let (users_tx, users_rx) = mpsc::channel(INBOX_CAPACITY);
        let (kick_tx, kick_rx) = mpsc::channel(INBOX_CAPACITY);
        let (exit_tx, exit_rx) = mpsc::channel(INBOX_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = watch::channel(false);

        let inbox = Inbox {
            subscribe_rx,
            transform_rx,
            message_rx,
            users_rx,
            kick_rx,
            exit_rx,
            close_rx,
        };

        let idle_deadline = Instant::now() + config.close_inactivity_period();
        let binder_loop = BinderLoop {
            id: id.clone(),
            instance,
            config,
            store,
            document,
            buffer,
            clients: Vec::new(),
            auditor,
            shutdown_tx,
            transform_tx,
            message_tx,
            exit_tx,
            idle_deadline,
            inactivity_reported: false,
        };
        tokio::spawn(binder_loop.run(inbox, closed_tx));

        log::info!("Binder {id} opened");

        Ok(Self {
            id,
            instance,
            subscribe_tx,
            users_tx,
            kick_tx,
            close_tx,
            closed_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    /// Whether the loop has finished its final flush and stopped.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Open an editing session for `user_id`.
    pub async fn subscribe(&self, user_id: &str, timeout: Duration) -> Result<Portal, BinderError> {
        self.request_portal(user_id, false, timeout).await
    }

    /// Open a session that receives updates but cannot submit transforms.
    pub async fn subscribe_read_only(
        &self,
        user_id: &str,
        timeout: Duration,
    ) -> Result<Portal, BinderError> {
        self.request_portal(user_id, true, timeout).await
    }

    async fn request_portal(
        &self,
        user_id: &str,
        read_only: bool,
        timeout: Duration,
    ) -> Result<Portal, BinderError> {
        let (reply, reply_rx) = oneshot::channel();
        let request = SubscribeRequest {
            user_id: user_id.to_string(),
            read_only,
            reply,
        };
        round_trip(&self.subscribe_tx, request, reply_rx, timeout).await?
    }

    /// Sessions currently enrolled.
    pub async fn get_users(&self, timeout: Duration) -> Result<Vec<ClientInfo>, BinderError> {
        let (reply, reply_rx) = oneshot::channel();
        round_trip(&self.users_tx, reply, reply_rx, timeout).await
    }

    /// Drop every session of `user_id`. Returns how many were dropped.
    pub async fn kick_user(&self, user_id: &str, timeout: Duration) -> Result<usize, BinderError> {
        let (reply, reply_rx) = oneshot::channel();
        let request = KickRequest {
            user_id: user_id.to_string(),
            reply,
        };
        round_trip(&self.kick_tx, request, reply_rx, timeout).await
    }

    /// Stop the loop and wait for its final flush.
    pub async fn close(&self) {
        // A full channel means a close is already queued.
        let _ = self.close_tx.try_send(());
        let mut closed = self.closed_rx.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

async fn round_trip<R, T>(
    tx: &mpsc::Sender<R>,
    request: R,
    reply: oneshot::Receiver<T>,
    timeout: Duration,
) -> Result<T, BinderError> {
    tokio::time::timeout(timeout, async {
        tx.send(request).await.map_err(|_| BinderError::Closed)?;
        reply.await.map_err(|_| BinderError::Closed)
    })
    .await
    .map_err(|_| BinderError::Timeout)?
}

struct Client {
    info: ClientInfo,
    transform_tx: mpsc::Sender<tandem_text::Transform>,
    update_tx: mpsc::Sender<ClientUpdate>,
}

struct Inbox {
    subscribe_rx: mpsc::Receiver<SubscribeRequest>,
    transform_rx: mpsc::Receiver<TransformSubmission>,
    message_rx: mpsc::Receiver<MessageSubmission>,
    users_rx: mpsc::Receiver<oneshot::Sender<Vec<ClientInfo>>>,
    kick_rx: mpsc::Receiver<KickRequest>,
    exit_rx: mpsc::Receiver<String>,
    close_rx: mpsc::Receiver<()>,
}

enum Event {
    Subscribe(SubscribeRequest),
    Transform(TransformSubmission),
    Message(MessageSubmission),
    Users(oneshot::Sender<Vec<ClientInfo>>),
    Kick(KickRequest),
    Exit(String),
    Flush,
    Inactive,
    Close,
}

struct BinderLoop {
    id: String,
    instance: u64,
    config: BinderConfig,
    store: Arc<dyn Store>,
    /// Content as of the last flush.
    document: Document,
    buffer: OtBuffer,
    clients: Vec<Client>,
    auditor: Option<Arc<dyn Auditor>>,
    shutdown_tx: mpsc::UnboundedSender<BinderShutdown>,

    // Cloned into every portal.
    transform_tx: mpsc::Sender<TransformSubmission>,
    message_tx: mpsc::Sender<MessageSubmission>,
    exit_tx: mpsc::Sender<String>,

    idle_deadline: Instant,
    inactivity_reported: bool,
}

impl BinderLoop {
    async fn run(mut self, mut inbox: Inbox, closed_tx: watch::Sender<bool>) {
        let flush_period = self.config.flush_period();
        let mut flush_tick = tokio::time::interval_at(Instant::now() + flush_period, flush_period);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Roster changes go first so queries see them.
            let event = tokio::select! {
                biased;
                _ = inbox.close_rx.recv() => Event::Close,
                Some(session_id) = inbox.exit_rx.recv() => Event::Exit(session_id),
                Some(request) = inbox.kick_rx.recv() => Event::Kick(request),
                request = inbox.subscribe_rx.recv() => match request {
                    Some(request) => Event::Subscribe(request),
                    None => Event::Close,
                },
                Some(submission) = inbox.transform_rx.recv() => Event::Transform(submission),
                Some(submission) = inbox.message_rx.recv() => Event::Message(submission),
                Some(reply) = inbox.users_rx.recv() => Event::Users(reply),
                _ = flush_tick.tick() => Event::Flush,
                _ = tokio::time::sleep_until(self.idle_deadline), if !self.inactivity_reported => {
                    Event::Inactive
                }
            };

            let result = match event {
                Event::Subscribe(request) => self.subscribe(request),
                Event::Transform(submission) => {
                    self.transform(submission).await;
                    Ok(())
                }
                Event::Message(submission) => {
                    self.message(submission).await;
                    Ok(())
                }
                Event::Users(reply) => {
                    let _ = reply.send(self.clients.iter().map(|c| c.info.clone()).collect());
                    Ok(())
                }
                Event::Kick(request) => {
                    let user_id = request.user_id;
                    let kicked = self.remove_clients(|c| c.info.user_id == user_id);
                    log::debug!("Binder {} kicked {kicked} sessions of user {user_id}", self.id);
                    let _ = request.reply.send(kicked);
                    Ok(())
                }
                Event::Exit(session_id) => {
                    if self.remove_clients(|c| c.info.session_id == session_id) > 0 {
                        log::debug!("Session {session_id} left binder {}", self.id);
                    }
                    Ok(())
                }
                Event::Flush => self.flush_if_dirty(),
                Event::Inactive => {
                    self.check_inactive();
                    Ok(())
                }
                Event::Close => break,
            };

            if let Err(e) = result {
                log::error!("Binder {} failed: {e}, shutting down", self.id);
                self.report(Some(e));
                break;
            }
        }

        self.shutdown(closed_tx);
        drop(inbox);
    }

    fn subscribe(&mut self, request: SubscribeRequest) -> Result<(), BinderError> {
        // New sessions start from flushed content so the version matches.
        if let Err(e) = self.flush_if_dirty() {
            let _ = request.reply.send(Err(e.clone()));
            return Err(e);
        }

        let info = ClientInfo {
            user_id: request.user_id,
            session_id: Uuid::new_v4().to_string(),
        };
        let capacity = self.config.client_buffer.max(1);
        let (transform_tx, transform_rx) = mpsc::channel(capacity);
        let (update_tx, update_rx) = mpsc::channel(capacity);

        let portal = Portal::new(
            info.clone(),
            self.buffer.version(),
            self.document.clone(),
            transform_rx,
            update_rx,
            (!request.read_only).then(|| self.transform_tx.clone()),
            self.message_tx.clone(),
            self.exit_tx.clone(),
        );

        if request.reply.send(Ok(portal)).is_err() {
            log::debug!(
                "Subscriber {} of binder {} went away before enrolment",
                info.user_id,
                self.id
            );
            return Ok(());
        }

        log::debug!(
            "Session {} of user {} joined binder {} (read only: {})",
            info.session_id,
            info.user_id,
            self.id,
            request.read_only
        );
        self.clients.push(Client {
            info,
            transform_tx,
            update_tx,
        });
        Ok(())
    }

    async fn transform(&mut self, submission: TransformSubmission) {
        let TransformSubmission {
            session_id,
            transform,
            reply,
        } = submission;

        if !self.clients.iter().any(|c| c.info.session_id == session_id) {
            let _ = reply.send(Err(BinderError::Closed));
            return;
        }

        log::debug!("Binder {} received transform from {session_id}", self.id);
        match self.buffer.push_transform(transform) {
            Ok((ot, version)) => {
                if let Some(auditor) = &self.auditor {
                    auditor.on_transform(&ot);
                }
                let _ = reply.send(Ok(version));

                let targets = self
                    .clients
                    .iter()
                    .filter(|c| c.info.session_id != session_id)
                    .map(|c| (c.info.session_id.clone(), c.transform_tx.clone()))
                    .collect();
                let dropped = fan_out(targets, ot, self.config.kick_period()).await;
                self.evict(&dropped);
            }
            Err(e) => {
                log::debug!("Binder {} rejected transform from {session_id}: {e}", self.id);
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn message(&mut self, submission: MessageSubmission) {
        // Sessions that already left may still announce their departure.
        let MessageSubmission { client, message } = submission;
        log::trace!("Binder {} received message from {}", self.id, client.session_id);

        let targets = self
            .clients
            .iter()
            .filter(|c| c.info.session_id != client.session_id)
            .map(|c| (c.info.session_id.clone(), c.update_tx.clone()))
            .collect();
        let update = ClientUpdate { client, message };
        let dropped = fan_out(targets, update, self.config.kick_period()).await;
        self.evict(&dropped);
    }

    fn evict(&mut self, sessions: &[String]) {
        if sessions.is_empty() {
            return;
        }
        for session_id in sessions {
            log::debug!("Binder {} kicked unresponsive session {session_id}", self.id);
        }
        self.remove_clients(|c| sessions.contains(&c.info.session_id));
    }

    /// Drop matching clients, closing their portal channels.
    fn remove_clients(&mut self, matches: impl Fn(&Client) -> bool) -> usize {
        let before = self.clients.len();
        self.clients.retain(|c| !matches(c));
        let removed = before - self.clients.len();
        if removed > 0 && self.clients.is_empty() {
            self.idle_deadline = Instant::now() + self.config.close_inactivity_period();
        }
        removed
    }

    fn check_inactive(&mut self) {
        self.idle_deadline = Instant::now() + self.config.close_inactivity_period();
        if self.clients.is_empty() {
            log::info!("Binder {} inactive, requesting shutdown", self.id);
            self.inactivity_reported = true;
            self.report(None);
        }
    }

    fn flush_if_dirty(&mut self) -> Result<(), BinderError> {
        if !self.buffer.is_dirty() {
            return Ok(());
        }
        self.flush()
    }

    /// Read, modify and write back the stored document.
    fn flush(&mut self) -> Result<(), BinderError> {
        let mut doc = self.store.read(&self.id)?;
        let result = self
            .buffer
            .flush_transforms(&mut doc.content, self.config.retention_period_s);

        let changed = match &result {
            Ok(changed) => *changed,
            Err(e) => e.changed(),
        };
        if changed {
            self.store.update(&doc)?;
        }
        self.document = doc;
        result?;
        Ok(())
    }

    fn report(&self, error: Option<BinderError>) {
        let report = BinderShutdown {
            id: self.id.clone(),
            error,
            instance: self.instance,
        };
        if self.shutdown_tx.send(report).is_err() {
            log::debug!("Nobody listens for shutdown of binder {}", self.id);
        }
    }

    fn shutdown(mut self, closed_tx: watch::Sender<bool>) {
        self.clients.clear();
        if self.buffer.is_dirty() {
            if let Err(e) = self.flush() {
                log::error!("Final flush of binder {} failed: {e}", self.id);
            }
        }
        log::info!("Binder {} closed", self.id);
        // Release the store before anyone waiting on close resumes.
        drop(self);
        closed_tx.send_replace(true);
    }
}

/// Send `item` to every target within `kick_period`. Returns the sessions
/// that missed the deadline.
async fn fan_out<T: Clone>(
    targets: Vec<(String, mpsc::Sender<T>)>,
    item: T,
    kick_period: Duration,
) -> Vec<String> {
    let sends = targets.into_iter().map(|(session_id, tx)| {
        let item = item.clone();
        async move {
            match tx.send_timeout(item, kick_period).await {
                Ok(()) => None,
                Err(_) => Some(session_id),
            }
        }
    });
    join_all(sends).await.into_iter().flatten().collect()
}
