//! Per-client session handle into a [`Binder`](crate::binder::Binder).
//!
//! A portal is handed out on subscribe and carries the document snapshot and
//! version the client starts from. Transforms submitted by other clients
//! arrive on [`Portal::recv_transform`], presence updates on
//! [`Portal::recv_update`]. Both return `None` once the binder dropped the
//! session (exit, kick, eviction or binder shutdown).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_text::Transform;
use tokio::sync::{mpsc, oneshot};

use crate::binder::BinderError;
use crate::store::Document;

/// Identity of one session. A user may hold several sessions at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientInfo {
    pub user_id: String,
    pub session_id: String,
}

/// Ephemeral presence data such as a cursor position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default)]
    pub active: bool,
}

/// A [`Message`] broadcast together with the session that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub client: ClientInfo,
    pub message: Message,
}

/// Traffic from other sessions, as returned by [`Portal::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum PortalEvent {
    Transform(Transform),
    Update(ClientUpdate),
}

pub(crate) struct TransformSubmission {
    pub session_id: String,
    pub transform: Transform,
    pub reply: oneshot::Sender<Result<i64, BinderError>>,
}

pub(crate) struct MessageSubmission {
    pub client: ClientInfo,
    pub message: Message,
}

pub struct Portal {
    client: ClientInfo,
    version: i64,
    document: Option<Document>,

    transform_rx: mpsc::Receiver<Transform>,
    update_rx: mpsc::Receiver<ClientUpdate>,

    /// `None` for read only sessions.
    transform_tx: Option<mpsc::Sender<TransformSubmission>>,
    message_tx: mpsc::Sender<MessageSubmission>,
    exit_tx: mpsc::Sender<String>,
}

impl Portal {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: ClientInfo,
        version: i64,
        document: Document,
        transform_rx: mpsc::Receiver<Transform>,
        update_rx: mpsc::Receiver<ClientUpdate>,
        transform_tx: Option<mpsc::Sender<TransformSubmission>>,
        message_tx: mpsc::Sender<MessageSubmission>,
        exit_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            client,
            version,
            document: Some(document),
            transform_rx,
            update_rx,
            transform_tx,
            message_tx,
            exit_tx,
        }
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    /// Version of the document snapshot at subscribe time.
    pub fn base_version(&self) -> i64 {
        self.version
    }

    /// Document snapshot at subscribe time, until released.
    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    /// Take the snapshot out of the portal once it has been passed on.
    pub fn release_document(&mut self) -> Option<Document> {
        self.document.take()
    }

    pub fn is_read_only(&self) -> bool {
        self.transform_tx.is_none()
    }

    /// Submit a transform and wait for the version it was accepted at.
    ///
    /// A `Timeout` leaves the outcome unknown: the transform may still be
    /// applied later.
    pub async fn send_transform(&self, ot: Transform, timeout: Duration) -> Result<i64, BinderError> {
        let Some(transform_tx) = &self.transform_tx else {
            return Err(BinderError::ReadOnlyPortal);
        };

        let (reply, reply_rx) = oneshot::channel();
        let submission = TransformSubmission {
            session_id: self.client.session_id.clone(),
            transform: ot,
            reply,
        };

        tokio::time::timeout(timeout, async {
            transform_tx
                .send(submission)
                .await
                .map_err(|_| BinderError::Closed)?;
            reply_rx.await.map_err(|_| BinderError::Closed)?
        })
        .await
        .map_err(|_| BinderError::Timeout)?
    }

    /// Broadcast a presence message to the other sessions.
    pub async fn send_message(&self, message: Message) -> Result<(), BinderError> {
        self.message_tx
            .send(MessageSubmission {
                client: self.client.clone(),
                message,
            })
            .await
            .map_err(|_| BinderError::Closed)
    }

    /// Next transform from another session. `None` once the session ended.
    pub async fn recv_transform(&mut self) -> Option<Transform> {
        self.transform_rx.recv().await
    }

    /// Next presence update from another session. `None` once the session ended.
    pub async fn recv_update(&mut self) -> Option<ClientUpdate> {
        self.update_rx.recv().await
    }

    /// Next transform or presence update, whichever arrives first.
    pub async fn recv(&mut self) -> Option<PortalEvent> {
        tokio::select! {
            Some(ot) = self.transform_rx.recv() => Some(PortalEvent::Transform(ot)),
            Some(update) = self.update_rx.recv() => Some(PortalEvent::Update(update)),
            else => None,
        }
    }

    /// Leave the document. Does not wait for the binder beyond `timeout`.
    pub async fn exit(self, timeout: Duration) {
        let session_id = self.client.session_id.clone();
        if tokio::time::timeout(timeout, self.exit_tx.send(session_id))
            .await
            .is_err()
        {
            log::debug!("Exit of session {} timed out", self.client.session_id);
        }
    }
}
