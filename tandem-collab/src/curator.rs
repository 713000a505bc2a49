//! Registry of open binders.
//!
//! The curator authenticates callers, finds or creates the binder of a
//! document and hands back a [`Portal`]. Binders report back through one
//! unbounded channel when they want to close (inactive or failed); a
//! background task closes them and removes them from the registry, so the
//! next access rebuilds the binder from the store.
//!
//! The registry lock is held only for map lookups and inserts, never across a
//! binder call.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::audit::{AuditLog, Auditor};
use crate::auth::{AccessLevel, Authenticator};
use crate::binder::{Binder, BinderConfig, BinderError, BinderShutdown};
use crate::portal::Portal;
use crate::store::{Document, Store, StoreError};

#[derive(Debug, Clone, Error)]
pub enum CuratorError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("no open binder for document {0}")]
    BinderNotFound(String),
    #[error(transparent)]
    Binder(#[from] BinderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Curator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    pub binder: BinderConfig,
}

type Registry = Arc<RwLock<HashMap<String, Binder>>>;

pub struct Curator {
    config: CuratorConfig,
    auth: Arc<dyn Authenticator>,
    store: Arc<dyn Store>,
    audit: Option<Arc<AuditLog>>,
    binders: Registry,
    shutdown_tx: mpsc::UnboundedSender<BinderShutdown>,
    close_tx: mpsc::Sender<()>,
}

impl Curator {
    /// Create a curator and spawn its registry maintenance task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: CuratorConfig, auth: Arc<dyn Authenticator>, store: Arc<dyn Store>) -> Self {
        let binders: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::channel(1);

        tokio::spawn(maintain_registry(binders.clone(), shutdown_rx, close_rx));

        Self {
            config,
            auth,
            store,
            audit: None,
            binders,
            shutdown_tx,
            close_tx,
        }
    }

    /// Like [`Curator::new`], recording every accepted transform in `audit`.
    pub fn with_audit(
        config: CuratorConfig,
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn Store>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let mut curator = Self::new(config, auth, store);
        curator.audit = Some(audit);
        curator
    }

    /// Open an editing session on an existing document.
    pub async fn edit_document(
        &self,
        user_id: &str,
        token: &str,
        document_id: &str,
        timeout: Duration,
    ) -> Result<Portal, CuratorError> {
        self.authorize(user_id, token, document_id, AccessLevel::Edit)?;
        self.subscribe(document_id, user_id, false, timeout).await
    }

    /// Open a read only session on an existing document.
    pub async fn read_document(
        &self,
        user_id: &str,
        token: &str,
        document_id: &str,
        timeout: Duration,
    ) -> Result<Portal, CuratorError> {
        self.authorize(user_id, token, document_id, AccessLevel::Read)?;
        self.subscribe(document_id, user_id, true, timeout).await
    }

    /// Store a new document and open an editing session on it.
    pub async fn create_document(
        &self,
        user_id: &str,
        token: &str,
        document: Document,
        timeout: Duration,
    ) -> Result<Portal, CuratorError> {
        self.authorize(user_id, token, "", AccessLevel::Create)?;
        self.store.create(&document)?;
        log::info!("User {user_id} created document {}", document.id);
        self.subscribe(&document.id, user_id, false, timeout).await
    }

    /// Every open document with the users of its sessions.
    ///
    /// Binders that close while being asked are skipped; any other failure
    /// fails the whole query. All binders share one deadline.
    pub async fn get_users(
        &self,
        timeout: Duration,
    ) -> Result<HashMap<String, Vec<String>>, CuratorError> {
        let deadline = Instant::now() + timeout;
        let binders: Vec<Binder> = self.binders.read().await.values().cloned().collect();

        let queries = binders.into_iter().map(|binder| async move {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = binder.get_users(remaining).await;
            (binder.id().to_string(), result)
        });

        let mut users = HashMap::new();
        for (id, result) in join_all(queries).await {
            match result {
                Ok(clients) => {
                    users.insert(id, clients.into_iter().map(|c| c.user_id).collect());
                }
                Err(BinderError::Closed) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(users)
    }

    /// Drop every session of `user_id` from an open document.
    pub async fn kick_user(
        &self,
        document_id: &str,
        user_id: &str,
        timeout: Duration,
    ) -> Result<(), CuratorError> {
        let binder = self
            .binders
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| CuratorError::BinderNotFound(document_id.to_string()))?;
        let kicked = binder.kick_user(user_id, timeout).await?;
        log::info!("Kicked {kicked} sessions of user {user_id} from {document_id}");
        Ok(())
    }

    /// Ids of the documents with an open binder.
    pub async fn open_documents(&self) -> Vec<String> {
        self.binders.read().await.keys().cloned().collect()
    }

    /// Close every open binder, waiting for their final flushes, and stop
    /// the registry task.
    pub async fn close(&self) {
        let _ = self.close_tx.try_send(());
        let binders: Vec<Binder> = self.binders.write().await.drain().map(|(_, b)| b).collect();
        log::info!("Closing {} open binders", binders.len());
        join_all(binders.iter().map(|b| b.close())).await;
    }

    fn authorize(
        &self,
        user_id: &str,
        token: &str,
        document_id: &str,
        required: AccessLevel,
    ) -> Result<(), CuratorError> {
        let level = self.auth.authenticate(user_id, token, document_id);
        if level < required {
            log::info!(
                "Rejected user {user_id}: {level:?} access to {document_id:?}, needs {required:?}"
            );
            return Err(CuratorError::Unauthorized);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        document_id: &str,
        user_id: &str,
        read_only: bool,
        timeout: Duration,
    ) -> Result<Portal, CuratorError> {
        // A binder that closed between lookup and subscribe is replaced once.
        let mut retried = false;
        loop {
            let binder = self.acquire_binder(document_id).await?;
            let result = if read_only {
                binder.subscribe_read_only(user_id, timeout).await
            } else {
                binder.subscribe(user_id, timeout).await
            };

            match result {
                Err(BinderError::Closed) if !retried => {
                    retried = true;
                    self.forget(&binder).await;
                }
                result => return result.map_err(CuratorError::from),
            }
        }
    }

    async fn acquire_binder(&self, document_id: &str) -> Result<Binder, CuratorError> {
        if let Some(binder) = self.binders.read().await.get(document_id) {
            return Ok(binder.clone());
        }

        let mut binders = self.binders.write().await;
        if let Some(binder) = binders.get(document_id) {
            return Ok(binder.clone());
        }

        let auditor = self
            .audit
            .as_ref()
            .map(|audit| audit.get(document_id) as Arc<dyn Auditor>);
        let binder = Binder::new(
            document_id,
            self.store.clone(),
            self.config.binder.clone(),
            self.shutdown_tx.clone(),
            auditor,
        )?;
        binders.insert(document_id.to_string(), binder.clone());
        log::info!("Registered binder for {document_id} ({} open)", binders.len());
        Ok(binder)
    }

    async fn forget(&self, binder: &Binder) {
        let mut binders = self.binders.write().await;
        if binders
            .get(binder.id())
            .is_some_and(|b| b.instance() == binder.instance())
        {
            binders.remove(binder.id());
        }
    }
}

/// Close binders that asked for it, until the curator closes.
async fn maintain_registry(
    registry: Registry,
    mut shutdown_rx: mpsc::UnboundedReceiver<BinderShutdown>,
    mut close_rx: mpsc::Receiver<()>,
) {
    loop {
        let report = tokio::select! {
            Some(report) = shutdown_rx.recv() => report,
            _ = close_rx.recv() => break,
        };

        match &report.error {
            Some(e) => log::error!("Binder {} shut down with error: {e}", report.id),
            None => log::info!("Binder {} requested shutdown after inactivity", report.id),
        }

        let binder = registry
            .read()
            .await
            .get(&report.id)
            .filter(|b| b.instance() == report.instance)
            .cloned();
        let Some(binder) = binder else {
            continue;
        };

        // A slow final flush must not hold up other evictions.
        tokio::spawn(evict(registry.clone(), binder));
    }
    log::debug!("Registry task stopped");
}

/// Close `binder`, then drop it from the registry unless it was replaced.
async fn evict(registry: Registry, binder: Binder) {
    // Close before removing so a reopened binder reads the final flush.
    binder.close().await;

    let mut binders = registry.write().await;
    if binders
        .get(binder.id())
        .is_some_and(|b| b.instance() == binder.instance())
    {
        binders.remove(binder.id());
        log::info!("Removed binder {} ({} open)", binder.id(), binders.len());
    }
}
