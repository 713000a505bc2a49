//! Transform history kept for auditing and replay.
//!
//! Each open document gets a [`CompressedAuditor`] that records the accepted,
//! corrected transforms, coalescing contiguous edits with [`merge`] so a long
//! typing session collapses into a handful of entries.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tandem_text::{apply, merge, Transform, TransformError};
use thiserror::Error;

use crate::store::{Store, StoreError};

/// Receives every transform a binder accepts.
pub trait Auditor: Send + Sync {
    fn on_transform(&self, ot: &Transform);
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to replay transforms on {id}: {source}")]
    Replay {
        id: String,
        #[source]
        source: TransformError,
    },
}

/// Transform history of a single document.
#[derive(Debug, Default)]
pub struct CompressedAuditor {
    transforms: Mutex<Vec<Transform>>,
}

impl CompressedAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transforms(&self) -> Vec<Transform> {
        self.transforms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.transforms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply the recorded history to `content`.
    pub fn reapply(&self, content: &mut String) -> Result<(), TransformError> {
        let mut chars: Vec<char> = content.chars().collect();
        for ot in self.transforms.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            apply(&mut chars, ot)?;
        }
        *content = chars.into_iter().collect();
        Ok(())
    }
}

impl Auditor for CompressedAuditor {
    fn on_transform(&self, ot: &Transform) {
        let mut transforms = self.transforms.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = transforms.last_mut() {
            if merge(last, ot) {
                return;
            }
        }
        transforms.push(ot.clone());
    }
}

/// Auditors for every document seen, keyed by document id.
#[derive(Debug, Default)]
pub struct AuditLog {
    auditors: Mutex<HashMap<String, Arc<CompressedAuditor>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The auditor of a document, created on first use.
    pub fn get(&self, id: &str) -> Arc<CompressedAuditor> {
        let mut auditors = self.auditors.lock().unwrap_or_else(PoisonError::into_inner);
        auditors
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(CompressedAuditor::new()))
            .clone()
    }

    /// `{"<document id>": [transforms...]}`
    pub fn to_json(&self) -> Value {
        let auditors = self.auditors.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = Map::new();
        for (id, auditor) in auditors.iter() {
            let transforms = auditor
                .transforms()
                .iter()
                .map(|ot| serde_json::to_value(ot).unwrap_or(Value::Null))
                .collect();
            map.insert(id.clone(), Value::Array(transforms));
        }
        Value::Object(map)
    }

    /// Replay every audited history onto the matching stored document.
    /// Returns the number of documents rewritten.
    pub fn reapply(&self, store: &dyn Store) -> Result<usize, AuditError> {
        let auditors: Vec<(String, Arc<CompressedAuditor>)> = self
            .auditors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, auditor)| (id.clone(), auditor.clone()))
            .collect();

        let mut count = 0;
        for (id, auditor) in auditors {
            if auditor.is_empty() {
                continue;
            }
            let mut doc = store.read(&id)?;
            auditor
                .reapply(&mut doc.content)
                .map_err(|source| AuditError::Replay { id: id.clone(), source })?;
            store.update(&doc)?;
            log::info!("Reapplied audit history of {id}");
            count += 1;
        }
        Ok(count)
    }
}
