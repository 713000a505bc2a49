//! Per-document transform history.
//!
//! ```text
//!                  push_transform(v=k)
//!                         │
//!                         ▼  fix against the (n+1-k) newest entries
//! ┌───────────────────────────────┬─────────────────────────┐
//! │ applied (retention window)    │ unapplied (not flushed) │ ──► version n+1
//! └───────────────────────────────┴─────────────────────────┘
//!                                  │
//!                                  ▼ flush_transforms(content)
//!                         content rewritten, unapplied ──► applied,
//!                         applied older than retention dropped
//! ```
//!
//! `virtual_len` tracks the document length including unapplied edits so
//! bounds checks never need the content itself.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

use crate::transform::{apply, fix_out_of_date, Transform, TransformError};

/// Size limits for a single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum document length in chars (default: 50Mi)
    pub max_document_size: u64,
    /// Maximum insert size of a single transform in bytes (default: 50KiB)
    pub max_transform_length: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_document_size: 52_428_800,
            max_transform_length: 51_200,
        }
    }
}

/// A flush that stopped part way through the unapplied transforms.
///
/// The content handed to [`OtBuffer::flush_transforms`] still holds the
/// first `applied` transforms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("flush stopped after {applied} transforms: {source}")]
pub struct FlushError {
    pub applied: usize,
    #[source]
    pub source: TransformError,
}

impl FlushError {
    /// Whether the content was modified before the failure.
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

/// Buffers a growing stack of transforms for one document, correcting out of
/// date submissions as they arrive.
#[derive(Debug, Clone)]
pub struct OtBuffer {
    config: BufferConfig,
    version: i64,
    virtual_len: i64,
    applied: Vec<Transform>,
    unapplied: Vec<Transform>,
}

impl OtBuffer {
    /// Create a buffer at version 1 for a document currently holding `content`.
    pub fn new(content: &str, config: BufferConfig) -> Self {
        Self {
            config,
            version: 1,
            virtual_len: content.chars().count() as i64,
            applied: Vec::new(),
            unapplied: Vec::new(),
        }
    }

    /// Accept a transform, correcting it against every transform its author
    /// had not seen yet. Returns the corrected transform and the new version.
    pub fn push_transform(&mut self, mut ot: Transform) -> Result<(Transform, i64), TransformError> {
        // Bounds against the document can only be checked after correction.
        if ot.position < 0 {
            return Err(TransformError::OutOfBounds);
        }
        if ot.delete < 0 {
            return Err(TransformError::NegativeDelete);
        }
        if ot.insert.len() as u64 > self.config.max_transform_length {
            return Err(TransformError::TooLong);
        }

        let len_applied = self.applied.len() as i64;
        let len_unapplied = self.unapplied.len() as i64;

        let mut diff = (self.version + 1) - ot.version;
        if diff > len_applied + len_unapplied {
            return Err(TransformError::TooOld);
        }
        if diff < 0 {
            return Err(TransformError::Skipped);
        }

        if diff > 0 {
            log::debug!(
                "Correcting transform at version {} against {diff} newer transforms",
                ot.version
            );
        }

        let start = len_applied - (diff - len_unapplied);
        if start < len_applied {
            for pre in &self.applied[start as usize..] {
                fix_out_of_date(&mut ot, pre);
                diff -= 1;
            }
        }
        for pre in &self.unapplied[(len_unapplied - diff) as usize..] {
            fix_out_of_date(&mut ot, pre);
        }

        let insert_len = ot.insert_len();
        if ot.position + ot.delete > self.virtual_len {
            return Err(TransformError::OutOfBounds);
        }
        if insert_len - ot.delete + self.virtual_len > self.max_document_size() {
            return Err(TransformError::TooLong);
        }

        self.version += 1;
        ot.version = self.version;
        ot.received = unix_now();

        self.virtual_len += insert_len - ot.delete;
        self.unapplied.push(ot.clone());

        Ok((ot, self.version))
    }

    /// Fold every unapplied transform into `content`, then drop applied
    /// transforms received more than `retention_secs` ago.
    ///
    /// Returns whether `content` changed.
    pub fn flush_transforms(
        &mut self,
        content: &mut String,
        retention_secs: i64,
    ) -> Result<bool, FlushError> {
        let mut transforms = std::mem::take(&mut self.unapplied);

        let mut chars: Vec<char> = content.chars().collect();
        let mut len = chars.len() as i64;
        let mut failure = None;

        for (i, ot) in transforms.iter().enumerate() {
            len += ot.insert_len() - ot.delete;
            let result = if len > self.max_document_size() {
                Err(TransformError::TooLong)
            } else {
                apply(&mut chars, ot)
            };
            if let Err(source) = result {
                log::error!("Flush halted at transform {i} of {}: {source}", transforms.len());
                failure = Some(FlushError { applied: i, source });
                break;
            }
        }

        let applied_count = failure.as_ref().map_or(transforms.len(), |f| f.applied);
        transforms.truncate(applied_count);

        *content = chars.into_iter().collect();

        let upto = unix_now() - retention_secs;
        let keep_from = self
            .applied
            .iter()
            .position(|ot| ot.received > upto)
            .unwrap_or(self.applied.len());
        self.applied.drain(..keep_from);
        self.applied.extend(transforms);

        if failure.is_some() {
            // Whatever was dropped can no longer be tracked in the virtual length.
            self.virtual_len = content.chars().count() as i64;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(applied_count > 0),
        }
    }

    /// Whether any transforms are waiting to be flushed.
    pub fn is_dirty(&self) -> bool {
        !self.unapplied.is_empty()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Document length in chars including unapplied transforms.
    pub fn virtual_len(&self) -> i64 {
        self.virtual_len
    }

    pub fn applied(&self) -> &[Transform] {
        &self.applied
    }

    pub fn unapplied(&self) -> &[Transform] {
        &self.unapplied
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    fn max_document_size(&self) -> i64 {
        i64::try_from(self.config.max_document_size).unwrap_or(i64::MAX)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
