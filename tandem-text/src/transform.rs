//! The `Transform` edit and the algebra that reconciles concurrent edits.
//!
//! A transform reads as "delete `delete` chars at `position`, then insert
//! `insert` at `position`". Versions are assigned by the [`OtBuffer`] that
//! accepts the transform; none of the functions here touch them.
//!
//! Wire format (JSON, field names shared with every client):
//! ```text
//! { "position": 6, "num_delete": 5, "insert": "universe", "version": 2, "received": 1700000000 }
//! ```
//! `received` is omitted while it is zero.
//!
//! [`OtBuffer`]: crate::buffer::OtBuffer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating or applying transforms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("transform contained negative delete")]
    NegativeDelete,
    #[error("transform position was out of document bounds")]
    OutOfBounds,
    #[error("transform insert length exceeded the limit")]
    TooLong,
    #[error("transform diff greater than transform archive")]
    TooOld,
    #[error("transform version beyond latest")]
    Skipped,
    #[error(
        "transform position ({position}) and deletion ({delete}) surpassed document length ({length})"
    )]
    Corrupted {
        position: i64,
        delete: i64,
        length: usize,
    },
}

/// A single text edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default)]
    pub position: i64,
    #[serde(rename = "num_delete", default)]
    pub delete: i64,
    #[serde(default)]
    pub insert: String,
    #[serde(default)]
    pub version: i64,
    /// Unix seconds at which the buffer accepted this transform.
    #[serde(rename = "received", default, skip_serializing_if = "is_zero")]
    pub received: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Transform {
    pub fn new(position: i64, delete: i64, insert: impl Into<String>, version: i64) -> Self {
        Self {
            position,
            delete,
            insert: insert.into(),
            version,
            received: 0,
        }
    }

    /// Length of the inserted text in chars.
    pub fn insert_len(&self) -> i64 {
        self.insert.chars().count() as i64
    }
}

/// Adjust `sub`, authored without knowledge of `pre`, so that applying `pre`
/// followed by `sub` preserves what `sub` originally meant.
///
/// When a transform written against version 7 turns out to land at version
/// 10, call this once for each of versions 7, 8 and 9 in order. The result can
/// be dispatched to every other client.
pub fn fix_out_of_date(sub: &mut Transform, pre: &Transform) {
    let pre_len = pre.insert_len();

    if pre.position <= sub.position {
        if pre_len > 0 && pre.delete == 0 {
            sub.position += pre_len;
        } else if pre.delete > 0 && pre.position + pre.delete <= sub.position {
            sub.position += pre_len - pre.delete;
        } else if pre.delete > 0 && pre.position + pre.delete > sub.position {
            let overhang = sub.delete.min(pre.position + pre.delete - sub.position);
            sub.delete -= overhang;
            sub.position = pre.position + pre_len;
        }
    } else if sub.delete > 0 && sub.position + sub.delete > pre.position {
        let gap = pre.position - sub.position;
        let excess = (sub.delete - gap).max(0);

        if excess > pre.delete {
            sub.delete += pre_len - pre.delete;
            sub.insert.push_str(&pre.insert);
        } else {
            sub.delete = gap;
        }
    }
}

/// Client side counterpart of [`fix_out_of_date`].
///
/// A client applies its own edit (`unsent`) before learning of a remote edit
/// (`unapplied`) that the server ordered first. Both transforms are rewritten:
/// `unapplied` so it can be applied on top of the local document, `unsent` so
/// the server sees it in the right frame.
pub fn fix_premature(unapplied: &mut Transform, unsent: &mut Transform) {
    let (before, after) = if unapplied.position <= unsent.position {
        (unapplied, unsent)
    } else {
        (unsent, unapplied)
    };

    let before_len = before.insert_len();
    let after_len = after.insert_len();

    if before.delete == 0 {
        after.position += before_len;
    } else if before.delete + before.position <= after.position {
        after.position += before_len - before.delete;
    } else {
        let gap = after.position - before.position;
        let excess = (before.delete - gap).max(0);

        if excess > after.delete {
            before.delete += after_len - after.delete;
            before.insert.push_str(&after.insert);
        } else {
            before.delete = gap;
        }

        after.delete = (after.delete - excess).max(0);
        after.position = before.position + before_len;
    }
}

/// Coalesce `second`, which immediately follows `first`, into `first`.
///
/// Returns false (leaving `first` untouched) when the two edits neither touch
/// nor overlap.
pub fn merge(first: &mut Transform, second: &Transform) -> bool {
    let chars: Vec<char> = first.insert.chars().collect();
    let first_len = chars.len() as i64;

    if first.position + first_len == second.position {
        first.insert.push_str(&second.insert);
        first.delete += second.delete;
        return true;
    }
    if second.position == first.position {
        let remainder = (second.delete - first_len).max(0);
        let skip = (second.delete - remainder).clamp(0, first_len) as usize;
        first.delete += remainder;
        first.insert = second.insert.clone() + &chars[skip..].iter().collect::<String>();
        return true;
    }
    if second.position > first.position && second.position < first.position + first_len {
        let overlap = second.position - first.position;
        let remainder = (second.delete - (first_len - overlap)).max(0);
        let tail = (overlap + second.delete).clamp(overlap, first_len) as usize;
        first.delete += remainder;

        let mut insert: String = chars[..overlap as usize].iter().collect();
        insert.push_str(&second.insert);
        insert.extend(&chars[tail..]);
        first.insert = insert;
        return true;
    }
    false
}

/// Splice a transform into `content`.
pub fn apply(content: &mut Vec<char>, ot: &Transform) -> Result<(), TransformError> {
    if ot.delete < 0 {
        return Err(TransformError::NegativeDelete);
    }
    if ot.position < 0 || ot.position + ot.delete > content.len() as i64 {
        return Err(TransformError::Corrupted {
            position: ot.position,
            delete: ot.delete,
            length: content.len(),
        });
    }

    let start = ot.position as usize;
    let end = start + ot.delete as usize;
    content.splice(start..end, ot.insert.chars());
    Ok(())
}
