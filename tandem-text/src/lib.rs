//! # tandem-text: Operational transform core for Tandem
//!
//! Reconciles concurrently authored text edits into a single total order.
//!
//! ## Architecture
//!
//! ```text
//!  client A ──┐                       ┌── corrected transform (v=n+1)
//!             ├── Transform (v=k) ──► │ OtBuffer │ ──► fan-out
//!  client B ──┘                       └──────────┘
//!                                       │  applied   (retention window)
//!                                       │  unapplied (pending flush)
//!                                       ▼
//!                                 flush_transforms(content)
//! ```
//!
//! ## Modules
//!
//! - [`transform`]: the `Transform` edit and the algebra over it
//!   (out-of-date fixes, premature fixes, merging, applying)
//! - [`buffer`]: per-document transform history with versioning and bounds checks
//!
//! All positions and lengths are measured in `char`s so multi-byte text
//! behaves the same on every client.

pub mod buffer;
pub mod transform;

pub use buffer::{BufferConfig, FlushError, OtBuffer};
pub use transform::{
    apply, fix_out_of_date, fix_premature, merge, Transform, TransformError,
};
