//! # tandem-collab: document sessions for collaborative text editing
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► Curator ──(auth)──► Authenticator
//!               │
//!               │ find or create
//!               ▼
//!          ┌─────────┐  read / flush  ┌───────┐
//!          │ Binder  │ ─────────────► │ Store │
//!          │ (actor) │                └───────┘
//!          └────┬────┘
//!               │ subscribe
//!               ▼
//!          Portal per session ◄──── corrected transforms, presence updates
//! ```
//!
//! ## Modules
//!
//! - [`binder`]: per-document actor owning the [`OtBuffer`](tandem_text::OtBuffer)
//! - [`portal`]: per-session handle into a binder
//! - [`curator`]: registry of open binders
//! - [`store`]: memory, file and RocksDB document stores
//! - [`auth`]: access levels and authenticators
//! - [`audit`]: compressed transform history

pub mod audit;
pub mod auth;
pub mod binder;
pub mod curator;
pub mod portal;
pub mod store;

pub use audit::{AuditError, AuditLog, Auditor, CompressedAuditor};
pub use auth::{AccessLevel, Anarchy, AuthConfig, AuthType, Authenticator, TokenTable};
pub use binder::{Binder, BinderConfig, BinderError, BinderShutdown};
pub use curator::{Curator, CuratorConfig, CuratorError};
pub use portal::{ClientInfo, ClientUpdate, Message, Portal, PortalEvent};
pub use store::{
    Document, DocumentMetadata, FileStore, MemoryStore, RocksStore, Store, StoreConfig,
    StoreError, StoreType,
};
