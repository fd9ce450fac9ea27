//! One-line import for SDK embedders.
//!
//! ```
//! use revi_sdk::prelude::*;
//! ```

pub use crate::{
    AbortToken, Config, Endpoint, ErrorCapture, IngestResponse, Item, ItemKind, NetworkCapture,
    Priority, Runtime, SdkError, Severity, StorageBackend, Supervisor, SyncConditions, SyncPhase,
    Transport,
};
