//! Deckhand Core - cluster-independent building blocks of the Deckhand operator
//!
//! This crate provides the foundational types used by the reconciler:
//! - `Manifest`: The rendered deployment manifest and its instance groups
//! - `names`: Naming scheme for versioned secrets
//! - `MeltdownWindow`: Debounce window for reconcile storms
//! - `ReconcilerConfig`: Tunables supplied by the host
//! - `Clock`: Time source, swappable in tests

pub mod clock;
pub mod config;
pub mod error;
pub mod manifest;
pub mod meltdown;
pub mod names;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReconcilerConfig, StoreConfig};
pub use error::{CoreError, Result};
pub use manifest::{InstanceGroup, Job, Manifest};
pub use meltdown::{LAST_RECONCILE_ANNOTATION, MeltdownWindow, set_last_reconcile};
pub use names::VersionPattern;
