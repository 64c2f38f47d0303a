//! # Coscribe Core
//!
//! The foundational layer of Coscribe - typed observer registration
//! and synchronization settings shared by every engine crate.

pub mod event;
pub mod settings;

pub use event::{Observers, Subscription};
pub use settings::SyncSettings;
