//! Core types for the hub entity runtime
//!
//! This crate provides the fundamental types shared by every other hub crate:
//! entities (devices and installed apps), driver definitions and their
//! fingerprints, state records, events, subscriptions, schedule jobs and the
//! protocol actions a driver can emit.

mod action;
mod app;
mod definition;
mod device;
mod entity;
mod event;
mod fingerprint;
mod schedule;
mod setting;
mod subscription;

pub use action::{Action, ActionDecodeError, HubAction, HubResponse, Protocol, Step};
pub use app::InstalledApp;
pub use definition::{Command, DefinitionKind, DriverDefinition, Preference};
pub use device::{identity_key, Device, IntegrationRef, StateRecord};
pub use entity::{EntityRef, EntityType};
pub use event::{Event, EventDraft, EventSource};
pub use fingerprint::{canonical_clusters, Fingerprint};
pub use schedule::{job_key, JobType, Schedule, ScheduleJob};
pub use setting::Setting;
pub use subscription::{Subscription, SubscriptionTarget};

/// Generate a new entity id (simple UUID, no dashes)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Well-known names used across crates
pub mod names {
    /// Name of the generic fallback driver used when no fingerprint matches
    pub const UNKNOWN_DRIVER: &str = "Unknown";

    /// Join name reported for devices resolved to the fallback driver
    pub const UNKNOWN_DEVICE_JOIN_NAME: &str = "Unknown Device";

    /// Driver method called for inbound protocol messages
    pub const PARSE_METHOD: &str = "parse";

    /// Lifecycle method names
    pub const INSTALLED: &str = "installed";
    pub const UPDATED: &str = "updated";
    pub const UNINSTALLED: &str = "uninstalled";
    pub const CONFIGURE: &str = "configure";
}
