//! Hub Entity Runtime
//!
//! Ties the hub crates together into the runtime that drives devices and
//! smart apps:
//!
//! - [`EntityRuntime`] - definition loading, sandboxed invocation of app and
//!   device methods, effect application, event routing and entity lifecycle
//! - [`SubscriptionDispatcher`] - subscriptions in registration order
//! - [`StateDiff`] - merging of app state changes
//! - [`ActionInterpreter`] - delay-aware dispatch of driver actions
//! - [`IntegrationRegistry`] - protocol integrations actions are sent through

mod actions;
mod dispatcher;
mod error;
mod host;
mod integration;
mod runtime;
mod state;

pub use actions::{ActionInterpreter, ActionTarget};
pub use dispatcher::SubscriptionDispatcher;
pub use error::{RuntimeError, RuntimeResult};
pub use host::RuntimeHost;
pub use integration::{Integration, IntegrationRegistry, VirtualIntegration, SENT_HISTORY};
pub use runtime::{
    DispatchReport, EntityRuntime, RuntimeComponents, RuntimeConfig, DEFAULT_HTTP_TIMEOUT,
};
pub use state::StateDiff;
