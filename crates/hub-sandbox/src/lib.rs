//! Hub Sandbox
//!
//! Runs device handler and smart app sources in isolated Lua VMs.
//!
//! A source is executed in one of two modes:
//!
//! - **Extraction**: only declaration primitives are live; the result is the
//!   [`hub_core::DriverDefinition`] the source declares.
//! - **Live invocation**: the whole source runs with the primitives its role
//!   grants, then one named global function is called. Side effects are not
//!   applied here; they come back as an ordered list of [`Effect`]s for the
//!   runtime to apply.

pub mod capability;
mod convert;
pub mod effects;
mod engine;
mod error;
mod handles;
pub mod host;
pub mod lan;
mod primitives;
pub mod settings;
pub mod sun;
mod traceback;

pub use capability::{Capability, CapabilitySet};
pub use effects::{Effect, EffectLog, ScheduleSpec};
pub use engine::{
    Invocation, InvocationContext, InvocationOutcome, SandboxConfig, SandboxEngine,
    DEFAULT_INSTRUCTION_BUDGET, DEFAULT_TIMEOUT,
};
pub use error::{SandboxError, SandboxResult};
pub use host::{
    ChildDeviceRequest, DeviceSnapshot, HttpMethod, HttpRequest, HttpResponse, LocationInfo,
    NullHost, SandboxHost,
};
pub use lan::{parse_lan_message, LanMessage};
pub use settings::{SettingsView, TypedValue};
pub use sun::{parse_offset, sunrise_sunset};
