//! Registries for the hub entity runtime
//!
//! Each registry is a lazily populated in-memory cache over a persistence
//! port. Population is idempotent (concurrent first readers race safely) and
//! every mutating operation updates the cache and writes through.
//!
//! - [`DriverRegistry`] - device handler and smart app definitions, the
//!   fingerprint index and capability projection
//! - [`DeviceRegistry`] - devices indexed by id, identity key and parent
//! - [`AppRegistry`] - installed app instances

mod apps;
mod capabilities;
mod devices;
mod drivers;
mod error;
mod fingerprint;

pub use apps::AppRegistry;
pub use capabilities::{AttributeSpec, CapabilityCatalog, CapabilityDefinition, CapabilityProjection};
pub use devices::DeviceRegistry;
pub use drivers::{DriverRegistry, UpsertOutcome};
pub use error::{RegistryError, RegistryResult};
pub use fingerprint::{score_fingerprint, FingerprintMatch, ACCEPT_THRESHOLD};
