//! Fixed set of primitive groups a script may be handed
//!
//! Each entity role receives only the groups listed for it; a primitive whose
//! group is absent is simply not defined in the script's globals.

use std::collections::BTreeSet;

use hub_core::EntityType;

/// A group of sandbox primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// `metadata`, `definition`, `capability`, `command`, `fingerprint`,
    /// `preferences`, `section`, `input`, `page`
    Declare,
    /// `log.*` and `print`
    Log,
    /// `now`, `toDateTime`, `timeOffset`
    Clock,
    /// `parseJson`, `parseLanMessage`
    Parse,
    /// `httpGet`, `httpPost`
    Http,
    /// `runIn`, `schedule`, `unschedule`, `runEvery*`
    Schedule,
    /// `sendHubCommand`
    HubCommand,
    /// `sendEvent`, `createEvent`; a smart app's event without a device is an ISA event
    SendEvent,
    /// `updateDataValue`, `getDataValue`
    DeviceData,
    /// `getChildDevices`, `addChildDevice`
    ChildDevices,
    /// `subscribe`, `unsubscribe`
    Subscribe,
    /// `sendLocationEvent`
    LocationEvents,
    /// `getSunriseAndSunset`
    Sun,
    /// `createAccessToken`
    Tokens,
    /// `render`
    Render,
}

/// An immutable set of granted capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

const COMMON: &[Capability] = &[
    Capability::Declare,
    Capability::Log,
    Capability::Clock,
    Capability::Parse,
    Capability::Http,
    Capability::Schedule,
    Capability::HubCommand,
    Capability::ChildDevices,
];

impl CapabilitySet {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    /// Declaration-time primitives only
    pub fn definition() -> Self {
        Self::new([Capability::Declare, Capability::Log, Capability::Clock])
    }

    /// Device handler role
    pub fn device() -> Self {
        Self::new(
            COMMON
                .iter()
                .copied()
                .chain([Capability::SendEvent, Capability::DeviceData]),
        )
    }

    /// Smart app role
    pub fn smart_app() -> Self {
        Self::new(COMMON.iter().copied().chain([
            Capability::SendEvent,
            Capability::Subscribe,
            Capability::LocationEvents,
            Capability::Sun,
            Capability::Tokens,
            Capability::Render,
        ]))
    }

    pub fn for_entity(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Device => Self::device(),
            EntityType::SmartApp => Self::smart_app(),
        }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Copy of the set without one capability
    pub fn without(&self, capability: Capability) -> Self {
        let mut set = self.0.clone();
        set.remove(&capability);
        Self(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_differ() {
        let device = CapabilitySet::device();
        let app = CapabilitySet::smart_app();

        assert!(device.contains(Capability::DeviceData));
        assert!(!device.contains(Capability::Subscribe));
        assert!(app.contains(Capability::Subscribe));
        assert!(!app.contains(Capability::DeviceData));

        for shared in [Capability::SendEvent, Capability::Http, Capability::Schedule, Capability::Parse] {
            assert!(device.contains(shared) && app.contains(shared));
        }
    }

    #[test]
    fn test_definition_set_has_no_side_effects() {
        let set = CapabilitySet::definition();
        assert!(set.contains(Capability::Declare));
        assert!(!set.contains(Capability::Http));
        assert!(!set.contains(Capability::Schedule));
        assert!(!set.without(Capability::Declare).contains(Capability::Declare));
    }
}
