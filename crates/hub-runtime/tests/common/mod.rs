//! Shared fixtures for runtime scenarios

#![allow(dead_code)]

use std::sync::Arc;

use chrono::FixedOffset;
use hub_core::{DefinitionKind, Device, DriverDefinition, Protocol};
use hub_event_bus::EventBus;
use hub_registries::{AppRegistry, CapabilityCatalog, DeviceRegistry, DriverRegistry};
use hub_runtime::{
    EntityRuntime, IntegrationRegistry, RuntimeComponents, RuntimeConfig, VirtualIntegration,
};
use hub_sandbox::SandboxEngine;
use hub_scheduler::{Scheduler, SystemClock};
use hub_storage::{MemoryEventStore, MemoryRepository, MemorySourceStore};

pub const SWITCH_DRIVER: &str = r#"
metadata(function()
    definition({name = "Virtual Switch", namespace = "hub", author = "Hub"}, function()
        capability "Switch"
        capability "Refresh"
        capability "Configuration"
        fingerprint({profileId = "0104", inClusters = "0000,0006", manufacturer = "Acme", model = "Lamp1", deviceJoinName = "Acme Lamp"})
    end)
end)

function installed()
    sendEvent({name = "switch", value = "off"})
end

function configure()
    return "zdo bind 0x" .. device.deviceNetworkId .. " 1 1 0x0006 {}"
end

function on()
    sendEvent({name = "switch", value = "on"})
end

function off()
    sendEvent({name = "switch", value = "off"})
end

function refresh()
    return {"st rattr 0x1 1 6 0", "delay 20", "st rattr 0x1 1 8 0"}
end

function parse(description)
    local value = string.match(description, "switch: (%a+)")
    if value then
        return createEvent({name = "switch", value = value})
    end
    return nil
end
"#;

pub const UNKNOWN_DRIVER: &str = r#"
definition({name = "Unknown", namespace = "hub", author = "Hub"})
"#;

/// Counts calls of `m1`, remembering the last event
pub const MIRROR_APP: &str = r#"
definition({name = "Mirror", namespace = "hub", author = "Hub"})

preferences(function()
    section("Devices", function()
        input("switches", "capability.switch", {multiple = true})
    end)
end)

function installed()
    subscribe(settings.switches, "switch", "m1")
end

function updated()
    unsubscribe()
    subscribe(settings.switches, "switch.on", "m1")
end

function m1(evt)
    state.calls = (state.calls or 0) + 1
    state.last = evt.value
    state.lastDevice = evt.deviceId
end

function arm()
    runIn(60, "turnOff")
end

function armMany()
    runIn(60, "turnOff", {overwrite = false})
end

function turnOff()
    for _, lamp in ipairs(settings.switches or {}) do
        lamp:off()
    end
end

function forget()
    state.last = nil
end
"#;

pub const BROKEN_APP: &str = r#"
definition({name = "Broken", namespace = "hub", author = "Hub"})

function m1(evt)
    error("handler exploded")
end
"#;

pub const PARENT_APP: &str = r#"
definition({name = "Parent", namespace = "hub", author = "Hub"})

function installed()
    local child = addChildDevice("hub", "Virtual Switch", "child-1", {label = "Porch"})
    state.childId = child.id
    state.childCount = #getChildDevices()
end
"#;

pub struct Hub {
    pub runtime: Arc<EntityRuntime>,
    pub zigbee: Arc<VirtualIntegration>,
    pub sources: Arc<MemorySourceStore>,
}

impl Hub {
    pub async fn definition(&self, kind: DefinitionKind, name: &str) -> Arc<DriverDefinition> {
        self.runtime
            .drivers()
            .find_by_name(kind, name)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{} not loaded", name))
    }

    /// A Virtual Switch on the test radio
    pub async fn lamp(&self, dni: &str) -> Arc<Device> {
        let driver = self
            .definition(DefinitionKind::DeviceHandler, "Virtual Switch")
            .await;
        self.runtime
            .devices()
            .create(Device::new(&driver.id, "Lamp", dni).with_integration("zb"))
            .await
            .unwrap()
    }
}

/// Runtime over in-memory ports with the given sources loaded
pub async fn hub(drivers: &[(&str, &str)], apps: &[(&str, &str)]) -> Hub {
    let sources = Arc::new(MemorySourceStore::new());
    for (id, text) in drivers {
        sources.insert(DefinitionKind::DeviceHandler, *id, *text);
    }
    for (id, text) in apps {
        sources.insert(DefinitionKind::SmartApp, *id, *text);
    }

    let integrations = Arc::new(IntegrationRegistry::new());
    let zigbee = Arc::new(VirtualIntegration::new("zb", vec![Protocol::Zigbee]));
    integrations.register(zigbee.clone());

    let catalog = Arc::new(CapabilityCatalog::builtin().unwrap());
    let components = RuntimeComponents {
        drivers: Arc::new(DriverRegistry::new(Arc::new(MemoryRepository::new()), catalog)),
        devices: Arc::new(DeviceRegistry::new(Arc::new(MemoryRepository::new()))),
        apps: Arc::new(AppRegistry::new(Arc::new(MemoryRepository::new()))),
        subscriptions: Arc::new(MemoryRepository::new()),
        scheduler: Arc::new(Scheduler::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(SystemClock),
            FixedOffset::east_opt(0).unwrap(),
        )),
        sources: sources.clone(),
        events: Arc::new(MemoryEventStore::new(100)),
        bus: Arc::new(EventBus::new()),
        sandbox: SandboxEngine::default(),
        integrations,
    };

    let runtime = EntityRuntime::new(components, RuntimeConfig::default());
    runtime.initialize().await.unwrap();
    Hub {
        runtime,
        zigbee,
        sources,
    }
}
