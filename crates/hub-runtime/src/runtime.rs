//! The entity runtime
//!
//! Owns no state of its own beyond caches. Every component is built by the
//! host process and handed in through [`RuntimeComponents`]; the runtime wires
//! event ingress, subscription dispatch, sandboxed invocation, state
//! reconciliation, scheduling and action dispatch together.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use hub_core::{
    names, Action, DefinitionKind, Device, DriverDefinition, EntityRef, EntityType, Event,
    EventDraft, EventSource, InstalledApp, ScheduleJob, Setting, StateRecord, Subscription,
    SubscriptionTarget,
};
use hub_event_bus::EventBus;
use hub_registries::{AppRegistry, DeviceRegistry, DriverRegistry, FingerprintMatch, RegistryError};
use hub_sandbox::{
    ChildDeviceRequest, DeviceSnapshot, Effect, Invocation, InvocationContext, InvocationOutcome,
    LocationInfo, SandboxEngine, SandboxHost, ScheduleSpec,
};
use hub_scheduler::{JobError, JobOptions, JobRunner, Recurrence, Scheduler};
use hub_storage::{EventStore, Repository, SourceStore};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::actions::{ActionInterpreter, ActionTarget};
use crate::dispatcher::SubscriptionDispatcher;
use crate::error::{RuntimeError, RuntimeResult};
use crate::host::RuntimeHost;
use crate::integration::IntegrationRegistry;
use crate::state::StateDiff;

/// Default bound on outbound script HTTP requests
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime settings taken from the hub configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub location: LocationInfo,
    /// Name of the generic device handler used when no fingerprint matches
    pub fallback_driver: String,
    pub http_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            location: LocationInfo::default(),
            fallback_driver: names::UNKNOWN_DRIVER.to_string(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

/// Everything the runtime is built from
pub struct RuntimeComponents {
    pub drivers: Arc<DriverRegistry>,
    pub devices: Arc<DeviceRegistry>,
    pub apps: Arc<AppRegistry>,
    pub subscriptions: Arc<dyn Repository<Subscription>>,
    pub scheduler: Arc<Scheduler>,
    pub sources: Arc<dyn SourceStore>,
    pub events: Arc<dyn EventStore>,
    pub bus: Arc<EventBus>,
    pub sandbox: SandboxEngine,
    pub integrations: Arc<IntegrationRegistry>,
}

/// What happened to one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recorded in the event store and applied to device state
    pub persisted: bool,
    /// Handlers that completed
    pub dispatched: usize,
    /// Handlers that raised, timed out or could not be found
    pub failed: usize,
}

pub struct EntityRuntime {
    drivers: Arc<DriverRegistry>,
    devices: Arc<DeviceRegistry>,
    apps: Arc<AppRegistry>,
    subscriptions: SubscriptionDispatcher,
    scheduler: Arc<Scheduler>,
    sources: Arc<dyn SourceStore>,
    events: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    sandbox: SandboxEngine,
    integrations: Arc<IntegrationRegistry>,
    actions: ActionInterpreter,
    host: Arc<dyn SandboxHost>,
    config: RuntimeConfig,
    /// Source text by (kind, source id)
    source_cache: DashMap<(DefinitionKind, String), Arc<str>>,
    /// Latest value of each location attribute, for the state-change flag
    location_states: DashMap<String, StateRecord>,
    self_ref: Weak<EntityRuntime>,
}

impl EntityRuntime {
    pub fn new(components: RuntimeComponents, config: RuntimeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<EntityRuntime>| Self {
            drivers: components.drivers,
            devices: components.devices,
            apps: components.apps,
            subscriptions: SubscriptionDispatcher::new(components.subscriptions),
            scheduler: components.scheduler,
            sources: components.sources,
            events: components.events,
            bus: components.bus,
            sandbox: components.sandbox,
            actions: ActionInterpreter::new(components.integrations.clone()),
            integrations: components.integrations,
            host: Arc::new(RuntimeHost::new(weak.clone(), config.http_timeout)),
            config,
            source_cache: DashMap::new(),
            location_states: DashMap::new(),
            self_ref: weak.clone(),
        })
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn apps(&self) -> &Arc<AppRegistry> {
        &self.apps
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn subscriptions(&self) -> &SubscriptionDispatcher {
        &self.subscriptions
    }

    pub fn integrations(&self) -> &Arc<IntegrationRegistry> {
        &self.integrations
    }

    pub fn location(&self) -> &LocationInfo {
        &self.config.location
    }

    // ---- startup and shutdown ----

    /// Load every definition source, reload schedule jobs and start firing
    ///
    /// A source that fails to load is logged and skipped. Returns the number
    /// of definitions loaded.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> RuntimeResult<usize> {
        let mut loaded = 0;
        for kind in [DefinitionKind::DeviceHandler, DefinitionKind::SmartApp] {
            for source_id in self.sources.list(kind).await? {
                match self.reload_definition(kind, &source_id).await {
                    Ok(_) => loaded += 1,
                    Err(e) => error!(%kind, source_id = %source_id, error = %e, "Failed to load definition"),
                }
            }
        }

        let jobs = self.scheduler.initialize().await?;
        let runner: Arc<dyn JobRunner> = self
            .self_ref
            .upgrade()
            .ok_or(RuntimeError::ShuttingDown)?;
        self.scheduler.start(runner);

        info!(definitions = loaded, jobs, "Entity runtime initialized");
        Ok(loaded)
    }

    /// Stop the scheduler, then flush every store
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        info!("Shutting down entity runtime");
        self.scheduler.shutdown().await?;
        self.drivers.flush().await?;
        self.devices.flush().await?;
        self.apps.flush().await?;
        self.subscriptions.flush().await?;
        self.events.flush().await?;
        info!("Entity runtime stopped");
        Ok(())
    }

    // ---- definitions ----

    /// Re-extract one source and register its definition, keeping its id
    #[instrument(skip(self))]
    pub async fn reload_definition(
        &self,
        kind: DefinitionKind,
        source_id: &str,
    ) -> RuntimeResult<Arc<DriverDefinition>> {
        let text = self
            .sources
            .source(kind, source_id)
            .await?
            .ok_or_else(|| RuntimeError::SourceNotFound {
                kind,
                source_id: source_id.to_string(),
            })?;
        let text: Arc<str> = Arc::from(text);
        let definition = self
            .sandbox
            .extract_definition(kind, source_id, text.clone())
            .await?;
        self.source_cache
            .insert((kind, source_id.to_string()), text);
        let (definition, outcome) = self.drivers.upsert(definition).await?;
        debug!(id = %definition.id, ?outcome, "Definition processed");
        Ok(definition)
    }

    /// Remove a definition nobody uses
    pub async fn delete_definition(&self, id: &str) -> RuntimeResult<bool> {
        let definition = self.drivers.require(id).await?;
        let mut dependents = self.devices.using_definition(id).await?;
        dependents.extend(self.apps.using_definition(id).await?);
        if !dependents.is_empty() {
            return Err(RegistryError::EntityInUse {
                kind: "definition",
                id: id.to_string(),
                dependents,
            }
            .into());
        }
        self.source_cache
            .remove(&(definition.kind, definition.source_id.clone()));
        Ok(self.drivers.delete(id).await?)
    }

    async fn source_of(&self, definition: &DriverDefinition) -> RuntimeResult<Arc<str>> {
        let key = (definition.kind, definition.source_id.clone());
        if let Some(text) = self.source_cache.get(&key) {
            return Ok(text.clone());
        }
        let text: Arc<str> = self
            .sources
            .source(definition.kind, &definition.source_id)
            .await?
            .ok_or_else(|| RuntimeError::SourceNotFound {
                kind: definition.kind,
                source_id: definition.source_id.clone(),
            })?
            .into();
        self.source_cache.insert(key, text.clone());
        Ok(text)
    }

    /// Resolve announced device attributes to a device handler
    pub async fn get_device_handler_by_fingerprint(
        &self,
        device_info: &HashMap<String, String>,
    ) -> RuntimeResult<Option<FingerprintMatch>> {
        Ok(self
            .drivers
            .resolve_fingerprint(device_info, &self.config.fallback_driver)
            .await?)
    }

    // ---- invocation ----

    async fn invoke(
        &self,
        definition: &DriverDefinition,
        method: &str,
        args: Vec<Value>,
        context: InvocationContext,
    ) -> RuntimeResult<Invocation> {
        let source = self.source_of(definition).await?;
        Ok(self
            .sandbox
            .invoke(&definition.source_id, source, method, args, context)
            .await?)
    }

    /// Run a smart app method; `None` when the app defines no such method
    ///
    /// State changes made by the method are merged into the stored state as a
    /// diff, then its effects are applied in order.
    #[instrument(skip(self, args))]
    pub async fn run_smart_app_method(
        &self,
        app_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> RuntimeResult<Option<Value>> {
        let app = self.apps.require(app_id).await?;
        let definition = self.drivers.require(&app.definition_id).await?;

        let entity = EntityRef::app(app_id);
        let mut context = InvocationContext::new(entity.clone(), self.host.clone());
        context.settings = app.settings.clone();
        context.state = Some(app.state.clone());
        context.app_label = Some(app.label.clone());
        context.location = self.config.location.clone();

        let outcome = match self.invoke(&definition, method, args, context).await? {
            Invocation::MethodMissing => {
                debug!(app_id, method, "Handler missing, nothing to run");
                return Ok(None);
            }
            Invocation::Returned(outcome) => outcome,
        };

        let InvocationOutcome {
            value,
            effects,
            state,
        } = outcome;
        if let Some(after) = state {
            self.reconcile_state(&app, &after).await?;
        }
        self.apply_effects(&entity, effects).await;
        Ok(Some(value))
    }

    async fn reconcile_state(&self, before: &InstalledApp, after: &Map<String, Value>) -> RuntimeResult<()> {
        let diff = StateDiff::compute(&before.state, after);
        if diff.is_empty() {
            return Ok(());
        }
        debug!(
            app_id = %before.id,
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "Merging app state"
        );
        self.apps
            .update_with(&before.id, |app| diff.apply(&mut app.state))
            .await?;
        Ok(())
    }

    async fn device_context(&self, device: &Device) -> RuntimeResult<InvocationContext> {
        let mut context = InvocationContext::new(EntityRef::device(&device.id), self.host.clone());
        context.settings = device.settings.clone();
        context.device = Some(self.snapshot(device).await?);
        context.location = self.config.location.clone();
        Ok(context)
    }

    /// Run a device method and apply its effects, without interpreting the value
    async fn invoke_device(
        &self,
        device: &Device,
        method: &str,
        args: Vec<Value>,
    ) -> RuntimeResult<Option<Value>> {
        let definition = self.drivers.require(&device.definition_id).await?;
        let context = self.device_context(device).await?;
        match self.invoke(&definition, method, args, context).await? {
            Invocation::MethodMissing => {
                debug!(device_id = %device.id, method, "Handler missing, nothing to run");
                Ok(None)
            }
            Invocation::Returned(outcome) => {
                self.apply_effects(&EntityRef::device(&device.id), outcome.effects)
                    .await;
                Ok(Some(outcome.value))
            }
        }
    }

    /// Run a device method and dispatch the action it returns
    #[instrument(skip(self, args))]
    pub async fn run_device_method(
        &self,
        device_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> RuntimeResult<Option<Value>> {
        let device = self.devices.require(device_id).await?;
        let value = self.invoke_device(&device, method, args).await?;
        if let Some(value) = &value {
            self.dispatch_returned(&device, value).await;
        }
        Ok(value)
    }

    /// Run a command the device's handler supports
    pub async fn run_device_command(
        &self,
        device_id: &str,
        command: &str,
        args: Vec<Value>,
    ) -> RuntimeResult<Option<Value>> {
        let device = self.devices.require(device_id).await?;
        let projection = self.drivers.projection(&device.definition_id).await?;
        if !projection.has_command(command) {
            return Err(RuntimeError::IllegalArgument(format!(
                "device {} does not support command '{}'",
                device.display_name(),
                command
            )));
        }
        self.run_device_method(device_id, command, args).await
    }

    fn action_target(device: &Device) -> ActionTarget {
        ActionTarget {
            integration_id: device.integration_id().map(str::to_string),
            device_network_id: Some(device.device_network_id.clone()),
        }
    }

    async fn dispatch_returned(&self, device: &Device, value: &Value) {
        match Action::decode(value) {
            Ok(Some(action)) => {
                // Continuations of delayed sequences run on their own
                let _ = self.actions.dispatch(&Self::action_target(device), action).await;
            }
            Ok(None) => {}
            Err(e) => warn!(device_id = %device.id, error = %e, "Unhandled return value"),
        }
    }

    // ---- effects ----

    /// Apply deferred effects in order; a failing effect is logged and skipped
    pub fn apply_effects<'a>(
        &'a self,
        entity: &'a EntityRef,
        effects: Vec<Effect>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for effect in effects {
                let kind = effect_name(&effect);
                if let Err(e) = self.apply_effect(entity, effect).await {
                    warn!(entity = %entity, effect = kind, error = %e, "Effect failed");
                }
            }
        })
    }

    async fn apply_effect(&self, entity: &EntityRef, effect: Effect) -> RuntimeResult<()> {
        let entity_id = entity.entity_id.as_str();
        match effect {
            Effect::SendEvent { device_id, draft } => {
                match (device_id, entity.entity_type) {
                    (Some(device_id), _) => {
                        self.send_device_event(&device_id, draft).await?;
                    }
                    (None, EntityType::Device) => {
                        self.send_device_event(entity_id, draft).await?;
                    }
                    (None, EntityType::SmartApp) => {
                        let event = Event::new(draft, EventSource::Isa, entity_id, None);
                        self.on_event(event).await?;
                    }
                }
            }
            Effect::SendLocationEvent(draft) => {
                self.send_location_event(draft).await?;
            }
            Effect::Subscribe {
                target,
                attribute_filter,
                handler,
                filter_events,
            } => {
                let subscription = Subscription::new(target, attribute_filter, handler, entity_id)
                    .with_filter_events(filter_events);
                self.subscriptions.add(subscription).await?;
            }
            Effect::Unsubscribe {
                device_ids,
                handler,
            } => {
                self.subscriptions
                    .unsubscribe(entity_id, &device_ids, handler.as_deref())
                    .await?;
            }
            Effect::RunIn {
                delay,
                handler,
                overwrite,
                data,
            } => {
                self.scheduler
                    .run_once(
                        delay,
                        entity.entity_type,
                        entity_id,
                        &handler,
                        JobOptions { overwrite, data },
                    )
                    .await?;
            }
            Effect::Schedule {
                schedule,
                handler,
                overwrite,
                data,
            } => {
                let recurrence = match schedule {
                    ScheduleSpec::Expression(expression) => Recurrence::Expression(expression),
                    ScheduleSpec::Timestamp(millis) => Recurrence::Timestamp(millis),
                };
                self.scheduler
                    .schedule_every(
                        &recurrence,
                        entity.entity_type,
                        entity_id,
                        &handler,
                        JobOptions { overwrite, data },
                    )
                    .await?;
            }
            Effect::Unschedule { handler } => {
                self.scheduler
                    .unschedule(entity.entity_type, entity_id, handler.as_deref())
                    .await?;
            }
            Effect::InvokeCommand {
                device_id,
                command,
                args,
            } => {
                self.run_device_command(&device_id, &command, args).await?;
            }
            Effect::SendHubCommand(action) => {
                let target = match entity.entity_type {
                    EntityType::Device => Self::action_target(&*self.devices.require(entity_id).await?),
                    EntityType::SmartApp => ActionTarget::default(),
                };
                let _ = self.actions.dispatch(&target, action).await;
            }
            Effect::UpdateDataValue { name, value } => {
                if entity.entity_type != EntityType::Device {
                    return Err(RuntimeError::IllegalArgument(
                        "updateDataValue is only available to devices".to_string(),
                    ));
                }
                self.devices
                    .update_with(entity_id, |device| {
                        device.data.insert(name, value);
                    })
                    .await?;
            }
        }
        Ok(())
    }

    // ---- events ----

    /// Stamp and route an event emitted for a device
    pub async fn send_device_event(
        &self,
        device_id: &str,
        draft: EventDraft,
    ) -> RuntimeResult<DispatchReport> {
        let device = self.devices.require(device_id).await?;
        let prior = device.current_states.get(&draft.name);
        let event = Event::new(draft, EventSource::Device, device_id, prior);
        self.on_event(event).await
    }

    /// Stamp and route an event about the hub's location
    pub async fn send_location_event(&self, draft: EventDraft) -> RuntimeResult<DispatchReport> {
        let prior = self.location_states.get(&draft.name).map(|r| r.clone());
        let event = Event::new(
            draft,
            EventSource::Hub,
            self.config.location.id.clone(),
            prior.as_ref(),
        );
        self.on_event(event).await
    }

    /// Route one event
    ///
    /// The event is broadcast to live listeners first. It is persisted and
    /// applied to device state when any subscription matches it or when it
    /// changes state. Matching handlers whose `filterEvents` flag lets the
    /// event through then run one after another in registration order; a
    /// failing handler does not stop the next one.
    #[instrument(skip(self, event), fields(event = %event.name, source_id = %event.source_id))]
    pub async fn on_event(&self, event: Event) -> RuntimeResult<DispatchReport> {
        self.bus.fire(&event);

        let matching = self.subscriptions.matching(&event).await?;
        let mut report = DispatchReport {
            persisted: !matching.is_empty() || event.is_state_change(),
            ..Default::default()
        };
        if !report.persisted {
            debug!(value = %event.value, "Event dropped");
            return Ok(report);
        }

        self.events.append(event.clone()).await?;
        match event.source {
            EventSource::Device => {
                self.devices.apply_event(&event).await?;
            }
            EventSource::Hub => {
                self.location_states
                    .insert(event.name.clone(), event.to_state_record());
            }
            EventSource::Isa => {}
        }

        let payload = event_payload(&event);
        let queued = matching.into_iter().filter(|s| s.accepts(&event));
        for subscription in queued {
            let result = self
                .run_smart_app_method(
                    &subscription.subscribed_app_id,
                    &subscription.handler_method,
                    vec![payload.clone()],
                )
                .await;
            match result {
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        app_id = %subscription.subscribed_app_id,
                        handler = %subscription.handler_method,
                        error = %e,
                        "Subscription handler failed"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Recent persisted events of a source, newest first
    pub async fn events_since(
        &self,
        source: EventSource,
        source_id: &str,
        since: Option<DateTime<Utc>>,
        max: usize,
    ) -> RuntimeResult<Vec<Event>> {
        Ok(self.events.since(source, source_id, since, max).await?)
    }

    /// Live tap on every event, persisted or not
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe_all()
    }

    /// Register a device subscription for an installed app
    pub async fn add_device_subscription(
        &self,
        app_id: &str,
        device_id: &str,
        attribute_filter: Option<&str>,
        handler_method: &str,
        filter_events: bool,
    ) -> RuntimeResult<bool> {
        self.apps.require(app_id).await?;
        self.devices.require(device_id).await?;
        let subscription = Subscription::new(
            SubscriptionTarget::Device(device_id.to_string()),
            attribute_filter.map(str::to_string),
            handler_method,
            app_id,
        )
        .with_filter_events(filter_events);
        self.subscriptions.add(subscription).await
    }

    // ---- inbound traffic and joins ----

    /// Run the driver's `parse` on an inbound protocol message
    ///
    /// Event maps in the result are sent as device events; anything else is
    /// interpreted as actions.
    #[instrument(skip(self, description))]
    pub async fn handle_device_message(
        &self,
        integration_id: Option<&str>,
        device_network_id: &str,
        description: &str,
    ) -> RuntimeResult<Vec<DispatchReport>> {
        let Some(device) = self
            .devices
            .get_by_network_id(integration_id, device_network_id)
            .await?
        else {
            warn!(
                integration_id = integration_id.unwrap_or("null"),
                device_network_id, "Message for unknown device"
            );
            return Ok(Vec::new());
        };

        let Some(value) = self
            .invoke_device(
                &device,
                names::PARSE_METHOD,
                vec![Value::String(description.to_string())],
            )
            .await?
        else {
            return Ok(Vec::new());
        };

        let (drafts, rest) = split_parse_result(value);
        let mut reports = Vec::with_capacity(drafts.len());
        for draft in drafts {
            reports.push(self.send_device_event(&device.id, draft).await?);
        }
        if let Some(rest) = rest {
            self.dispatch_returned(&device, &rest).await;
        }
        Ok(reports)
    }

    /// Register a joining device, or return the one already known
    ///
    /// New devices get the best-matching handler, then run `installed` and
    /// `configure`.
    #[instrument(skip(self, device_info))]
    pub async fn join_device(
        &self,
        integration_id: &str,
        device_network_id: &str,
        device_info: &HashMap<String, String>,
    ) -> RuntimeResult<Arc<Device>> {
        if let Some(existing) = self
            .devices
            .get_by_network_id(Some(integration_id), device_network_id)
            .await?
        {
            debug!(device_id = %existing.id, "Device already joined");
            return Ok(existing);
        }

        let matched = self
            .get_device_handler_by_fingerprint(device_info)
            .await?
            .ok_or_else(|| RuntimeError::UnknownDeviceType {
                namespace: String::new(),
                type_name: self.config.fallback_driver.clone(),
            })?;
        let definition = self.drivers.require(&matched.definition_id).await?;

        let device = Device::new(&definition.id, &definition.name, device_network_id)
            .with_integration(integration_id)
            .with_label(&matched.join_name);
        let device = self.devices.create(device).await?;
        info!(
            device_id = %device.id,
            driver = %definition.name,
            score = ?matched.score,
            "Device joined"
        );

        for method in [names::INSTALLED, names::CONFIGURE] {
            if let Err(e) = self.run_device_method(&device.id, method, Vec::new()).await {
                warn!(device_id = %device.id, method, error = %e, "Lifecycle method failed");
            }
        }
        Ok(self.devices.require(&device.id).await?)
    }

    // ---- devices ----

    async fn snapshot(&self, device: &Device) -> RuntimeResult<DeviceSnapshot> {
        let projection = self.drivers.projection(&device.definition_id).await?;
        Ok(DeviceSnapshot::from_device(
            device,
            projection.capabilities.clone(),
            projection.commands.iter().map(|c| c.name.clone()).collect(),
        ))
    }

    pub async fn device_snapshot(&self, device_id: &str) -> RuntimeResult<Option<DeviceSnapshot>> {
        match self.devices.get(device_id).await? {
            Some(device) => Ok(Some(self.snapshot(&device).await?)),
            None => Ok(None),
        }
    }

    pub async fn child_snapshots(&self, parent: &EntityRef) -> RuntimeResult<Vec<DeviceSnapshot>> {
        let mut snapshots = Vec::new();
        for child in self.devices.children_of(parent).await? {
            snapshots.push(self.snapshot(&child).await?);
        }
        Ok(snapshots)
    }

    /// Create a child device of an app or device
    ///
    /// Children of a device share its integration. The child's `installed`
    /// runs on its own task once the device exists.
    pub async fn add_child_device(
        &self,
        parent: &EntityRef,
        request: ChildDeviceRequest,
    ) -> RuntimeResult<Arc<Device>> {
        let definition = self
            .drivers
            .find_by_type(DefinitionKind::DeviceHandler, &request.namespace, &request.type_name)
            .await?
            .ok_or_else(|| RuntimeError::UnknownDeviceType {
                namespace: request.namespace.clone(),
                type_name: request.type_name.clone(),
            })?;

        let dni = request.device_network_id.trim();
        if dni.is_empty() {
            return Err(RuntimeError::IllegalArgument(
                "device network id must not be empty".to_string(),
            ));
        }

        let integration = match parent.entity_type {
            EntityType::Device => self
                .devices
                .require(&parent.entity_id)
                .await?
                .integration
                .clone(),
            EntityType::SmartApp => {
                self.apps.require(&parent.entity_id).await?;
                None
            }
        };
        let integration_id = integration.as_ref().map(|i| i.id.as_str());
        if self
            .devices
            .get_by_network_id(integration_id, dni)
            .await?
            .is_some()
        {
            return Err(RuntimeError::IllegalArgument(format!(
                "device network id {} is already in use",
                dni
            )));
        }

        let mut device = Device::new(
            &definition.id,
            request.name.as_deref().unwrap_or(&definition.name),
            dni,
        )
        .with_parent(parent);
        device.label = request.label.clone();
        device.integration = integration;
        device.data = request.data;
        let device = self.devices.create(device).await?;
        info!(device_id = %device.id, parent = %parent, driver = %definition.name, "Child device added");

        if let Some(runtime) = self.self_ref.upgrade() {
            let child_id = device.id.clone();
            tokio::spawn(async move {
                if let Err(e) = runtime
                    .run_device_method(&child_id, names::INSTALLED, Vec::new())
                    .await
                {
                    warn!(device_id = %child_id, error = %e, "Child device install failed");
                }
            });
        }
        Ok(device)
    }

    /// Delete a device and its descendants with their subscriptions,
    /// schedule jobs and events
    pub async fn delete_device(&self, device_id: &str) -> RuntimeResult<bool> {
        if self.devices.get(device_id).await?.is_none() {
            return Ok(false);
        }
        let mut doomed = vec![device_id.to_string()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let parent = EntityRef::device(&doomed[cursor]);
            for child in self.devices.children_of(&parent).await? {
                doomed.push(child.id.clone());
            }
            cursor += 1;
        }
        // Children first
        for id in doomed.iter().rev() {
            self.remove_device(id).await?;
        }
        Ok(true)
    }

    async fn remove_device(&self, device_id: &str) -> RuntimeResult<()> {
        let subscriptions = self.subscriptions.remove_for_device(device_id).await?;
        let jobs = self
            .scheduler
            .unschedule(EntityType::Device, device_id, None)
            .await?;
        self.events.purge(EventSource::Device, device_id).await?;
        self.devices.delete(device_id).await?;
        debug!(device_id, subscriptions, jobs, "Device removed");
        Ok(())
    }

    // ---- installed apps ----

    /// Create an installed app and run its `installed`
    #[instrument(skip(self, settings))]
    pub async fn install_app(
        &self,
        definition_id: &str,
        label: &str,
        settings: Vec<Setting>,
    ) -> RuntimeResult<Arc<InstalledApp>> {
        let definition = self.drivers.require(definition_id).await?;
        if definition.kind != DefinitionKind::SmartApp {
            return Err(RuntimeError::IllegalArgument(format!(
                "{} is not a smart app",
                definition.name
            )));
        }
        let app = self
            .apps
            .create(InstalledApp::new(definition_id, label).with_settings(settings))
            .await?;
        info!(app_id = %app.id, app = %definition.name, "App installed");

        self.run_smart_app_method(&app.id, names::INSTALLED, Vec::new())
            .await?;
        Ok(self
            .apps
            .update_with(&app.id, |app| app.installed = true)
            .await?)
    }

    /// Replace an installed app's settings and run its `updated`
    pub async fn update_app_settings(
        &self,
        app_id: &str,
        settings: Vec<Setting>,
    ) -> RuntimeResult<Arc<InstalledApp>> {
        self.apps
            .update_with(app_id, |app| app.settings = settings)
            .await?;
        self.run_smart_app_method(app_id, names::UPDATED, Vec::new())
            .await?;
        Ok(self.apps.require(app_id).await?)
    }

    /// Run `uninstalled`, then remove the app with its subscriptions,
    /// schedule jobs and child devices
    pub async fn uninstall_app(&self, app_id: &str) -> RuntimeResult<bool> {
        if self.apps.get(app_id).await?.is_none() {
            return Ok(false);
        }
        if let Err(e) = self
            .run_smart_app_method(app_id, names::UNINSTALLED, Vec::new())
            .await
        {
            warn!(app_id, error = %e, "uninstalled failed; removing anyway");
        }

        self.subscriptions.unsubscribe(app_id, &[], None).await?;
        self.scheduler
            .unschedule(EntityType::SmartApp, app_id, None)
            .await?;
        for child in self.devices.children_of(&EntityRef::app(app_id)).await? {
            self.delete_device(&child.id).await?;
        }
        self.events.purge(EventSource::Isa, app_id).await?;
        let removed = self.apps.delete(app_id).await?;
        info!(app_id, "App uninstalled");
        Ok(removed)
    }
}

#[async_trait]
impl JobRunner for EntityRuntime {
    async fn run_job(&self, job: &ScheduleJob) -> Result<(), JobError> {
        let args = if job.data.is_null() {
            Vec::new()
        } else {
            vec![job.data.clone()]
        };
        match job.entity_type {
            EntityType::SmartApp => {
                self.run_smart_app_method(&job.entity_id, &job.handler_method, args)
                    .await?;
            }
            EntityType::Device => {
                self.run_device_method(&job.entity_id, &job.handler_method, args)
                    .await?;
            }
        }
        Ok(())
    }
}

fn effect_name(effect: &Effect) -> &'static str {
    match effect {
        Effect::SendEvent { .. } => "sendEvent",
        Effect::SendLocationEvent(_) => "sendLocationEvent",
        Effect::Subscribe { .. } => "subscribe",
        Effect::Unsubscribe { .. } => "unsubscribe",
        Effect::RunIn { .. } => "runIn",
        Effect::Schedule { .. } => "schedule",
        Effect::Unschedule { .. } => "unschedule",
        Effect::InvokeCommand { .. } => "invokeCommand",
        Effect::SendHubCommand(_) => "sendHubCommand",
        Effect::UpdateDataValue { .. } => "updateDataValue",
    }
}

/// The event as handed to subscription handlers
fn event_payload(event: &Event) -> Value {
    let mut payload = match serde_json::to_value(event) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let id_key = match event.source {
        EventSource::Device => "deviceId",
        EventSource::Hub => "locationId",
        EventSource::Isa => "installedAppId",
    };
    payload.insert(id_key.to_string(), Value::String(event.source_id.clone()));
    Value::Object(payload)
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// An event map returned from `parse`, if `value` is one
fn draft_from_map(value: &Value) -> Option<EventDraft> {
    let map = value.as_object()?;
    let name = map.get("name")?.as_str()?;
    let mut draft = EventDraft::new(name, map.get("value").map(scalar_string).unwrap_or_default());
    draft.unit = map.get("unit").and_then(Value::as_str).map(str::to_string);
    draft.description_text = map
        .get("descriptionText")
        .and_then(Value::as_str)
        .map(str::to_string);
    draft.data = map.get("data").cloned().unwrap_or(Value::Null);
    draft.is_state_change = map.get("isStateChange").and_then(Value::as_bool);
    Some(draft)
}

/// Split a `parse` result into event drafts and whatever is left to decode
/// as actions
fn split_parse_result(value: Value) -> (Vec<EventDraft>, Option<Value>) {
    match value {
        Value::Array(items) => {
            let mut drafts = Vec::new();
            let mut rest = Vec::new();
            for item in items {
                match draft_from_map(&item) {
                    Some(draft) => drafts.push(draft),
                    None => rest.push(item),
                }
            }
            let rest = (!rest.is_empty()).then_some(Value::Array(rest));
            (drafts, rest)
        }
        other => match draft_from_map(&other) {
            Some(draft) => (vec![draft], None),
            None => (Vec::new(), Some(other)),
        },
    }
}
