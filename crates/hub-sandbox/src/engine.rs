//! Sandbox execution engine
//!
//! Every call builds a fresh Lua VM with the safe standard library only,
//! installs the primitive groups granted to the caller, runs the whole source
//! and then (in live mode) calls one global function by name.
//!
//! Execution is bounded twice: an instruction hook aborts the VM once the
//! wall-clock deadline passes or the instruction budget is spent, and the
//! async wrapper gives up waiting shortly after the deadline.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hub_core::{DefinitionKind, DriverDefinition, EntityRef, Setting};
use mlua::{Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Value, VmState};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, instrument, warn};

use crate::capability::{Capability, CapabilitySet};
use crate::convert::{json_to_lua, lua_to_json, lua_to_object, map_to_table};
use crate::effects::{Effect, EffectLog};
use crate::error::{SandboxError, SandboxResult};
use crate::host::{DeviceSnapshot, LocationInfo, NullHost, SandboxHost};
use crate::primitives::{self, declaration::DefinitionBuilder, Session};
use crate::settings::SettingsView;
use crate::traceback;

/// Default wall-clock bound of one invocation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default VM instruction cap of one invocation
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 50_000_000;

/// Instructions between limit checks
const HOOK_INTERVAL: u32 = 10_000;

/// Extra time the async side waits for the VM to notice its deadline
const JOIN_GRACE: Duration = Duration::from_millis(500);

/// Globals removed from the base library
const UNSAFE_GLOBALS: &[&str] = &["load", "loadfile", "dofile", "require", "collectgarbage"];

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub instruction_budget: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }
}

/// Everything a live invocation may see
#[derive(Clone)]
pub struct InvocationContext {
    pub entity: EntityRef,
    pub capabilities: CapabilitySet,
    pub settings: Vec<Setting>,
    /// App state; exposed as `state`/`atomicState` and returned after the call
    pub state: Option<Map<String, JsonValue>>,
    /// The device itself, exposed as `device`
    pub device: Option<DeviceSnapshot>,
    /// Installed app label, exposed as `app.label`
    pub app_label: Option<String>,
    pub location: LocationInfo,
    pub host: Arc<dyn SandboxHost>,
}

impl InvocationContext {
    pub fn new(entity: EntityRef, host: Arc<dyn SandboxHost>) -> Self {
        Self {
            capabilities: CapabilitySet::for_entity(entity.entity_type),
            entity,
            settings: Vec::new(),
            state: None,
            device: None,
            app_label: None,
            location: LocationInfo::default(),
            host,
        }
    }
}

/// Result of a live call that found its method
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    /// Return value, stripped to JSON
    pub value: JsonValue,
    /// Deferred side effects in call order
    pub effects: Vec<Effect>,
    /// App state after the call
    pub state: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Returned(InvocationOutcome),
    /// The source defines no global function with the requested name
    MethodMissing,
}

/// Which interrupt, if any, stopped the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Budget,
}

#[derive(Debug, Clone, Default)]
pub struct SandboxEngine {
    config: SandboxConfig,
}

impl SandboxEngine {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run a source with declaration primitives only and collect its definition
    #[instrument(skip(self, source))]
    pub async fn extract_definition(
        &self,
        kind: DefinitionKind,
        source_id: &str,
        source: Arc<str>,
    ) -> SandboxResult<DriverDefinition> {
        let engine = self.clone();
        let source_id = source_id.to_string();
        self.run_blocking(&source_id.clone(), move || {
            engine.extract_definition_blocking(kind, &source_id, &source)
        })
        .await
    }

    /// Run a source, then call `method` with `args`
    #[instrument(skip(self, source, args, context), fields(entity = %context.entity))]
    pub async fn invoke(
        &self,
        source_id: &str,
        source: Arc<str>,
        method: &str,
        args: Vec<JsonValue>,
        context: InvocationContext,
    ) -> SandboxResult<Invocation> {
        let engine = self.clone();
        let owned_id = source_id.to_string();
        let method = method.to_string();
        self.run_blocking(source_id, move || {
            engine.invoke_blocking(&owned_id, &source, &method, args, context)
        })
        .await
    }

    async fn run_blocking<T, F>(&self, source_id: &str, job: F) -> SandboxResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> SandboxResult<T> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(job);
        match tokio::time::timeout(self.config.timeout + JOIN_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SandboxError::Join(join.to_string())),
            Err(_) => Err(SandboxError::Timeout {
                source_id: source_id.to_string(),
                seconds: self.config.timeout.as_secs(),
            }),
        }
    }

    /// Synchronous extraction; must not run on an async worker thread
    pub fn extract_definition_blocking(
        &self,
        kind: DefinitionKind,
        source_id: &str,
        source: &str,
    ) -> SandboxResult<DriverDefinition> {
        let lua = new_vm()?;
        let interrupt = self.install_limits(&lua)?;

        let entity = match kind {
            DefinitionKind::DeviceHandler => EntityRef::device(source_id),
            DefinitionKind::SmartApp => EntityRef::app(source_id),
        };
        let session = Rc::new(Session {
            entity,
            effects: Rc::new(EffectLog::default()),
            host: Arc::new(NullHost),
            location: LocationInfo::default(),
            device: None,
            app_label: None,
        });
        let builder = Rc::new(RefCell::new(DefinitionBuilder::default()));
        primitives::declaration::install(&lua, Some(builder.clone()))?;
        primitives::install(&lua, &session, &CapabilitySet::definition())?;

        lua.load(source)
            .set_name(chunk_name(source_id))
            .exec()
            .map_err(|e| self.script_error(e, &interrupt, source_id))?;
        drop(lua);

        let builder = Rc::try_unwrap(builder)
            .map(RefCell::into_inner)
            .unwrap_or_else(|shared| std::mem::take(&mut *shared.borrow_mut()));
        let definition = builder.build(kind, source_id).ok_or_else(|| {
            SandboxError::DefinitionNotFound {
                source_id: source_id.to_string(),
            }
        })?;
        debug!(
            source_id,
            name = %definition.name,
            capabilities = definition.capabilities.len(),
            "Extracted definition"
        );
        Ok(definition)
    }

    /// Synchronous live invocation; must not run on an async worker thread
    pub fn invoke_blocking(
        &self,
        source_id: &str,
        source: &str,
        method: &str,
        args: Vec<JsonValue>,
        context: InvocationContext,
    ) -> SandboxResult<Invocation> {
        let lua = new_vm()?;
        let interrupt = self.install_limits(&lua)?;

        let effects = Rc::new(EffectLog::default());
        let session = Rc::new(Session {
            entity: context.entity.clone(),
            effects: effects.clone(),
            host: context.host.clone(),
            location: context.location.clone(),
            device: context.device.clone(),
            app_label: context.app_label.clone(),
        });

        let capabilities = context.capabilities.without(Capability::Declare);
        primitives::declaration::install(&lua, None)?;
        primitives::install(&lua, &session, &capabilities)?;
        primitives::install_settings(
            &lua,
            &session,
            SettingsView::new(&context.settings, context.host.clone()),
        )?;
        let state = context.state.clone().unwrap_or_default();
        let table = map_to_table(&lua, &state)?;
        lua.globals().set("state", table.clone())?;
        lua.globals().set("atomicState", table)?;

        lua.load(source)
            .set_name(chunk_name(source_id))
            .exec()
            .map_err(|e| self.script_error(e, &interrupt, source_id))?;

        let function = match lua.globals().get::<Value>(method)? {
            Value::Function(function) => function,
            _ => {
                debug!(source_id, method, "Method not defined");
                return Ok(Invocation::MethodMissing);
            }
        };

        let value = self
            .call(&lua, &function, &args)
            .map_err(|e| self.script_error(e, &interrupt, source_id))?;

        let state = match &context.state {
            Some(_) => Some(lua_to_object(&lua.globals().get::<Value>("state")?)?),
            None => None,
        };

        Ok(Invocation::Returned(InvocationOutcome {
            value,
            effects: effects.take(),
            state,
        }))
    }

    fn call(&self, lua: &Lua, function: &Function, args: &[JsonValue]) -> mlua::Result<JsonValue> {
        let args = args
            .iter()
            .map(|arg| json_to_lua(lua, arg))
            .collect::<mlua::Result<Vec<_>>>()?;
        let value: Value = function.call(MultiValue::from_vec(args))?;
        Ok(lua_to_json(&value)?.unwrap_or(JsonValue::Null))
    }

    fn install_limits(&self, lua: &Lua) -> SandboxResult<Rc<Cell<Option<Interrupt>>>> {
        let interrupt = Rc::new(Cell::new(None));
        let deadline = Instant::now() + self.config.timeout;
        let budget = self.config.instruction_budget;
        let executed = Cell::new(0u64);

        let flag = interrupt.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| {
                executed.set(executed.get() + u64::from(HOOK_INTERVAL));
                if executed.get() > budget {
                    flag.set(Some(Interrupt::Budget));
                    return Err(mlua::Error::runtime("instruction budget exhausted"));
                }
                if Instant::now() >= deadline {
                    flag.set(Some(Interrupt::Deadline));
                    return Err(mlua::Error::runtime("execution deadline exceeded"));
                }
                Ok(VmState::Continue)
            },
        );
        guard_protected_calls(lua, &interrupt)?;
        Ok(interrupt)
    }

    fn script_error(
        &self,
        err: mlua::Error,
        interrupt: &Cell<Option<Interrupt>>,
        source_id: &str,
    ) -> SandboxError {
        let source_id = source_id.to_string();
        match interrupt.get() {
            Some(Interrupt::Deadline) => {
                warn!(source_id = %source_id, "Script timed out");
                SandboxError::Timeout {
                    source_id,
                    seconds: self.config.timeout.as_secs(),
                }
            }
            Some(Interrupt::Budget) => {
                warn!(source_id = %source_id, "Script exhausted its instruction budget");
                SandboxError::InstructionBudget {
                    source_id,
                    budget: self.config.instruction_budget,
                }
            }
            None => {
                let (message, traceback) = traceback::clean(&err, &source_id);
                match err {
                    mlua::Error::SyntaxError { .. } => SandboxError::Compile { source_id, message },
                    _ => SandboxError::ScriptRuntime {
                        source_id,
                        message,
                        traceback,
                    },
                }
            }
        }
    }
}

fn chunk_name(source_id: &str) -> String {
    format!("={}", source_id)
}

/// Make `pcall`, `xpcall` and `coroutine.resume` re-raise once the VM was interrupted
fn guard_protected_calls(lua: &Lua, interrupt: &Rc<Cell<Option<Interrupt>>>) -> SandboxResult<()> {
    let globals = lua.globals();
    let coroutine: Table = globals.get("coroutine")?;
    for (table, name) in [(&globals, "pcall"), (&globals, "xpcall"), (&coroutine, "resume")] {
        let original: Function = table.get(name)?;
        let flag = interrupt.clone();
        let guarded = lua.create_function(move |_, args: MultiValue| {
            let results: MultiValue = original.call(args)?;
            if flag.get().is_some() {
                return Err(mlua::Error::runtime("execution interrupted"));
            }
            Ok(results)
        })?;
        table.set(name, guarded)?;
    }
    Ok(())
}

fn new_vm() -> SandboxResult<Lua> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
    let lua = Lua::new_with(libs, LuaOptions::new())?;
    let globals = lua.globals();
    for name in UNSAFE_GLOBALS {
        globals.set(*name, Value::Nil)?;
    }
    Ok(lua)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SWITCH: &str = r#"
metadata(function()
    definition({name = "Virtual Switch", namespace = "hub", author = "Hub"}, function()
        capability "Switch"
        capability "Refresh"
        capability "Switch"
        command("blink", {"NUMBER"})
        fingerprint({profileId = "0104", inClusters = "0006, 0000", deviceJoinName = "Lamp"})
    end)
end)

preferences(function()
    section("Timing", function()
        input("delay", "number", {title = "Delay", defaultValue = 5})
    end)
end)

tiles(function() end)

function on()
    sendEvent({name = "switch", value = "on"})
    runIn(5, "off")
    return "done"
end

function off()
    sendEvent({name = "switch", value = "off"})
end
"#;

    fn engine() -> SandboxEngine {
        SandboxEngine::default()
    }

    fn device_context() -> InvocationContext {
        let mut context = InvocationContext::new(EntityRef::device("dev-1"), Arc::new(NullHost));
        context.device = Some(DeviceSnapshot {
            id: "dev-1".into(),
            name: "Lamp".into(),
            ..Default::default()
        });
        context
    }

    fn app_context() -> InvocationContext {
        let mut context = InvocationContext::new(EntityRef::app("app-1"), Arc::new(NullHost));
        context.app_label = Some("Lights".into());
        context.state = Some(Map::new());
        context
    }

    async fn returned(
        engine: &SandboxEngine,
        source: &str,
        method: &str,
        args: Vec<JsonValue>,
        context: InvocationContext,
    ) -> InvocationOutcome {
        match engine
            .invoke("lamp", Arc::from(source), method, args, context)
            .await
            .unwrap()
        {
            Invocation::Returned(outcome) => outcome,
            Invocation::MethodMissing => panic!("method {} missing", method),
        }
    }

    #[tokio::test]
    async fn test_extract_definition() {
        let definition = engine()
            .extract_definition(DefinitionKind::DeviceHandler, "switch.lua", Arc::from(SWITCH))
            .await
            .unwrap();

        assert_eq!(definition.name, "Virtual Switch");
        assert_eq!(definition.namespace, "hub");
        assert_eq!(definition.source_id, "switch.lua");
        assert_eq!(definition.capabilities, vec!["Switch", "Refresh"]);
        assert_eq!(definition.commands.len(), 1);
        assert_eq!(definition.commands[0].name, "blink");
        assert_eq!(definition.commands[0].args, vec!["NUMBER"]);
        assert_eq!(definition.fingerprints.len(), 1);
        assert_eq!(definition.preferences.len(), 1);
        let preference = &definition.preferences[0];
        assert_eq!(preference.name, "delay");
        assert_eq!(preference.input_type, "number");
        assert_eq!(preference.section.as_deref(), Some("Timing"));
        assert_eq!(preference.default_value, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_extraction_does_not_run_methods() {
        let source = r#"
definition({name = "Quiet"})
function installed() error("should not run") end
"#;
        let definition = engine()
            .extract_definition(DefinitionKind::SmartApp, "quiet", Arc::from(source))
            .await
            .unwrap();
        assert_eq!(definition.name, "Quiet");
    }

    #[tokio::test]
    async fn test_missing_definition() {
        let err = engine()
            .extract_definition(DefinitionKind::SmartApp, "empty", Arc::from("local x = 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::DefinitionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_syntax_error_is_compile_error() {
        let err = engine()
            .extract_definition(DefinitionKind::SmartApp, "broken", Arc::from("function ("))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Compile { .. }));
        assert!(err.is_script_error());
    }

    #[tokio::test]
    async fn test_method_missing() {
        let result = engine()
            .invoke("lamp", Arc::from(SWITCH), "refresh", vec![], device_context())
            .await
            .unwrap();
        assert_eq!(result, Invocation::MethodMissing);
    }

    #[tokio::test]
    async fn test_effects_are_recorded_in_order() {
        let outcome = returned(&engine(), SWITCH, "on", vec![], device_context()).await;

        assert_eq!(outcome.value, json!("done"));
        assert_eq!(outcome.effects.len(), 2);
        match &outcome.effects[0] {
            Effect::SendEvent { device_id, draft } => {
                assert!(device_id.is_none());
                assert_eq!(draft.name, "switch");
                assert_eq!(draft.value, "on");
            }
            other => panic!("unexpected effect {:?}", other),
        }
        match &outcome.effects[1] {
            Effect::RunIn {
                delay,
                handler,
                overwrite,
                ..
            } => {
                assert_eq!(*delay, Duration::from_secs(5));
                assert_eq!(handler, "off");
                assert!(*overwrite);
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_arguments_and_return_value() {
        let source = "function add(a, b) return {sum = a + b, parts = {a, b}} end";
        let outcome = returned(
            &engine(),
            source,
            "add",
            vec![json!(2), json!(3)],
            device_context(),
        )
        .await;
        assert_eq!(outcome.value, json!({"sum": 5, "parts": [2, 3]}));
    }

    #[tokio::test]
    async fn test_runtime_error_carries_entity_frames() {
        let source = r#"
local function explode()
    error("boom")
end

function on()
    explode()
end
"#;
        let err = engine()
            .invoke("lamp", Arc::from(source), "on", vec![], device_context())
            .await
            .unwrap_err();
        match err {
            SandboxError::ScriptRuntime {
                source_id,
                message,
                traceback,
            } => {
                assert_eq!(source_id, "lamp");
                assert!(message.contains("boom"), "{}", message);
                assert!(traceback.iter().all(|frame| frame.starts_with("lamp:")));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_is_script_error() {
        for delay in ["1e30", "0/0", "math.huge"] {
            let source = format!("function on()\n    runIn({}, \"off\")\nend\n", delay);
            let err = engine()
                .invoke("lamp", Arc::from(source.as_str()), "on", vec![], device_context())
                .await
                .unwrap_err();
            assert!(
                matches!(&err, SandboxError::ScriptRuntime { message, .. } if message.contains("runIn delay")),
                "{}: {:?}",
                delay,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_instruction_budget() {
        let engine = SandboxEngine::new(SandboxConfig {
            timeout: Duration::from_secs(10),
            instruction_budget: 100_000,
        });
        let err = engine
            .invoke(
                "lamp",
                Arc::from("function spin() while true do end end"),
                "spin",
                vec![],
                device_context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InstructionBudget { budget: 100_000, .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let engine = SandboxEngine::new(SandboxConfig {
            timeout: Duration::from_millis(200),
            instruction_budget: u64::MAX,
        });
        let err = engine
            .invoke(
                "lamp",
                Arc::from("while true do end"),
                "never",
                vec![],
                device_context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_loop_cannot_swallow_interrupt() {
        let engine = SandboxEngine::new(SandboxConfig {
            timeout: Duration::from_secs(10),
            instruction_budget: 100_000,
        });
        let source = r#"
function spin()
    while true do
        pcall(function() while true do end end)
    end
end
"#;
        let err = engine
            .invoke("lamp", Arc::from(source), "spin", vec![], device_context())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InstructionBudget { .. }));
    }

    #[tokio::test]
    async fn test_state_is_shared_and_returned() {
        let mut context = app_context();
        context.state = Some(json!({"count": 1}).as_object().cloned().unwrap());
        let source = r#"
function installed()
    state.count = state.count + 1
    atomicState.flag = true
    state.callback = function() end
    return createAccessToken()
end
"#;
        let outcome = returned(&engine(), source, "installed", vec![], context).await;
        let state = outcome.state.unwrap();
        assert_eq!(state["count"], json!(2));
        assert_eq!(state["flag"], json!(true));
        assert!(!state.contains_key("callback"));
        assert_eq!(state["accessToken"], outcome.value);
    }

    #[tokio::test]
    async fn test_settings_are_typed() {
        let mut context = app_context();
        context.settings = vec![
            Setting::new("threshold", "number", json!("42")),
            Setting::new("enabled", "bool", json!("true")),
        ];
        let source = r#"
function check()
    return {next = settings.threshold + 1, enabled = settings.enabled, missing = settings.nothing == nil}
end
"#;
        let outcome = returned(&engine(), source, "check", vec![], context).await;
        assert_eq!(
            outcome.value,
            json!({"next": 43, "enabled": true, "missing": true})
        );
    }

    #[tokio::test]
    async fn test_settings_are_read_only() {
        let err = engine()
            .invoke(
                "lamp",
                Arc::from("function f() settings.x = 1 end"),
                "f",
                vec![],
                app_context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ScriptRuntime { .. }));
    }

    #[tokio::test]
    async fn test_primitives_follow_entity_role() {
        let source = r#"
function exposed()
    return {
        sendEvent = sendEvent ~= nil,
        updateDataValue = updateDataValue ~= nil,
        subscribe = subscribe ~= nil,
        runIn = runIn ~= nil,
        load = load ~= nil,
        io = io ~= nil,
        os = os ~= nil,
    }
end
"#;
        let device = returned(&engine(), source, "exposed", vec![], device_context()).await;
        assert_eq!(
            device.value,
            json!({"sendEvent": true, "updateDataValue": true, "subscribe": false, "runIn": true, "load": false, "io": false, "os": false})
        );

        let app = returned(&engine(), source, "exposed", vec![], app_context()).await;
        assert_eq!(app.value["sendEvent"], json!(true));
        assert_eq!(app.value["subscribe"], json!(true));
        assert_eq!(app.value["updateDataValue"], json!(false));
    }

    #[tokio::test]
    async fn test_each_invocation_is_isolated() {
        let source = r#"
counter = (counter or 0) + 1
function count() return counter end
"#;
        let engine = engine();
        let first = returned(&engine, source, "count", vec![], device_context()).await;
        let second = returned(&engine, source, "count", vec![], device_context()).await;
        assert_eq!(first.value, json!(1));
        assert_eq!(second.value, json!(1));
    }
}
