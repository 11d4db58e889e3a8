//! Primitive sets installed into a script's globals, one module per role

mod app;
mod common;
pub(crate) mod declaration;
mod device;

use std::rc::Rc;
use std::sync::Arc;

use hub_core::EntityRef;
use mlua::{Lua, MetaMethod, Result as LuaResult, Table, Value};

use crate::capability::{Capability, CapabilitySet};
use crate::convert::{json_to_lua, lua_string, lua_to_json};
use crate::effects::EffectLog;
use crate::handles::DeviceHandle;
use crate::host::{DeviceSnapshot, LocationInfo, SandboxHost};
use crate::settings::{SettingsView, TypedValue};

/// Per-invocation state shared by every primitive closure
pub(crate) struct Session {
    pub entity: EntityRef,
    pub effects: Rc<EffectLog>,
    pub host: Arc<dyn SandboxHost>,
    pub location: LocationInfo,
    pub device: Option<DeviceSnapshot>,
    pub app_label: Option<String>,
}

impl Session {
    pub fn device_handle(&self, snapshot: DeviceSnapshot) -> DeviceHandle {
        DeviceHandle::new(snapshot, self.effects.clone())
    }
}

/// Install every primitive group granted by `capabilities`
pub(crate) fn install(
    lua: &Lua,
    session: &Rc<Session>,
    capabilities: &CapabilitySet,
) -> LuaResult<()> {
    for capability in capabilities.iter() {
        match capability {
            // Declarations are installed by the engine, which owns the builder
            Capability::Declare => {}
            Capability::Log => common::install_log(lua, session)?,
            Capability::Clock => common::install_clock(lua)?,
            Capability::Parse => common::install_parse(lua)?,
            Capability::Http => common::install_http(lua, session)?,
            Capability::Schedule => common::install_schedule(lua, session)?,
            Capability::HubCommand => common::install_hub_command(lua, session)?,
            Capability::ChildDevices => common::install_children(lua, session)?,
            Capability::SendEvent => device::install_events(lua, session)?,
            Capability::DeviceData => device::install_data(lua, session)?,
            Capability::Subscribe => app::install_subscribe(lua, session)?,
            Capability::LocationEvents => app::install_location_events(lua, session)?,
            Capability::Sun => app::install_sun(lua, session)?,
            Capability::Tokens => app::install_tokens(lua)?,
            Capability::Render => app::install_render(lua)?,
        }
    }
    common::install_location(lua, session)?;
    if let Some(snapshot) = &session.device {
        let handle = session.device_handle(snapshot.clone());
        lua.globals().set("device", handle.into_lua(lua)?)?;
    }
    if session.app_label.is_some() {
        let app = lua.create_table()?;
        app.set("id", session.entity.entity_id.as_str())?;
        app.set("label", session.app_label.as_deref())?;
        lua.globals().set("app", app)?;
    }
    Ok(())
}

/// Expose settings as a read-only `settings` table backed by a typed view
pub(crate) fn install_settings(
    lua: &Lua,
    session: &Rc<Session>,
    view: SettingsView,
) -> LuaResult<()> {
    let settings = lua.create_table()?;
    let meta = lua.create_table()?;
    let session = session.clone();
    meta.set(
        MetaMethod::Index.name(),
        lua.create_function(move |lua, (_, key): (Table, Value)| {
            let Value::String(name) = key else {
                return Ok(Value::Nil);
            };
            match view.get(&lua_string(&name)) {
                Some(value) => typed_to_lua(lua, &session, value),
                None => Ok(Value::Nil),
            }
        })?,
    )?;
    meta.set(
        MetaMethod::NewIndex.name(),
        lua.create_function(|_, _: (Table, Value, Value)| -> LuaResult<()> {
            Err(mlua::Error::runtime("settings are read-only"))
        })?,
    )?;
    settings.set_metatable(Some(meta));
    lua.globals().set("settings", settings)
}

fn typed_to_lua(lua: &Lua, session: &Session, value: TypedValue) -> LuaResult<Value> {
    Ok(match value {
        TypedValue::Text(s) | TypedValue::Enum(s) => Value::String(lua.create_string(&s)?),
        TypedValue::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Value::Integer(n as i64),
        TypedValue::Number(n) => Value::Number(n),
        TypedValue::Bool(b) => Value::Boolean(b),
        TypedValue::List(items) => {
            let table = lua.create_table()?;
            for item in items {
                table.push(typed_to_lua(lua, session, item)?)?;
            }
            Value::Table(table)
        }
        TypedValue::Device(snapshot) => session.device_handle(snapshot).into_lua(lua)?,
        TypedValue::Devices(snapshots) => {
            let table = lua.create_table()?;
            for snapshot in snapshots {
                table.push(session.device_handle(snapshot).into_lua(lua)?)?;
            }
            Value::Table(table)
        }
        TypedValue::Json(json) => json_to_lua(lua, &json)?,
    })
}

/// A handler given by name or as a global function
pub(crate) fn handler_name(lua: &Lua, value: &Value) -> LuaResult<String> {
    match value {
        Value::String(s) => Ok(lua_string(s)),
        Value::Function(f) => {
            for pair in lua.globals().pairs::<Value, Value>() {
                let (key, candidate) = pair?;
                if let (Value::String(name), Value::Function(g)) = (&key, &candidate) {
                    if g.to_pointer() == f.to_pointer() {
                        return Ok(lua_string(name));
                    }
                }
            }
            Err(mlua::Error::runtime("handler function must be a global function"))
        }
        other => Err(mlua::Error::runtime(format!(
            "handler must be a method name, got {}",
            other.type_name()
        ))),
    }
}

/// Common `{overwrite = bool, data = table}` option table
pub(crate) struct JobOptions {
    pub overwrite: bool,
    pub data: serde_json::Value,
}

pub(crate) fn job_options(options: Option<Table>) -> LuaResult<JobOptions> {
    let Some(options) = options else {
        return Ok(JobOptions {
            overwrite: true,
            data: serde_json::Value::Null,
        });
    };
    Ok(JobOptions {
        overwrite: options.get::<Option<bool>>("overwrite")?.unwrap_or(true),
        data: lua_to_json(&options.get::<Value>("data")?)?.unwrap_or(serde_json::Value::Null),
    })
}
