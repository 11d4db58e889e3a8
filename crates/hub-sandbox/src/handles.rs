//! Device and location handles handed to scripts
//!
//! A device handle exposes read accessors plus the device's declared commands.
//! Commands are never executed inline: calling one records an
//! [`Effect::InvokeCommand`] for the runtime to dispatch afterwards.

use std::rc::Rc;

use mlua::{
    AnyUserData, Lua, MetaMethod, MultiValue, Result as LuaResult, UserData, UserDataFields,
    UserDataMethods, Value,
};

use crate::convert::{json_to_lua, lua_to_json, map_to_table};
use crate::effects::{Effect, EffectLog};
use crate::host::{DeviceSnapshot, LocationInfo};

pub(crate) struct DeviceHandle {
    pub snapshot: DeviceSnapshot,
    effects: Rc<EffectLog>,
}

impl DeviceHandle {
    pub fn new(snapshot: DeviceSnapshot, effects: Rc<EffectLog>) -> Self {
        Self { snapshot, effects }
    }

    pub fn into_lua(self, lua: &Lua) -> LuaResult<Value> {
        Ok(Value::UserData(lua.create_userdata(self)?))
    }

    fn invoke(&self, command: &str, args: MultiValue) -> LuaResult<()> {
        if !self.snapshot.has_command(command) {
            return Err(mlua::Error::runtime(format!(
                "{} does not support command {}",
                self.snapshot.display_name(),
                command
            )));
        }
        let args = args
            .iter()
            .filter_map(|arg| lua_to_json(arg).transpose())
            .collect::<LuaResult<Vec<_>>>()?;
        self.effects.push(Effect::InvokeCommand {
            device_id: self.snapshot.id.clone(),
            command: command.to_string(),
            args,
        });
        Ok(())
    }
}

/// Numeric attribute values read as numbers
fn typed_state_value(value: &str) -> Value {
    if let Ok(i) = value.parse::<i64>() {
        return Value::Integer(i);
    }
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() => Value::Number(n),
        _ => Value::Nil,
    }
}

impl UserData for DeviceHandle {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("id", |_, this| Ok(this.snapshot.id.clone()));
        fields.add_field_method_get("name", |_, this| Ok(this.snapshot.name.clone()));
        fields.add_field_method_get("label", |_, this| Ok(this.snapshot.label.clone()));
        fields.add_field_method_get("displayName", |_, this| {
            Ok(this.snapshot.display_name().to_string())
        });
        fields.add_field_method_get("deviceNetworkId", |_, this| {
            Ok(this.snapshot.device_network_id.clone())
        });
        fields.add_field_method_get("typeId", |_, this| Ok(this.snapshot.definition_id.clone()));
        fields.add_field_method_get("capabilities", |_, this| {
            Ok(this.snapshot.capabilities.clone())
        });
        fields.add_field_method_get("data", |lua, this| map_to_table(lua, &this.snapshot.data));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("currentValue", |lua, this, attribute: String| {
            let Some(value) = this.snapshot.current_value(&attribute) else {
                return Ok(Value::Nil);
            };
            match typed_state_value(value) {
                Value::Nil => Ok(Value::String(lua.create_string(value)?)),
                number => Ok(number),
            }
        });

        methods.add_method("currentState", |lua, this, attribute: String| {
            let Some(record) = this.snapshot.current_states.get(&attribute) else {
                return Ok(Value::Nil);
            };
            let json = serde_json::to_value(record).map_err(mlua::Error::external)?;
            json_to_lua(lua, &json)
        });

        methods.add_method("hasCapability", |_, this, name: String| {
            Ok(this.snapshot.has_capability(&name))
        });

        methods.add_method("hasCommand", |_, this, name: String| {
            Ok(this.snapshot.has_command(&name))
        });

        methods.add_method("getDataValue", |lua, this, name: String| {
            match this.snapshot.data.get(&name) {
                Some(value) => json_to_lua(lua, value),
                None => Ok(Value::Nil),
            }
        });

        methods.add_method(
            "invokeCommand",
            |_, this, (command, args): (String, MultiValue)| this.invoke(&command, args),
        );

        // Declared commands are reachable by name: `lamp:on()`
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            if !this.snapshot.has_command(&key) {
                return Ok(Value::Nil);
            }
            let snapshot = this.snapshot.clone();
            let effects = this.effects.clone();
            let command = lua.create_function(move |_, mut args: MultiValue| {
                // Drop the receiver of a `device:command()` call
                if matches!(args.front(), Some(Value::UserData(ud)) if ud.is::<DeviceHandle>()) {
                    args.pop_front();
                }
                DeviceHandle::new(snapshot.clone(), effects.clone()).invoke(&key, args)
            })?;
            Ok(Value::Function(command))
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.snapshot.display_name().to_string())
        });
    }
}

pub(crate) struct LocationHandle {
    pub info: LocationInfo,
}

impl UserData for LocationHandle {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("id", |_, this| Ok(this.info.id.clone()));
        fields.add_field_method_get("name", |_, this| Ok(this.info.name.clone()));
        fields.add_field_method_get("latitude", |_, this| Ok(this.info.latitude));
        fields.add_field_method_get("longitude", |_, this| Ok(this.info.longitude));
        fields.add_field_method_get("mode", |_, this| Ok(this.info.mode.clone()));
        fields.add_field_method_get("currentMode", |_, this| Ok(this.info.mode.clone()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.info.name.clone()));
    }
}

/// Device id behind a handle value, if it is one
pub(crate) fn device_id_of(value: &Value) -> Option<String> {
    match value {
        Value::UserData(ud) => userdata_device_id(ud),
        _ => None,
    }
}

fn userdata_device_id(ud: &AnyUserData) -> Option<String> {
    ud.borrow::<DeviceHandle>()
        .ok()
        .map(|handle| handle.snapshot.id.clone())
}

/// Location id behind a handle value, if it is one
pub(crate) fn location_id_of(value: &Value) -> Option<String> {
    match value {
        Value::UserData(ud) => ud
            .borrow::<LocationHandle>()
            .ok()
            .map(|handle| handle.info.id.clone()),
        _ => None,
    }
}
