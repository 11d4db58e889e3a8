//! Device handler primitives

use std::rc::Rc;

use hub_core::EventDraft;
use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value};

use super::Session;
use crate::convert::{json_to_lua, lua_to_json, value_string};
use crate::effects::Effect;
use crate::handles::device_id_of;

/// Build an event draft from a `{name, value, unit, descriptionText, ...}` table
pub(crate) fn draft_from_table(table: &Table) -> LuaResult<EventDraft> {
    let name: String = table
        .get::<Option<String>>("name")?
        .ok_or_else(|| mlua::Error::runtime("event requires a name"))?;
    let value = lua_to_json(&table.get::<Value>("value")?)?
        .map(|v| value_string(&v))
        .unwrap_or_default();
    Ok(EventDraft {
        name,
        value,
        unit: table.get("unit")?,
        description_text: table.get("descriptionText")?,
        data: lua_to_json(&table.get::<Value>("data")?)?.unwrap_or(serde_json::Value::Null),
        is_state_change: table.get("isStateChange")?,
    })
}

pub(super) fn install_events(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let s = session.clone();
    lua.globals().set(
        "sendEvent",
        lua.create_function(move |_, args: MultiValue| {
            // sendEvent(map) or sendEvent(device, map)
            let (device_id, table) = match (args.front(), args.get(1)) {
                (Some(Value::Table(table)), _) => (None, table.clone()),
                (Some(target), Some(Value::Table(table))) => {
                    let id = device_id_of(target)
                        .ok_or_else(|| mlua::Error::runtime("sendEvent target is not a device"))?;
                    (Some(id), table.clone())
                }
                _ => return Err(mlua::Error::runtime("sendEvent expects an event table")),
            };
            let draft = draft_from_table(&table)?;
            s.effects.push(Effect::SendEvent { device_id, draft });
            Ok(())
        })?,
    )?;

    // createEvent only validates and returns the map, for `parse` to return
    lua.globals().set(
        "createEvent",
        lua.create_function(|_, table: Table| {
            draft_from_table(&table)?;
            Ok(table)
        })?,
    )
}

pub(super) fn install_data(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let s = session.clone();
    lua.globals().set(
        "updateDataValue",
        lua.create_function(move |_, (name, value): (String, Value)| {
            let value = lua_to_json(&value)?.unwrap_or(serde_json::Value::Null);
            s.effects.push(Effect::UpdateDataValue { name, value });
            Ok(())
        })?,
    )?;

    let s = session.clone();
    lua.globals().set(
        "getDataValue",
        lua.create_function(move |lua, name: String| {
            let value = s
                .device
                .as_ref()
                .and_then(|d| d.data.get(&name).cloned());
            match value {
                Some(value) => json_to_lua(lua, &value),
                None => Ok(Value::Nil),
            }
        })?,
    )
}
