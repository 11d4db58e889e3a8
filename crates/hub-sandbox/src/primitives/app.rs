//! Smart app primitives

use std::rc::Rc;

use chrono::{NaiveDate, TimeZone, Utc};
use hub_core::SubscriptionTarget;
use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value};

use super::device::draft_from_table;
use super::{handler_name, Session};
use crate::convert::lua_string;
use crate::effects::Effect;
use crate::handles::{device_id_of, location_id_of};
use crate::primitives::common::parse_datetime;
use crate::sun::{parse_offset, sunrise_sunset};

/// Subscription targets named by a handle, a list of handles or `location`
fn targets(value: &Value) -> LuaResult<Vec<SubscriptionTarget>> {
    if let Some(id) = device_id_of(value) {
        return Ok(vec![SubscriptionTarget::Device(id)]);
    }
    if let Some(id) = location_id_of(value) {
        return Ok(vec![SubscriptionTarget::Location(id)]);
    }
    match value {
        // Unset optional device inputs subscribe to nothing
        Value::Nil => Ok(Vec::new()),
        Value::Table(list) => {
            let mut targets = Vec::new();
            for item in list.clone().sequence_values::<Value>() {
                let item = item?;
                let id = device_id_of(&item)
                    .ok_or_else(|| mlua::Error::runtime("subscribe list must contain devices"))?;
                targets.push(SubscriptionTarget::Device(id));
            }
            Ok(targets)
        }
        other => Err(mlua::Error::runtime(format!(
            "cannot subscribe to a {}",
            other.type_name()
        ))),
    }
}

pub(super) fn install_subscribe(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let s = session.clone();
    lua.globals().set(
        "subscribe",
        lua.create_function(move |lua, args: MultiValue| {
            // subscribe(target, handler[, options]) or
            // subscribe(target, filter, handler[, options])
            let mut args = args.into_iter();
            let target = args.next().unwrap_or(Value::Nil);
            let second = args.next().unwrap_or(Value::Nil);
            let third = args.next().unwrap_or(Value::Nil);
            let fourth = args.next().unwrap_or(Value::Nil);

            let (filter, handler, options) = match (&second, &third) {
                (Value::String(filter), Value::String(_) | Value::Function(_)) => {
                    (Some(lua_string(filter)), third.clone(), fourth)
                }
                _ => (None, second.clone(), third),
            };
            let handler = handler_name(lua, &handler)?;
            let filter_events = match options {
                Value::Table(options) => options
                    .get::<Option<bool>>("filterEvents")?
                    .unwrap_or(true),
                _ => true,
            };
            let filter = filter.filter(|f| !f.is_empty());

            for target in targets(&target)? {
                s.effects.push(Effect::Subscribe {
                    target,
                    attribute_filter: filter.clone(),
                    handler: handler.clone(),
                    filter_events,
                });
            }
            Ok(())
        })?,
    )?;

    let s = session.clone();
    lua.globals().set(
        "unsubscribe",
        lua.create_function(move |lua, target: Value| {
            let effect = match &target {
                Value::Nil => Effect::Unsubscribe {
                    device_ids: Vec::new(),
                    handler: None,
                },
                Value::String(_) | Value::Function(_) => Effect::Unsubscribe {
                    device_ids: Vec::new(),
                    handler: Some(handler_name(lua, &target)?),
                },
                _ => {
                    let device_ids = targets(&target)?
                        .into_iter()
                        .filter_map(|t| match t {
                            SubscriptionTarget::Device(id) => Some(id),
                            SubscriptionTarget::Location(_) => None,
                        })
                        .collect();
                    Effect::Unsubscribe {
                        device_ids,
                        handler: None,
                    }
                }
            };
            s.effects.push(effect);
            Ok(())
        })?,
    )
}

pub(super) fn install_location_events(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let s = session.clone();
    lua.globals().set(
        "sendLocationEvent",
        lua.create_function(move |_, table: Table| {
            let draft = draft_from_table(&table)?;
            s.effects.push(Effect::SendLocationEvent(draft));
            Ok(())
        })?,
    )
}

pub(super) fn install_sun(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let s = session.clone();
    lua.globals().set(
        "getSunriseAndSunset",
        lua.create_function(move |lua, options: Option<Table>| {
            let mut date = Utc::now().date_naive();
            let mut sunrise_offset = chrono::Duration::zero();
            let mut sunset_offset = chrono::Duration::zero();

            if let Some(options) = options {
                if let Some(text) = options.get::<Option<String>>("sunriseOffset")? {
                    sunrise_offset = parse_offset(&text)
                        .ok_or_else(|| mlua::Error::runtime("invalid sunriseOffset"))?;
                }
                if let Some(text) = options.get::<Option<String>>("sunsetOffset")? {
                    sunset_offset = parse_offset(&text)
                        .ok_or_else(|| mlua::Error::runtime("invalid sunsetOffset"))?;
                }
                date = match options.get::<Value>("date")? {
                    Value::Integer(ms) => Utc
                        .timestamp_millis_opt(ms)
                        .single()
                        .map(|dt| dt.date_naive())
                        .unwrap_or(date),
                    Value::String(text) => {
                        let text = lua_string(&text);
                        NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                            .ok()
                            .or_else(|| parse_datetime(&text).map(|dt| dt.date_naive()))
                            .ok_or_else(|| mlua::Error::runtime(format!("unparseable date: {}", text)))?
                    }
                    _ => date,
                };
            }

            let result = lua.create_table()?;
            if let Some((sunrise, sunset)) =
                sunrise_sunset(date, s.location.latitude, s.location.longitude)
            {
                result.set("sunrise", (sunrise + sunrise_offset).timestamp_millis())?;
                result.set("sunset", (sunset + sunset_offset).timestamp_millis())?;
            }
            Ok(result)
        })?,
    )
}

pub(super) fn install_tokens(lua: &Lua) -> LuaResult<()> {
    lua.globals().set(
        "createAccessToken",
        lua.create_function(|lua, ()| {
            let token = uuid::Uuid::new_v4().to_string();
            if let Value::Table(state) = lua.globals().get::<Value>("state")? {
                state.set("accessToken", token.as_str())?;
            }
            Ok(token)
        })?,
    )
}

pub(super) fn install_render(lua: &Lua) -> LuaResult<()> {
    lua.globals().set(
        "render",
        lua.create_function(|lua, options: Option<Table>| {
            let response = lua.create_table()?;
            response.set("contentType", "text/plain")?;
            response.set("status", 200)?;
            if let Some(options) = options {
                for pair in options.pairs::<Value, Value>() {
                    let (key, value) = pair?;
                    response.set(key, value)?;
                }
            }
            Ok(response)
        })?,
    )
}
