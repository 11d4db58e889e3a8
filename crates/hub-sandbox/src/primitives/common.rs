//! Primitives shared by device handlers and smart apps

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use hub_core::{Action, EntityRef};
use mlua::{Function, Lua, MultiValue, Result as LuaResult, Table, Value};
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use super::{handler_name, job_options, Session};
use crate::convert::{display, json_to_lua, lua_string, lua_to_json, value_string};
use crate::effects::{Effect, ScheduleSpec};
use crate::handles::LocationHandle;
use crate::host::{ChildDeviceRequest, HttpMethod, HttpRequest, HttpResponse};
use crate::lan::parse_lan_message;
use crate::sun::parse_offset;

#[derive(Debug, Clone, Copy)]
enum ScriptLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

fn emit(level: ScriptLevel, entity: &EntityRef, message: &str) {
    let entity_type = entity.entity_type;
    let entity_id = entity.entity_id.as_str();
    match level {
        ScriptLevel::Trace => trace!(target: "hub::script", %entity_type, entity_id, "{}", message),
        ScriptLevel::Debug => debug!(target: "hub::script", %entity_type, entity_id, "{}", message),
        ScriptLevel::Info => info!(target: "hub::script", %entity_type, entity_id, "{}", message),
        ScriptLevel::Warn => warn!(target: "hub::script", %entity_type, entity_id, "{}", message),
        ScriptLevel::Error => error!(target: "hub::script", %entity_type, entity_id, "{}", message),
    }
}

fn join_args(args: &MultiValue) -> String {
    args.iter().map(display).collect::<Vec<_>>().join(" ")
}

pub(super) fn install_log(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let log = lua.create_table()?;
    for (name, level) in [
        ("trace", ScriptLevel::Trace),
        ("debug", ScriptLevel::Debug),
        ("info", ScriptLevel::Info),
        ("warn", ScriptLevel::Warn),
        ("error", ScriptLevel::Error),
    ] {
        let session = session.clone();
        log.set(
            name,
            lua.create_function(move |_, args: MultiValue| {
                emit(level, &session.entity, &join_args(&args));
                Ok(())
            })?,
        )?;
    }
    lua.globals().set("log", log)?;

    let session = session.clone();
    lua.globals().set(
        "print",
        lua.create_function(move |_, args: MultiValue| {
            emit(ScriptLevel::Info, &session.entity, &join_args(&args));
            Ok(())
        })?,
    )
}

/// Parse the date formats scripts commonly pass around
pub(crate) fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

pub(super) fn install_clock(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();

    globals.set(
        "now",
        lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?,
    )?;

    globals.set(
        "toDateTime",
        lua.create_function(|_, value: Value| match value {
            Value::Integer(ms) => Ok(ms),
            Value::Number(ms) => Ok(ms as i64),
            Value::String(s) => {
                let text = lua_string(&s);
                parse_datetime(&text)
                    .map(|dt| dt.timestamp_millis())
                    .ok_or_else(|| mlua::Error::runtime(format!("unparseable date: {}", text)))
            }
            other => Err(mlua::Error::runtime(format!(
                "toDateTime expects a string or number, got {}",
                other.type_name()
            ))),
        })?,
    )?;

    globals.set(
        "timeOffset",
        lua.create_function(|_, value: Value| {
            let offset = match value {
                Value::Integer(minutes) => Some(chrono::Duration::minutes(minutes)),
                Value::Number(minutes) => Some(chrono::Duration::seconds((minutes * 60.0) as i64)),
                Value::String(s) => parse_offset(&lua_string(&s)),
                _ => None,
            };
            offset
                .map(|d| d.num_milliseconds())
                .ok_or_else(|| mlua::Error::runtime("timeOffset expects HH:mm or minutes"))
        })?,
    )
}

pub(super) fn install_parse(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();

    globals.set(
        "parseJson",
        lua.create_function(|lua, text: String| {
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            json_to_lua(lua, &value)
        })?,
    )?;

    globals.set(
        "parseLanMessage",
        lua.create_function(|lua, description: String| {
            let message = parse_lan_message(&description);
            let value = serde_json::to_value(&message).map_err(mlua::Error::external)?;
            json_to_lua(lua, &value)
        })?,
    )
}

fn string_map(value: Value) -> LuaResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    if let Value::Table(table) = value {
        for pair in table.pairs::<String, Value>() {
            let (key, value) = pair?;
            if let Some(value) = lua_to_json(&value)? {
                map.insert(key, value_string(&value));
            }
        }
    }
    Ok(map)
}

fn http_request(method: HttpMethod, params: Value) -> LuaResult<HttpRequest> {
    let mut request = HttpRequest {
        method,
        uri: String::new(),
        query: BTreeMap::new(),
        headers: BTreeMap::new(),
        body: None,
    };
    match params {
        Value::String(uri) => request.uri = lua_string(&uri),
        Value::Table(table) => {
            request.uri = table
                .get::<Option<String>>("uri")?
                .ok_or_else(|| mlua::Error::runtime("http request requires a uri"))?;
            if let Some(path) = table.get::<Option<String>>("path")? {
                request.uri = format!(
                    "{}/{}",
                    request.uri.trim_end_matches('/'),
                    path.trim_start_matches('/')
                );
            }
            request.query = string_map(table.get("query")?)?;
            request.headers = string_map(table.get("headers")?)?;
            if let Some(content_type) = table.get::<Option<String>>("contentType")? {
                request.headers.insert("Content-Type".to_string(), content_type);
            }
            request.body = lua_to_json(&table.get::<Value>("body")?)?.filter(|b| !b.is_null());
        }
        other => {
            return Err(mlua::Error::runtime(format!(
                "http request expects a uri or parameter table, got {}",
                other.type_name()
            )))
        }
    }
    Ok(request)
}

fn http_response(lua: &Lua, response: HttpResponse) -> LuaResult<Table> {
    let table = lua.create_table()?;
    table.set("status", response.status)?;
    let data = match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => json_to_lua(lua, &json)?,
        Err(_) => Value::String(lua.create_string(&response.body)?),
    };
    table.set("data", data)?;
    table.set("body", response.body)?;
    table.set("headers", lua.create_table_from(response.headers)?)?;
    Ok(table)
}

pub(super) fn install_http(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    for (name, method) in [("httpGet", HttpMethod::Get), ("httpPost", HttpMethod::Post)] {
        let session = session.clone();
        lua.globals().set(
            name,
            lua.create_function(move |lua, (params, callback): (Value, Option<Function>)| {
                let request = http_request(method, params)?;
                debug!(entity_id = %session.entity.entity_id, uri = %request.uri, ?method, "Script http request");
                let response = session
                    .host
                    .http(request)
                    .map_err(|e| mlua::Error::runtime(format!("{} failed: {}", name, e)))?;
                let response = http_response(lua, response)?;
                match callback {
                    Some(callback) => callback.call::<Value>(response),
                    None => Ok(Value::Table(response)),
                }
            })?,
        )?;
    }
    Ok(())
}

/// Fixed recurrences offered as `runEvery*` helpers
#[derive(Debug, Clone, Copy)]
pub(crate) enum Period {
    Minutes(u32),
    Hours(u32),
}

const RECURRENCES: &[(&str, Period)] = &[
    ("runEvery1Minute", Period::Minutes(1)),
    ("runEvery5Minutes", Period::Minutes(5)),
    ("runEvery10Minutes", Period::Minutes(10)),
    ("runEvery15Minutes", Period::Minutes(15)),
    ("runEvery30Minutes", Period::Minutes(30)),
    ("runEvery1Hour", Period::Hours(1)),
    ("runEvery3Hours", Period::Hours(3)),
];

/// Cron expression for a period, staggered by a random offset so that
/// helpers registered together do not all fire on the same second
pub(crate) fn recurrence_expression(period: Period, rng: &mut impl Rng) -> String {
    let second = rng.gen_range(0..60);
    match period {
        Period::Minutes(1) => format!("{} * * * * ?", second),
        Period::Minutes(n) => format!("{} {}/{} * * * ?", second, rng.gen_range(0..n), n),
        Period::Hours(1) => format!("{} {} * * * ?", second, rng.gen_range(0..60)),
        Period::Hours(n) => format!(
            "{} {} {}/{} * * ?",
            second,
            rng.gen_range(0..60),
            rng.gen_range(0..n),
            n
        ),
    }
}

pub(super) fn install_schedule(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let globals = lua.globals();

    let s = session.clone();
    globals.set(
        "runIn",
        lua.create_function(move |lua, (seconds, handler, options): (f64, Value, Option<Table>)| {
            if !seconds.is_finite() {
                return Err(mlua::Error::runtime("runIn delay must be a finite number"));
            }
            let delay = Duration::try_from_secs_f64(seconds.max(0.0)).map_err(|_| {
                mlua::Error::runtime(format!("runIn delay {} is out of range", seconds))
            })?;
            let handler = handler_name(lua, &handler)?;
            let options = job_options(options)?;
            s.effects.push(Effect::RunIn {
                delay,
                handler,
                overwrite: options.overwrite,
                data: options.data,
            });
            Ok(())
        })?,
    )?;

    let s = session.clone();
    globals.set(
        "schedule",
        lua.create_function(move |lua, (when, handler, options): (Value, Value, Option<Table>)| {
            let schedule = match when {
                Value::String(expr) => ScheduleSpec::Expression(lua_string(&expr)),
                Value::Integer(ms) => ScheduleSpec::Timestamp(ms),
                Value::Number(ms) => ScheduleSpec::Timestamp(ms as i64),
                other => {
                    return Err(mlua::Error::runtime(format!(
                        "schedule expects an expression or timestamp, got {}",
                        other.type_name()
                    )))
                }
            };
            let handler = handler_name(lua, &handler)?;
            let options = job_options(options)?;
            s.effects.push(Effect::Schedule {
                schedule,
                handler,
                overwrite: options.overwrite,
                data: options.data,
            });
            Ok(())
        })?,
    )?;

    let s = session.clone();
    globals.set(
        "unschedule",
        lua.create_function(move |lua, handler: Value| {
            let handler = match handler {
                Value::Nil => None,
                other => Some(handler_name(lua, &other)?),
            };
            s.effects.push(Effect::Unschedule { handler });
            Ok(())
        })?,
    )?;

    for (name, period) in RECURRENCES {
        let s = session.clone();
        let period = *period;
        globals.set(
            *name,
            lua.create_function(move |lua, (handler, options): (Value, Option<Table>)| {
                let handler = handler_name(lua, &handler)?;
                let options = job_options(options)?;
                let expression = recurrence_expression(period, &mut rand::thread_rng());
                s.effects.push(Effect::Schedule {
                    schedule: ScheduleSpec::Expression(expression),
                    handler,
                    overwrite: options.overwrite,
                    data: options.data,
                });
                Ok(())
            })?,
        )?;
    }
    Ok(())
}

pub(super) fn install_hub_command(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let session = session.clone();
    lua.globals().set(
        "sendHubCommand",
        lua.create_function(move |_, value: Value| {
            let json = lua_to_json(&value)?.unwrap_or(serde_json::Value::Null);
            let action = Action::decode(&json)
                .map_err(|e| mlua::Error::runtime(format!("sendHubCommand: {}", e)))?;
            if let Some(action) = action {
                session.effects.push(Effect::SendHubCommand(action));
            }
            Ok(())
        })?,
    )
}

pub(super) fn install_children(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let s = session.clone();
    lua.globals().set(
        "getChildDevices",
        lua.create_function(move |lua, ()| {
            let children = lua.create_table()?;
            for snapshot in s.host.child_devices(&s.entity) {
                children.push(s.device_handle(snapshot).into_lua(lua)?)?;
            }
            Ok(children)
        })?,
    )?;

    let s = session.clone();
    lua.globals().set(
        "addChildDevice",
        lua.create_function(
            move |lua, (namespace, type_name, dni, fourth, fifth): (String, String, String, Value, Value)| {
                // addChildDevice(ns, type, dni[, hubId], options)
                let options = match (fourth, fifth) {
                    (Value::Table(options), _) => Some(options),
                    (_, Value::Table(options)) => Some(options),
                    _ => None,
                };
                let mut request = ChildDeviceRequest {
                    namespace,
                    type_name,
                    device_network_id: dni,
                    ..Default::default()
                };
                if let Some(options) = options {
                    request.label = options.get("label")?;
                    request.name = options.get("name")?;
                    if let Some(serde_json::Value::Object(data)) =
                        lua_to_json(&options.get::<Value>("data")?)?
                    {
                        request.data = data;
                    }
                }
                let child = s
                    .host
                    .add_child_device(&s.entity, request)
                    .map_err(mlua::Error::runtime)?;
                s.device_handle(child).into_lua(lua)
            },
        )?,
    )
}

pub(super) fn install_location(lua: &Lua, session: &Rc<Session>) -> LuaResult<()> {
    let location = lua.create_userdata(LocationHandle {
        info: session.location.clone(),
    })?;
    lua.globals().set("location", location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_recurrence_expressions_are_well_formed() {
        let mut rng = StdRng::seed_from_u64(7);
        for (_, period) in RECURRENCES {
            let expression = recurrence_expression(*period, &mut rng);
            assert_eq!(expression.split_whitespace().count(), 6, "{}", expression);
        }
        let hourly = recurrence_expression(Period::Hours(3), &mut rng);
        assert!(hourly.split_whitespace().nth(2).unwrap().ends_with("/3"));
    }

    #[test]
    fn test_parse_datetime_formats() {
        let expected = DateTime::parse_from_rfc3339("2024-05-01T07:30:00Z").unwrap();
        for text in [
            "2024-05-01T07:30:00Z",
            "2024-05-01T07:30:00.000+0000",
            "2024-05-01T07:30:00",
            "2024-05-01 07:30:00",
        ] {
            assert_eq!(parse_datetime(text), Some(expected.with_timezone(&Utc)), "{}", text);
        }
        assert!(parse_datetime("2024-05-01").is_some());
        assert!(parse_datetime("tomorrow").is_none());
    }
}
