//! Lua <-> JSON conversion
//!
//! Conversion to JSON strips whatever JSON cannot hold (functions, userdata,
//! coroutines, non-finite numbers), the same way a JSON round trip would.

use mlua::{Lua, Result as LuaResult, Table, Value as LuaValue};
use serde_json::{Map, Number, Value};

const MAX_DEPTH: usize = 64;

pub(crate) fn json_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Object(map) => LuaValue::Table(map_to_table(lua, map)?),
    })
}

pub(crate) fn map_to_table(lua: &Lua, map: &Map<String, Value>) -> LuaResult<Table> {
    let table = lua.create_table_with_capacity(0, map.len())?;
    for (key, item) in map {
        table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
    }
    Ok(table)
}

/// Convert a Lua value, returning `None` for values JSON cannot represent
pub(crate) fn lua_to_json(value: &LuaValue) -> LuaResult<Option<Value>> {
    to_json(value, 0)
}

/// Convert a Lua value that must be an object; anything else reads as empty
pub(crate) fn lua_to_object(value: &LuaValue) -> LuaResult<Map<String, Value>> {
    Ok(match lua_to_json(value)? {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    })
}

fn to_json(value: &LuaValue, depth: usize) -> LuaResult<Option<Value>> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::runtime("value nested too deeply (cyclic table?)"));
    }
    Ok(match value {
        LuaValue::Nil => Some(Value::Null),
        LuaValue::Boolean(b) => Some(Value::Bool(*b)),
        LuaValue::Integer(i) => Some(Value::Number((*i).into())),
        LuaValue::Number(n) => Number::from_f64(*n).map(Value::Number),
        LuaValue::String(s) => Some(Value::String(lua_string(s))),
        LuaValue::Table(table) => Some(table_to_json(table, depth)?),
        _ => None,
    })
}

fn table_to_json(table: &Table, depth: usize) -> LuaResult<Value> {
    let len = table.raw_len();
    let mut entries = 0usize;
    let mut map = Map::new();

    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let (key, item) = pair?;
        entries += 1;
        let key = match key {
            LuaValue::String(s) => lua_string(&s),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => n.to_string(),
            _ => continue,
        };
        if let Some(item) = to_json(&item, depth + 1)? {
            map.insert(key, item);
        }
    }

    // A pure sequence becomes an array; empty tables are objects
    if len > 0 && entries == len {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            let item: LuaValue = table.raw_get(i)?;
            if let Some(item) = to_json(&item, depth + 1)? {
                items.push(item);
            }
        }
        return Ok(Value::Array(items));
    }
    Ok(Value::Object(map))
}

pub(crate) fn lua_string(s: &mlua::String) -> String {
    s.to_string_lossy().into()
}

/// Human-readable rendering for log lines
pub(crate) fn display(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => lua_string(s),
        LuaValue::Table(_) => match lua_to_json(value) {
            Ok(Some(json)) => json.to_string(),
            _ => "<table>".to_string(),
        },
        other => format!("<{}>", other.type_name()),
    }
}

/// Render a scalar as an event value string
pub(crate) fn value_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_through_lua() {
        let lua = Lua::new();
        let original = json!({"a": [1, 2.5, "x"], "b": {"c": true}});
        let value = json_to_lua(&lua, &original).unwrap();
        assert_eq!(lua_to_json(&value).unwrap(), Some(original));
    }

    #[test]
    fn test_functions_are_stripped() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load(r#"return { keep = 1, drop = function() end, list = { 1, print } }"#)
            .eval()
            .unwrap();
        assert_eq!(
            lua_to_json(&value).unwrap(),
            Some(json!({"keep": 1, "list": [1]}))
        );
    }

    #[test]
    fn test_mixed_keys_become_object() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load(r#"return { "first", name = "lamp", [5] = true }"#)
            .eval()
            .unwrap();
        assert_eq!(
            lua_to_json(&value).unwrap(),
            Some(json!({"1": "first", "name": "lamp", "5": true}))
        );
    }

    #[test]
    fn test_empty_table_is_object_and_cycles_fail() {
        let lua = Lua::new();
        let empty: LuaValue = lua.load("return {}").eval().unwrap();
        assert_eq!(lua_to_json(&empty).unwrap(), Some(json!({})));

        let cyclic: LuaValue = lua.load("local t = {}; t.self = t; return t").eval().unwrap();
        assert!(lua_to_json(&cyclic).is_err());
    }
}
