//! Declaration-time primitives
//!
//! In extraction mode they collect a [`DriverDefinition`]; during live
//! invocation the same names are harmless no-ops so top-level declarations can
//! run before the requested method.

use std::cell::RefCell;
use std::rc::Rc;

use hub_core::{Command, DefinitionKind, DriverDefinition, Fingerprint, Preference};
use mlua::{Function, Lua, MultiValue, Result as LuaResult, Table, Value};

use crate::convert::{lua_string, lua_to_json};

/// Display-only DSL names accepted and ignored in every mode
const IGNORED: &[&str] = &[
    "attribute",
    "simulator",
    "tiles",
    "mappings",
    "paragraph",
    "href",
];

#[derive(Debug, Default)]
pub(crate) struct DefinitionBuilder {
    declared: bool,
    name: String,
    namespace: String,
    author: String,
    description: Option<String>,
    capabilities: Vec<String>,
    commands: Vec<Command>,
    fingerprints: Vec<Fingerprint>,
    preferences: Vec<Preference>,
    section: Option<String>,
    page: Option<String>,
}

impl DefinitionBuilder {
    pub fn build(self, kind: DefinitionKind, source_id: &str) -> Option<DriverDefinition> {
        if !self.declared {
            return None;
        }
        Some(DriverDefinition {
            id: String::new(),
            kind,
            name: self.name,
            namespace: self.namespace,
            author: self.author,
            description: self.description,
            capabilities: self.capabilities,
            commands: self.commands,
            fingerprints: self.fingerprints,
            preferences: self.preferences,
            source_id: source_id.to_string(),
        })
    }
}

type Shared = Rc<RefCell<DefinitionBuilder>>;

fn string_field(table: &Table, key: &str) -> LuaResult<Option<String>> {
    Ok(match table.get::<Value>(key)? {
        Value::String(s) => Some(lua_string(&s)),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn call_body(body: Option<Function>) -> LuaResult<()> {
    if let Some(body) = body {
        body.call::<()>(())?;
    }
    Ok(())
}

/// Run `body` with the builder's section or page temporarily replaced
fn scoped(
    builder: &Shared,
    set: impl Fn(&mut DefinitionBuilder, Option<String>) -> Option<String>,
    value: Option<String>,
    body: Option<Function>,
) -> LuaResult<()> {
    let previous = set(&mut *builder.borrow_mut(), value);
    let result = call_body(body);
    set(&mut *builder.borrow_mut(), previous);
    result
}

fn parse_input(builder: &DefinitionBuilder, args: MultiValue) -> LuaResult<Preference> {
    let mut args = args.into_iter();
    let (name, input_type, options) = match args.next() {
        Some(Value::Table(table)) => (
            string_field(&table, "name")?,
            string_field(&table, "type")?,
            Some(table),
        ),
        Some(Value::String(name)) => {
            let input_type = match args.next() {
                Some(Value::String(t)) => Some(lua_string(&t)),
                _ => None,
            };
            let options = match args.next() {
                Some(Value::Table(table)) => Some(table),
                _ => None,
            };
            (Some(lua_string(&name)), input_type, options)
        }
        _ => (None, None, None),
    };

    let name = name.ok_or_else(|| mlua::Error::runtime("input requires a name"))?;
    let mut preference = Preference {
        name,
        input_type: input_type.unwrap_or_else(|| "text".to_string()),
        title: None,
        section: builder.section.clone(),
        page: builder.page.clone(),
        multiple: false,
        required: false,
        default_value: None,
        options: Vec::new(),
    };
    if let Some(table) = options {
        preference.title = string_field(&table, "title")?;
        preference.multiple = table.get::<Option<bool>>("multiple")?.unwrap_or(false);
        preference.required = table.get::<Option<bool>>("required")?.unwrap_or(false);
        preference.default_value = lua_to_json(&table.get::<Value>("defaultValue")?)?
            .filter(|v| !v.is_null());
        if let Value::Table(list) = table.get::<Value>("options")? {
            for item in list.sequence_values::<Value>() {
                if let Some(option) = lua_to_json(&item?)? {
                    preference.options.push(crate::convert::value_string(&option));
                }
            }
        }
    }
    Ok(preference)
}

/// Install declaration primitives; `builder` is `Some` in extraction mode
pub(crate) fn install(lua: &Lua, builder: Option<Shared>) -> LuaResult<()> {
    let globals = lua.globals();

    for name in IGNORED {
        globals.set(*name, lua.create_function(|_, _: MultiValue| Ok(()))?)?;
    }

    let Some(builder) = builder else {
        for name in [
            "metadata",
            "definition",
            "capability",
            "command",
            "fingerprint",
            "preferences",
            "section",
            "input",
            "page",
            "dynamicPage",
        ] {
            globals.set(name, lua.create_function(|_, _: MultiValue| Ok(()))?)?;
        }
        return Ok(());
    };

    globals.set(
        "metadata",
        lua.create_function(|_, body: Option<Function>| call_body(body))?,
    )?;

    let b = builder.clone();
    globals.set(
        "definition",
        lua.create_function(move |_, (table, body): (Table, Option<Function>)| {
            {
                let mut builder = b.borrow_mut();
                builder.declared = true;
                builder.name = string_field(&table, "name")?
                    .ok_or_else(|| mlua::Error::runtime("definition requires a name"))?;
                builder.namespace = string_field(&table, "namespace")?.unwrap_or_default();
                builder.author = string_field(&table, "author")?.unwrap_or_default();
                builder.description = string_field(&table, "description")?;
            }
            call_body(body)
        })?,
    )?;

    let b = builder.clone();
    globals.set(
        "capability",
        lua.create_function(move |_, name: String| {
            let mut builder = b.borrow_mut();
            if !builder.capabilities.contains(&name) {
                builder.capabilities.push(name);
            }
            Ok(())
        })?,
    )?;

    let b = builder.clone();
    globals.set(
        "command",
        lua.create_function(move |_, (name, args): (String, Option<Vec<String>>)| {
            b.borrow_mut().commands.push(Command {
                name,
                args: args.unwrap_or_default(),
            });
            Ok(())
        })?,
    )?;

    let b = builder.clone();
    globals.set(
        "fingerprint",
        lua.create_function(move |_, table: Table| {
            let mut pairs = Vec::new();
            for pair in table.pairs::<String, Value>() {
                let (key, value) = pair?;
                if let Some(value) = lua_to_json(&value)? {
                    pairs.push((key, crate::convert::value_string(&value)));
                }
            }
            let fingerprint =
                Fingerprint::from_map(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            b.borrow_mut().fingerprints.push(fingerprint);
            Ok(())
        })?,
    )?;

    globals.set(
        "preferences",
        lua.create_function(|_, body: Value| match body {
            Value::Function(body) => body.call::<()>(()),
            _ => Ok(()),
        })?,
    )?;

    let b = builder.clone();
    globals.set(
        "section",
        lua.create_function(move |_, args: MultiValue| {
            let mut title = None;
            let mut body = None;
            for arg in args {
                match arg {
                    Value::String(s) => title = Some(lua_string(&s)),
                    Value::Table(t) => title = string_field(&t, "title")?.or(title),
                    Value::Function(f) => body = Some(f),
                    _ => {}
                }
            }
            scoped(&b, |builder, v| std::mem::replace(&mut builder.section, v), title, body)
        })?,
    )?;

    let b = builder.clone();
    let page = lua.create_function(move |_, (table, body): (Table, Option<Function>)| {
        let name = string_field(&table, "name")?;
        scoped(&b, |builder, v| std::mem::replace(&mut builder.page, v), name, body)
    })?;
    globals.set("page", page.clone())?;
    globals.set("dynamicPage", page)?;

    let b = builder;
    globals.set(
        "input",
        lua.create_function(move |_, args: MultiValue| {
            let preference = parse_input(&b.borrow(), args)?;
            b.borrow_mut().preferences.push(preference);
            Ok(())
        })?,
    )?;

    Ok(())
}
