//! Lua script engine.
//!
//! All modules share one sandboxed Lua state. A script defines itself with
//!
//! ```lua
//! local M = define_module { id = "clock", required = { "core" } }
//! function M:start(ctx) ctx:every(1000, function() ctx:emit("tick") end) end
//! ```
//!
//! `define_module` writes into the engine's bootstrap slot and returns the
//! table so lifecycle methods can be attached to it. Lifecycle methods
//! receive a `ctx` userdata wrapping the module's [`ModuleContext`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use mlua::{Function, Lua, LuaSerdeExt, Table, UserData, UserDataMethods, Value as LuaValue, Variadic};
use modhost_core::{HostUser, ModuleAction, ModuleMetadata, NotifyLevel};
use modhost_events::{EventCallback, EventOptions};
use modhost_hooks::{HookCallback, HookKind, HostFn};
use modhost_logging::redact_url;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::ModuleContext;
use crate::engine::{BootstrapSlot, ModuleDefinition, ScriptEngine};
use crate::ledger::ResourceId;
use crate::lifecycle::ModuleBehavior;
use crate::settings::SettingDefinition;

const MEMORY_LIMIT: usize = 64 * 1024 * 1024;

fn lua_error(e: mlua::Error) -> anyhow::Error {
    anyhow!("{e}")
}

trait LuaResultExt<T> {
    fn or_anyhow(self) -> anyhow::Result<T>;
}

impl<T> LuaResultExt<T> for mlua::Result<T> {
    fn or_anyhow(self) -> anyhow::Result<T> {
        self.map_err(lua_error)
    }
}

pub struct LuaEngine {
    lua: Lua,
    slot: BootstrapSlot,
}

impl LuaEngine {
    pub fn new() -> anyhow::Result<Self> {
        let lua = Lua::new();
        let slot = BootstrapSlot::new();
        sandbox(&lua).or_anyhow()?;
        install_define_module(&lua, &slot).or_anyhow()?;
        Ok(Self { lua, slot })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

#[async_trait]
impl ScriptEngine for LuaEngine {
    async fn execute(&self, url: &str, source: &str) -> anyhow::Result<()> {
        self.lua.load(source).set_name(redact_url(url)).exec().or_anyhow()
    }

    fn slot(&self) -> &BootstrapSlot {
        &self.slot
    }
}

/// Strip host-escaping libraries and route `print` to the log.
fn sandbox(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in ["os", "io", "load", "loadfile", "dofile", "debug"] {
        globals.set(name, LuaValue::Nil)?;
    }
    if let Ok(package) = globals.get::<Table>("package") {
        package.set("loadlib", LuaValue::Nil)?;
        package.set("cpath", LuaValue::Nil)?;
    }
    lua.set_memory_limit(MEMORY_LIMIT)?;

    let print = lua.create_function(|_, parts: Variadic<LuaValue>| {
        let line: Vec<String> = parts.iter().map(display_value).collect();
        info!(target: "lua", "{}", line.join("\t"));
        Ok(())
    })?;
    globals.set("print", print)?;
    Ok(())
}

fn display_value(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

fn install_define_module(lua: &Lua, slot: &BootstrapSlot) -> mlua::Result<()> {
    let slot = slot.clone();
    let define = lua.create_function(move |lua, table: Table| {
        let metadata = read_metadata(&table)?;
        slot.put(ModuleDefinition {
            metadata,
            behavior: Arc::new(LuaModule { lua: lua.clone(), table: table.clone() }),
        });
        Ok(table)
    })?;
    lua.globals().set("define_module", define)
}

fn read_metadata(table: &Table) -> mlua::Result<ModuleMetadata> {
    let text = |key: &str| -> mlua::Result<String> { Ok(table.get::<Option<String>>(key)?.unwrap_or_default()) };
    let list = |key: &str| -> mlua::Result<Vec<String>> { Ok(table.get::<Option<Vec<String>>>(key)?.unwrap_or_default()) };
    Ok(ModuleMetadata {
        id: text("id")?,
        name: text("name")?,
        description: text("description")?,
        version: table.get::<Option<String>>("version")?,
        authors: list("authors")?,
        tags: list("tags")?,
        required: list("required")?,
        optional: list("optional")?,
        url: None,
    })
}

/// Behavior backed by the table a script passed to `define_module`.
struct LuaModule {
    lua: Lua,
    table: Table,
}

impl LuaModule {
    /// Call `table:method(ctx, extra)` if the script defined it.
    fn invoke(&self, method: &str, ctx: &ModuleContext, extra: Option<LuaValue>) -> anyhow::Result<()> {
        let Some(f) = self.table.get::<Option<Function>>(method).or_anyhow()? else {
            return Ok(());
        };
        let handle = self.lua.create_userdata(LuaContext(ctx.clone())).or_anyhow()?;
        match extra {
            Some(extra) => f.call::<()>((self.table.clone(), handle, extra)),
            None => f.call::<()>((self.table.clone(), handle)),
        }
        .or_anyhow()
    }
}

#[async_trait]
impl ModuleBehavior for LuaModule {
    async fn load(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self.invoke("load", ctx, None)
    }

    async fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self.invoke("start", ctx, None)
    }

    async fn stop(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self.invoke("stop", ctx, None)
    }

    async fn on_login(&self, ctx: &ModuleContext, user: &HostUser) -> anyhow::Result<()> {
        let user = self.lua.to_value(user).or_anyhow()?;
        self.invoke("on_login", ctx, Some(user))
    }
}

fn json_args(lua: &Lua, args: &Variadic<LuaValue>) -> mlua::Result<Vec<Value>> {
    args.iter().map(|v| lua.from_value::<Value>(v.clone())).collect()
}

fn notify_level(level: &str) -> NotifyLevel {
    match level {
        "warn" | "warning" => NotifyLevel::Warn,
        "error" => NotifyLevel::Error,
        _ => NotifyLevel::Info,
    }
}

/// Wrap a Lua function as a hook of the given kind.
fn lua_hook(lua: &Lua, kind: HookKind, f: Function) -> HookCallback {
    let lua = lua.clone();
    match kind {
        HookKind::Pre => HookCallback::pre(move |args: &mut Vec<Value>| {
            let table = lua.to_value(&*args).or_anyhow()?;
            f.call::<()>(table.clone()).or_anyhow()?;
            *args = lua.from_value(table).or_anyhow()?;
            Ok(())
        }),
        HookKind::Post => HookCallback::post(move |result: &Value, args: &[Value]| {
            let result = lua.to_value(result).or_anyhow()?;
            let args = lua.to_value(&args).or_anyhow()?;
            let out: LuaValue = f.call((result, args)).or_anyhow()?;
            if out.is_nil() { Ok(None) } else { Ok(Some(lua.from_value(out).or_anyhow()?)) }
        }),
        HookKind::Void => HookCallback::void(move |args: &[Value]| {
            let args = lua.to_value(&args).or_anyhow()?;
            f.call::<()>(args).or_anyhow()
        }),
        HookKind::Replace => HookCallback::replace(move |original: &HostFn, args: &[Value]| {
            let original = Arc::clone(original);
            let original = lua
                .create_function(move |lua, call_args: Variadic<LuaValue>| {
                    let call_args = json_args(lua, &call_args)?;
                    lua.to_value(&original(&call_args[..]))
                })
                .or_anyhow()?;
            let args = lua.to_value(&args).or_anyhow()?;
            let out: LuaValue = f.call((original, args)).or_anyhow()?;
            lua.from_value(out).or_anyhow()
        }),
    }
}

/// The `ctx` object Lua lifecycle methods receive.
struct LuaContext(ModuleContext);

impl UserData for LuaContext {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("id", |_, this, ()| Ok(this.0.id().to_string()));

        methods.add_method("log", |_, this, message: String| {
            info!(module = %this.0.id(), "{message}");
            Ok(())
        });

        methods.add_method("notify", |_, this, (level, message): (String, String)| {
            this.0.notify(notify_level(&level), &message);
            Ok(())
        });

        methods.add_method("register_event", |lua, this, (name, options): (String, Option<LuaValue>)| {
            let options = match options {
                Some(v) => lua.from_value::<EventOptions>(v)?,
                None => EventOptions::default(),
            };
            this.0.register_event(&name, options);
            Ok(())
        });

        methods.add_method("emit", |lua, this, (name, payload): (String, Option<LuaValue>)| {
            let payload = match payload {
                Some(v) => lua.from_value::<Value>(v)?,
                None => Value::Null,
            };
            Ok(this.0.emit(&name, payload))
        });

        methods.add_method("on", |lua, this, (name, f): (String, Function)| {
            let lua = lua.clone();
            let callback: EventCallback = Arc::new(move |event: &str, payload: &Value| {
                let payload = lua.to_value(payload).or_anyhow()?;
                f.call::<()>((event.to_string(), payload)).or_anyhow()
            });
            Ok(this.0.on(&name, callback).as_u64())
        });

        methods.add_method("every", |_, this, (ms, f): (u64, Function)| {
            let module = this.0.id().to_string();
            let id = this.0.every(Duration::from_millis(ms), move || {
                if let Err(e) = f.call::<()>(()) {
                    warn!(module = %module, error = %e, "Interval callback failed");
                }
            });
            Ok(id.as_u64())
        });

        methods.add_method("after", |_, this, (ms, f): (u64, Function)| {
            let module = this.0.id().to_string();
            let id = this.0.after(Duration::from_millis(ms), move || {
                if let Err(e) = f.call::<()>(()) {
                    warn!(module = %module, error = %e, "Timeout callback failed");
                }
            });
            Ok(id.as_u64())
        });

        methods.add_method("release", |_, this, id: u64| Ok(this.0.release(ResourceId(id))));

        methods.add_method("hook", |lua, this, (path, kind, f): (String, String, Function)| {
            let kind: HookKind = kind.parse().map_err(|e: anyhow::Error| mlua::Error::runtime(e.to_string()))?;
            this.0.hook(&path, lua_hook(lua, kind, f)).map_err(mlua::Error::external)
        });

        methods.add_method("call", |lua, this, (path, args): (String, Variadic<LuaValue>)| {
            let args = json_args(lua, &args)?;
            let out = this.0.call(&path, args).map_err(mlua::Error::external)?;
            lua.to_value(&out)
        });

        methods.add_method("define_setting", |lua, this, definition: LuaValue| {
            let definition: SettingDefinition = lua.from_value(definition)?;
            this.0.settings().define(definition);
            Ok(())
        });

        methods.add_method("get_setting", |lua, this, key: String| lua.to_value(&this.0.settings().get(&key)));

        methods.add_method("set_setting", |lua, this, (key, value): (String, LuaValue)| {
            let value: Value = lua.from_value(value)?;
            let stored = this.0.settings().set(&key, value).map_err(mlua::Error::external)?;
            lua.to_value(&stored)
        });

        methods.add_method(
            "add_action",
            |_, this, (id, title, description): (String, String, Option<String>)| {
                this.0.add_action(ModuleAction { id, title, description: description.unwrap_or_default() });
                Ok(())
            },
        );
    }
}
