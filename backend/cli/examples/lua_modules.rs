//! Two Lua modules served from local files: `core` exposes a setting and an
//! event, `greeter` requires it and rewrites every `chat.send` call.
//!
//! Run with `cargo run -p modhost-cli --example lua_modules`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use modhost_hooks::HostFunctions;
use modhost_logging::init_logger;
use modhost_plugins::Orchestrator;
use serde_json::{json, Value};
use tracing::info;

const CORE: &str = r#"
local M = define_module { id = "core", name = "Core", version = "0.3.0" }

function M:load(ctx)
    ctx:register_event("core.ready", { description = "Core finished starting" })
end

function M:start(ctx)
    ctx:emit("core.ready", { at = "start" })
end
"#;

const GREETER: &str = r#"
local M = define_module { id = "greeter", name = "Greeter", required = { "core" } }

function M:load(ctx)
    ctx:define_setting({ key = "greeting", kind = { type = "text" }, default = "hello" })
end

function M:start(ctx)
    ctx:hook("chat.send", "pre", function(args)
        args[1] = ctx:get_setting("greeting") .. ", " .. args[1]
    end)
    ctx:every(250, function() ctx:log("still greeting") end)
end
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging
    let _guard = init_logger(None, "info");

    // 2. Scripts on disk, loaded through file:// URLs
    let dir = std::env::temp_dir().join("modhost-demo");
    tokio::fs::create_dir_all(&dir).await?;
    let mut urls = Vec::new();
    for (name, body) in [("greeter.lua", GREETER), ("core.lua", CORE)] {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await?;
        urls.push(format!("file://{}", path.display()));
    }

    // 3. Host functions modules can hook
    let host = Arc::new(HostFunctions::new());
    host.define("chat.send", |args: &[Value]| {
        json!({ "sent": args.first().cloned().unwrap_or(Value::Null) })
    });

    // 4. Load and start; greeter waits for core
    let orchestrator = Orchestrator::builder().host(Arc::clone(&host)).build()?;
    orchestrator.load_urls(&urls).await;
    let report = orchestrator.start_all().await;
    info!(started = ?report.started, failed = ?report.failed, "Started");

    info!(result = %host.call("chat.send", vec![json!("world")])?, "Hooked call");
    tokio::time::sleep(Duration::from_millis(600)).await;

    // 5. Stop releases the hook and the interval
    orchestrator.stop_all().await;
    info!(result = %host.call("chat.send", vec![json!("world")])?, "Plain call");
    Ok(())
}
