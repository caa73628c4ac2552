//! Embedded Lua sandbox for node scripts.
//!
//! A script sees only what the host injects:
//!
//! - `vars.get(k)`, `vars.set(k, v)`, `vars.delete(k)`, `vars.all()`
//! - `log.debug/info/warn/error(...)` and `print(...)`
//! - `http.request{method, url, headers, body, json}` and `http.get(url)`
//! - `wait(reason?)`
//!
//! Only the `table`, `string`, `math` and `utf8` standard libraries are
//! opened, so there is no filesystem, process or module loading access.

use std::sync::{Arc, Mutex};

use mlua::{
    DeserializeOptions, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, Table,
    Value as LuaValue, Variadic,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use flowloom_core::config::SandboxConfig;
use flowloom_core::event::FlowEvent;
use flowloom_core::traits::{EventSink, NetworkClient};
use flowloom_core::types::{HttpRequest, LogLevel};
use flowloom_core::vars::{StoreVars, WAIT_FLAG, WAIT_REASON};

/// What a script left behind.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    /// Vars after the script, including writes made before any error.
    pub vars: StoreVars,
    /// Error raised by the script, if any.
    pub error: Option<String>,
}

/// Executes node scripts with a fixed capability set.
///
/// Stateless between calls: each invocation gets a fresh Lua state.
#[derive(Clone)]
pub struct ScriptSandbox {
    network: Arc<dyn NetworkClient>,
    memory_limit: usize,
}

/// Everything the host functions close over.
#[derive(Clone)]
struct HostContext {
    node_id: String,
    vars: Arc<Mutex<StoreVars>>,
    sink: Arc<dyn EventSink>,
    network: Arc<dyn NetworkClient>,
    handle: Handle,
}

impl HostContext {
    fn with_vars<R>(&self, f: impl FnOnce(&mut StoreVars) -> R) -> mlua::Result<R> {
        let mut vars = self
            .vars
            .lock()
            .map_err(|_| mlua::Error::RuntimeError("store vars lock poisoned".into()))?;
        Ok(f(&mut vars))
    }

    /// Apply a write and publish the resulting snapshot.
    fn write(&self, f: impl FnOnce(&mut StoreVars)) -> mlua::Result<()> {
        let snapshot = self.with_vars(|vars| {
            f(vars);
            vars.clone()
        })?;
        self.sink.emit(FlowEvent::StoreVarsUpdate { vars: snapshot });
        Ok(())
    }

    fn log(&self, level: LogLevel, args: Vec<Value>) {
        debug!(node_id = %self.node_id, ?level, ?args, "Script log");
        self.sink.emit(FlowEvent::NodeLog {
            node_id: self.node_id.clone(),
            level,
            args,
        });
    }
}

impl ScriptSandbox {
    pub fn new(network: Arc<dyn NetworkClient>, config: &SandboxConfig) -> Self {
        Self {
            network,
            memory_limit: config.memory_limit_bytes,
        }
    }

    /// Run `script` for `node_id` against `vars`.
    ///
    /// The Lua state runs on the blocking pool; network calls made by the
    /// script are driven on the current runtime. Script failures are returned
    /// in the outcome, never as a panic or an `Err`.
    pub async fn execute(
        &self,
        node_id: &str,
        script: &str,
        vars: StoreVars,
        sink: Arc<dyn EventSink>,
    ) -> ScriptOutcome {
        let shared = Arc::new(Mutex::new(vars));
        let ctx = HostContext {
            node_id: node_id.to_string(),
            vars: shared.clone(),
            sink,
            network: self.network.clone(),
            handle: Handle::current(),
        };
        let script = script.to_string();
        let memory_limit = self.memory_limit;

        let result = tokio::task::spawn_blocking(move || run_script(ctx, &script, memory_limit))
            .await
            .unwrap_or_else(|e| Err(format!("script task failed: {}", e)));

        let vars = match shared.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        if let Err(ref error) = result {
            warn!(node_id = %node_id, error = %error, "Node script failed");
        }

        ScriptOutcome {
            vars,
            error: result.err(),
        }
    }
}

fn run_script(ctx: HostContext, script: &str, memory_limit: usize) -> Result<(), String> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )
    .map_err(|e| e.to_string())?;
    if memory_limit > 0 {
        lua.set_memory_limit(memory_limit).map_err(|e| e.to_string())?;
    }

    install(&lua, &ctx).map_err(|e| e.to_string())?;

    lua.load(script)
        .set_name(format!("node:{}", ctx.node_id))
        .exec()
        .map_err(|e| e.to_string())
}

fn install(lua: &Lua, ctx: &HostContext) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set("vars", vars_table(lua, ctx)?)?;
    globals.set("log", log_table(lua, ctx)?)?;
    globals.set("http", http_table(lua, ctx)?)?;

    let c = ctx.clone();
    globals.set(
        "print",
        lua.create_function(move |lua, args: Variadic<LuaValue>| {
            c.log(LogLevel::Info, to_json_args(lua, args)?);
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    globals.set(
        "wait",
        lua.create_function(move |_, reason: Option<String>| {
            c.write(|vars| {
                vars.set(WAIT_FLAG, Value::Bool(true));
                match reason {
                    Some(reason) => vars.set(WAIT_REASON, Value::String(reason)),
                    None => vars.set(WAIT_REASON, Value::Null),
                };
            })
        })?,
    )?;
    Ok(())
}

fn vars_table(lua: &Lua, ctx: &HostContext) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let c = ctx.clone();
    table.set(
        "get",
        lua.create_function(move |lua, key: String| {
            let value = c.with_vars(|vars| vars.resolve(&key).cloned())?;
            match value {
                Some(v) => to_lua(lua, &v),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let c = ctx.clone();
    table.set(
        "set",
        lua.create_function(move |lua, (key, value): (String, LuaValue)| {
            let value = from_lua(lua, value)?;
            c.write(|vars| {
                vars.set(&key, value);
            })
        })?,
    )?;

    let c = ctx.clone();
    table.set(
        "delete",
        lua.create_function(move |_, key: String| {
            c.write(|vars| {
                vars.remove(&key);
            })
        })?,
    )?;

    let c = ctx.clone();
    table.set(
        "all",
        lua.create_function(move |lua, ()| {
            let snapshot = c.with_vars(|vars| vars.to_value())?;
            to_lua(lua, &snapshot)
        })?,
    )?;

    Ok(table)
}

fn log_table(lua: &Lua, ctx: &HostContext) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (name, level) in [
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        let c = ctx.clone();
        table.set(
            name,
            lua.create_function(move |lua, args: Variadic<LuaValue>| {
                c.log(level, to_json_args(lua, args)?);
                Ok(())
            })?,
        )?;
    }
    Ok(table)
}

fn http_table(lua: &Lua, ctx: &HostContext) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let c = ctx.clone();
    table.set(
        "request",
        lua.create_function(move |lua, spec: Table| {
            let request: HttpRequest = lua.from_value_with(
                LuaValue::Table(spec),
                DeserializeOptions::new().deny_unsupported_types(false),
            )?;
            perform(lua, &c, request)
        })?,
    )?;

    let c = ctx.clone();
    table.set(
        "get",
        lua.create_function(move |lua, url: String| perform(lua, &c, HttpRequest::get(url)))?,
    )?;

    Ok(table)
}

/// Issue a request through the injected client and shape the response as
/// `{status, headers, body, json}`.
fn perform(lua: &Lua, ctx: &HostContext, request: HttpRequest) -> mlua::Result<Table> {
    debug!(node_id = %ctx.node_id, method = %request.method, url = %request.url, "Script HTTP request");
    let response = ctx
        .handle
        .block_on(ctx.network.request(request))
        .map_err(mlua::Error::external)?;

    let table = lua.create_table()?;
    table.set("status", response.status)?;
    let headers = lua.create_table()?;
    for (k, v) in &response.headers {
        headers.set(k.as_str(), v.as_str())?;
    }
    table.set("headers", headers)?;
    if let Some(json) = response.json() {
        table.set("json", to_lua(lua, &json)?)?;
    }
    table.set("body", response.body)?;
    Ok(table)
}

fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

fn from_lua(lua: &Lua, value: LuaValue) -> mlua::Result<Value> {
    lua.from_value_with(value, DeserializeOptions::new().deny_unsupported_types(false))
}

fn to_json_args(lua: &Lua, args: Variadic<LuaValue>) -> mlua::Result<Vec<Value>> {
    args.into_iter()
        .map(|arg| match arg {
            LuaValue::String(s) => Ok(Value::String(s.to_string_lossy().to_string())),
            other => from_lua(lua, other),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowloom_core::types::HttpResponse;
    use flowloom_test_utils::{CollectingSink, MockNetwork};
    use serde_json::json;

    fn sandbox(network: MockNetwork) -> ScriptSandbox {
        ScriptSandbox::new(Arc::new(network), &SandboxConfig::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_vars_roundtrip() {
        let sink = Arc::new(CollectingSink::new());
        let mut vars = StoreVars::new();
        vars.set("count", json!(2));

        let outcome = sandbox(MockNetwork::new())
            .execute(
                "A",
                r#"
                local n = vars.get("Count")
                vars.set("Doubled Count", n * 2)
                vars.set("profile", { name = "ada", tags = { "x", "y" } })
                vars.delete("count")
                "#,
                vars,
                sink.clone(),
            )
            .await;

        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.vars.get("doubled_count"), Some(&json!(4)));
        assert_eq!(outcome.vars.resolve("profile:tags.1"), Some(&json!("y")));
        assert!(!outcome.vars.contains("count"));
        // One snapshot per write.
        assert_eq!(sink.names().iter().filter(|n| **n == "store_vars_update").count(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_keeps_prior_writes() {
        let sink = Arc::new(CollectingSink::new());
        let outcome = sandbox(MockNetwork::new())
            .execute(
                "A",
                r#"
                vars.set("before", true)
                error("kaboom")
                vars.set("after", true)
                "#,
                StoreVars::new(),
                sink,
            )
            .await;

        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("kaboom")));
        assert_eq!(outcome.vars.get("before"), Some(&json!(true)));
        assert!(!outcome.vars.contains("after"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_io_libraries() {
        let outcome = sandbox(MockNetwork::new())
            .execute(
                "A",
                "io.open('/etc/passwd')",
                StoreVars::new(),
                Arc::new(CollectingSink::new()),
            )
            .await;
        assert!(outcome.error.is_some());

        let outcome = sandbox(MockNetwork::new())
            .execute("A", "os.exit(1)", StoreVars::new(), Arc::new(CollectingSink::new()))
            .await;
        assert!(outcome.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_logging_and_wait() {
        let sink = Arc::new(CollectingSink::new());
        let outcome = sandbox(MockNetwork::new())
            .execute(
                "A",
                r#"
                print("hello", 42)
                log.warn("careful")
                wait("manager approval")
                "#,
                StoreVars::new(),
                sink.clone(),
            )
            .await;

        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert!(outcome.vars.is_waiting());
        assert_eq!(outcome.vars.wait_reason().as_deref(), Some("manager approval"));

        let logs: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::NodeLog { level, args, .. } => Some((level, args)),
                _ => None,
            })
            .collect();
        assert_eq!(logs[0], (LogLevel::Info, vec![json!("hello"), json!(42)]));
        assert_eq!(logs[1].0, LogLevel::Warn);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_http_capability() {
        let network = MockNetwork::new().respond(
            "https://api.test/orders",
            HttpResponse {
                status: 200,
                headers: Default::default(),
                body: r#"{"count": 3}"#.into(),
            },
        );
        let requests = network.requests();
        let outcome = sandbox(network)
            .execute(
                "Fetch",
                r#"
                local res = http.request{ method = "POST", url = "https://api.test/orders", json = { page = 1 } }
                vars.set("status", res.status)
                vars.set("count", res.json.count)
                "#,
                StoreVars::new(),
                Arc::new(CollectingSink::new()),
            )
            .await;

        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.vars.get("status"), Some(&json!(200)));
        assert_eq!(outcome.vars.get("count"), Some(&json!(3)));
        let sent = requests.lock().unwrap();
        assert_eq!(sent[0].method, "POST");
        assert_eq!(sent[0].json, Some(json!({"page": 1})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_http_failure_is_script_error() {
        let outcome = sandbox(MockNetwork::new())
            .execute(
                "Fetch",
                "http.get('https://unreachable.test')",
                StoreVars::new(),
                Arc::new(CollectingSink::new()),
            )
            .await;
        assert!(outcome.error.is_some());
    }
}
