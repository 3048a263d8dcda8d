//! JavaScript Runtime Module
//!
//! One `SourceRuntime` owns one `deno_core::JsRuntime` (and so one V8
//! isolate) for one activated plugin. It is not `Send`; `js_wrapper` keeps it
//! on a dedicated thread.

use anyhow::{anyhow, Context, Result};
use deno_core::{v8, JsRuntime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use super::js_bindings::{create_runtime, HostScope, MANDATORY_METHODS};
use super::types::Capabilities;

/// Context handed to the plugin constructor
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceContext {
    pub id: String,
    pub name: String,
    pub version: String,
    pub base_url: String,
}

/// What the instantiated plugin turned out to implement
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeReport {
    /// Mandatory methods that are not functions
    pub missing: Vec<String>,
    pub implemented: Capabilities,
}

/// JavaScript runtime wrapper for one plugin
pub struct SourceRuntime {
    runtime: JsRuntime,
    plugin_id: String,
}

impl SourceRuntime {
    pub fn new(scope: HostScope) -> Result<Self> {
        let plugin_id = scope.plugin_id.clone();
        debug!(plugin_id = %plugin_id, "Creating JavaScript runtime");
        let runtime = create_runtime(scope)?;
        Ok(Self { runtime, plugin_id })
    }

    /// Handle that can stop running script from another thread
    pub fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Evaluate the rewritten module at `path`, instantiate its default
    /// export and report which methods it provides
    pub fn load_module(&mut self, path: &Path, context: &SourceContext) -> Result<ProbeReport> {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plugin module: {}", path.display()))?;

        let context_json = serde_json::to_string(context).context("Failed to serialize plugin context")?;
        self.runtime
            .execute_script(
                "<source_context>",
                format!("globalThis.__source_context = Object.freeze({});", context_json).into(),
            )
            .context("Failed to install plugin context")?;

        self.runtime
            .execute_script("<source_module>", code.into())
            .map_err(|e| anyhow!("Failed to evaluate plugin module: {}", e))?;

        let mandatory = serde_json::to_string(&MANDATORY_METHODS).context("Failed to serialize method list")?;
        let instantiate = format!(
            r#"
            (() => {{
                const factory = globalThis.__source_factory;
                delete globalThis.__source_factory;
                if (typeof factory !== 'function') {{
                    throw new Error('plugin module did not load');
                }}
                const module = {{ exports: {{}} }};
                factory(module, module.exports, globalThis.__host);
                const exported = module.exports
                    && Object.prototype.hasOwnProperty.call(module.exports, 'default')
                    ? module.exports.default
                    : module.exports;
                const instance = typeof exported === 'function'
                    ? new exported(globalThis.__source_context)
                    : exported;
                if (!(instance instanceof globalThis.__host.BaseSource)) {{
                    throw new Error('default export is not a BaseSource');
                }}
                globalThis.__source_instance = instance;
                const has = (name) => typeof instance[name] === 'function';
                return JSON.stringify({{
                    missing: {mandatory}.filter((name) => !has(name)),
                    implemented: {{
                        search: has('search'),
                        latest: has('getLatest'),
                        popular: has('getPopular'),
                        trending: has('getTrending'),
                    }},
                }});
            }})()
            "#
        );

        let value = self
            .runtime
            .execute_script("<source_instantiate>", instantiate.into())
            .map_err(|e| anyhow!("Failed to instantiate plugin: {}", e))?;

        let report = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, value);
            let text = local
                .to_string(scope)
                .ok_or_else(|| anyhow!("Instantiation produced no report"))?
                .to_rust_string_lossy(scope);
            serde_json::from_str::<ProbeReport>(&text)
                .with_context(|| format!("Malformed instantiation report: {}", text))?
        };

        debug!(plugin_id = %self.plugin_id, missing = ?report.missing, "Plugin instantiated");
        Ok(report)
    }

    /// Call a plugin method and wait for its (possibly async) result
    pub async fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        debug!(plugin_id = %self.plugin_id, method, "Calling plugin method");

        let args_json = serde_json::to_string(args).context("Failed to serialize method arguments")?;

        // Call through the V8 API so arguments are never compiled as script
        {
            let scope = &mut self.runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let invoke_name = v8::String::new(scope, "__source_invoke")
                .ok_or_else(|| anyhow!("Failed to allocate string"))?;
            let invoke_val = global
                .get(scope, invoke_name.into())
                .ok_or_else(|| anyhow!("__source_invoke not found"))?;
            let invoke_func = v8::Local::<v8::Function>::try_from(invoke_val)
                .map_err(|_| anyhow!("__source_invoke is not a function"))?;

            let method_v8 = v8::String::new(scope, method)
                .ok_or_else(|| anyhow!("Failed to allocate string"))?;
            let args_v8 = v8::String::new(scope, &args_json)
                .ok_or_else(|| anyhow!("Failed to allocate string"))?;
            let args_val = v8::json::parse(scope, args_v8)
                .ok_or_else(|| anyhow!("Failed to parse arguments JSON in V8"))?;

            let recv = v8::undefined(scope).into();
            if invoke_func.call(scope, recv, &[method_v8.into(), args_val]).is_none() {
                return Err(anyhow!("Failed to call __source_invoke"));
            }
        }

        self.runtime
            .run_event_loop(Default::default())
            .await
            .context("Failed to run event loop")?;

        let outcome = {
            let scope = &mut self.runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let get_global_string = |scope: &mut v8::HandleScope, key: &str| -> Option<String> {
                let key_str = v8::String::new(scope, key)?;
                let val = global.get(scope, key_str.into())?;
                if val.is_undefined() || val.is_null() {
                    return None;
                }
                Some(val.to_string(scope)?.to_rust_string_lossy(scope))
            };

            let status = get_global_string(scope, "__source_status")
                .ok_or_else(|| anyhow!("Failed to retrieve execution status"))?;

            match status.as_str() {
                "success" => get_global_string(scope, "__source_result")
                    .ok_or_else(|| anyhow!("{} returned no result", method)),
                "error" => Err(anyhow!(
                    "{}",
                    get_global_string(scope, "__source_error").unwrap_or_else(|| "Unknown error".to_string())
                )),
                "pending" => Err(anyhow!("Event loop finished but {} is still pending", method)),
                other => Err(anyhow!("Invalid execution status: {}", other)),
            }
        };

        // Drop references so large results can be collected
        let _ = self.runtime.execute_script(
            "<source_cleanup>",
            "globalThis.__source_result = undefined; globalThis.__source_error = undefined; globalThis.__source_status = undefined;"
                .to_string()
                .into(),
        );

        let text = outcome?;
        serde_json::from_str(&text).with_context(|| format!("{} returned invalid JSON", method))
    }

    /// Request garbage collection
    pub fn garbage_collect(&mut self) {
        debug!(plugin_id = %self.plugin_id, "Requesting garbage collection");
        self.runtime.v8_isolate().low_memory_notification();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::activator::rewrite_module;
    use crate::plugin::test_support::{ESM_PLUGIN, MINIMAL_PLUGIN};
    use std::io::Write;

    fn context() -> SourceContext {
        SourceContext {
            id: "fixture".to_string(),
            name: "Fixture".to_string(),
            version: "1.0.0".to_string(),
            base_url: "https://fixture.example".to_string(),
        }
    }

    fn load(source: &str) -> Result<(SourceRuntime, ProbeReport)> {
        let module = rewrite_module(source).map_err(|e| anyhow!(e))?;
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(module.as_bytes())?;
        file.flush()?;

        let scope = HostScope::new("fixture", Some("fixture.example".to_string()))?;
        let mut runtime = SourceRuntime::new(scope)?;
        let report = runtime.load_module(file.path(), &context())?;
        Ok((runtime, report))
    }

    #[tokio::test]
    async fn test_load_and_call() {
        let (mut runtime, report) = load(MINIMAL_PLUGIN).unwrap();
        assert!(report.missing.is_empty());
        assert!(report.implemented.search);
        assert!(!report.implemented.trending);

        let items = runtime
            .call("search", &[Value::from("one piece"), serde_json::json!({ "page": 2 })])
            .await
            .unwrap();
        assert_eq!(items[0]["title"], "one piece");
        assert_eq!(items[0]["page"], 2);
    }

    #[tokio::test]
    async fn test_esm_plugin_sees_context() {
        let (mut runtime, report) = load(ESM_PLUGIN).unwrap();
        assert!(report.implemented.latest);

        let details = runtime.call("getDetails", &[Value::from("abc")]).await.unwrap();
        assert_eq!(details["id"], "abc");
        assert_eq!(details["url"], "https://fixture.example/title/abc");
    }

    #[tokio::test]
    async fn test_thrown_error_is_reported() {
        let (mut runtime, _) = load(ESM_PLUGIN).unwrap();
        let err = runtime.call("getChildren", &[Value::from("missing")]).await.unwrap_err();
        assert!(err.to_string().contains("no such title"));
    }

    #[test]
    fn test_missing_methods_reported() {
        let source = "class Partial extends BaseSource { async search() { return []; } }\nmodule.exports = Partial;";
        let (_, report) = load(source).unwrap();
        assert!(report.missing.contains(&"getDetails".to_string()));
        assert!(!report.missing.contains(&"search".to_string()));
    }

    #[test]
    fn test_non_base_export_rejected() {
        let source = "class Impostor {}\nclass Unused extends BaseSource {}\nmodule.exports = Impostor;";
        let err = load(source).err().unwrap();
        assert!(err.to_string().contains("not a BaseSource"));
    }
}
