//! JavaScript host bindings
//!
//! This module provides the bridge between Rust and plugin JavaScript:
//! - Host ops for HTTP, logging and URL resolution
//! - The host object (`__host`) with the `BaseSource` base class
//! - The invoke helper the Rust side uses to call plugin methods
//!
//! Plugin HTTP goes through `op_source_fetch`, which only talks to the
//! plugin's own base endpoint domain and its subdomains.

use anyhow::{anyhow, Context, Result};
use deno_core::{op2, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::core::logging::PLUGIN_CONSOLE_TARGET;

const MAX_REDIRECTS: usize = 10;

fn in_scope(allowed_host: Option<&str>, url: &Url) -> bool {
    let Some(allowed) = allowed_host else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    match url.host_str().map(|h| h.to_ascii_lowercase()) {
        Some(host) => host == allowed || host.ends_with(&format!(".{}", allowed)),
        None => false,
    }
}

/// Per-runtime state the host ops read from `OpState`
#[derive(Clone)]
pub struct HostScope {
    pub plugin_id: String,
    /// Host the plugin may reach, with its subdomains
    pub allowed_host: Option<String>,
    pub client: reqwest::Client,
}

impl HostScope {
    pub fn new(plugin_id: impl Into<String>, allowed_host: Option<String>) -> Result<Self> {
        let allowed_host = allowed_host.map(|h| h.to_ascii_lowercase());

        // every hop is held to the same domain as the first request
        let redirect_host = allowed_host.clone();
        let redirects = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if in_scope(redirect_host.as_deref(), attempt.url()) {
                attempt.follow()
            } else {
                let message = format!("Network access denied: redirect to {} leaves the plugin domain", attempt.url());
                attempt.error(message)
            }
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .redirect(redirects)
            .user_agent(concat!("source-runtime/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build plugin HTTP client")?;
        Ok(Self {
            plugin_id: plugin_id.into(),
            allowed_host,
            client,
        })
    }

    /// Reject URLs outside the plugin's domain
    pub fn check_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw).with_context(|| format!("Invalid URL: {}", raw))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("Network access denied: unsupported scheme in {}", raw));
        }
        if url.host_str().is_none() {
            return Err(anyhow!("Network access denied: no host in {}", raw));
        }

        if in_scope(self.allowed_host.as_deref(), &url) {
            Ok(url)
        } else {
            Err(anyhow!("Network access denied: {} is outside the plugin domain", raw))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HostFetchOptions {
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HostFetchResponse {
    pub ok: bool,
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
}

#[op2(async)]
#[serde]
pub async fn op_source_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[serde] options: Option<HostFetchOptions>,
) -> Result<HostFetchResponse, anyhow::Error> {
    let (client, plugin_id, target) = {
        let state = state.borrow();
        let scope = state
            .try_borrow::<HostScope>()
            .ok_or_else(|| anyhow!("host scope missing"))?;
        let target = scope.check_url(&url)?;
        (scope.client.clone(), scope.plugin_id.clone(), target)
    };

    let options = options.unwrap_or_default();
    let method = match options.method.as_deref() {
        Some(m) => reqwest::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("Invalid HTTP method: {}", m))?,
        None => reqwest::Method::GET,
    };

    debug!(plugin_id = %plugin_id, method = %method, url = %target, "Plugin fetch");

    let mut builder = client.request(method, target);
    for (name, value) in &options.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = options.body {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| {
        warn!(plugin_id = %plugin_id, url = %url, error = %e, "Plugin fetch failed");
        anyhow!("Request to {} failed: {}", url, e)
    })?;

    let status = response.status();
    let final_url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read body from {}", url))?;

    Ok(HostFetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        url: final_url,
        headers,
        body,
    })
}

#[op2]
pub fn op_source_log(state: &mut OpState, #[serde] entry: LogEntry) {
    let plugin_id = state
        .try_borrow::<HostScope>()
        .map(|s| s.plugin_id.clone())
        .unwrap_or_default();

    match entry.level.as_str() {
        "debug" => debug!(target: PLUGIN_CONSOLE_TARGET, plugin_id = %plugin_id, "{}", entry.message),
        "warn" => warn!(target: PLUGIN_CONSOLE_TARGET, plugin_id = %plugin_id, "{}", entry.message),
        "error" => error!(target: PLUGIN_CONSOLE_TARGET, plugin_id = %plugin_id, "{}", entry.message),
        _ => info!(target: PLUGIN_CONSOLE_TARGET, plugin_id = %plugin_id, "{}", entry.message),
    }
}

#[op2]
#[string]
pub fn op_source_resolve_url(#[string] base: String, #[string] href: String) -> Result<String, anyhow::Error> {
    resolve_url(&base, &href)
}

/// Resolve `href` against `base`, treating a bare domain as https
pub fn resolve_url(base: &str, href: &str) -> Result<String> {
    if let Ok(absolute) = Url::parse(href) {
        return Ok(absolute.to_string());
    }

    let base = base.trim();
    let base = if base.contains("://") {
        base.to_string()
    } else {
        format!("https://{}", base)
    };
    let base = Url::parse(&base).with_context(|| format!("Invalid base URL: {}", base))?;
    let joined = base
        .join(href)
        .with_context(|| format!("Cannot resolve {} against {}", href, base))?;
    Ok(joined.to_string())
}

/// Methods every plugin must implement
pub const MANDATORY_METHODS: [&str; 6] = [
    "search",
    "getDetails",
    "getChildren",
    "getLeafAssets",
    "listAll",
    "extractPaginationInfo",
];

/// Host prelude evaluated before any plugin code
pub const HOST_BOOTSTRAP: &str = r#"
"use strict";
(function () {
    const ops = Deno.core.ops;

    function render(args) {
        return args.map((arg) => {
            if (typeof arg === 'string') return arg;
            if (arg instanceof Error) return arg.stack || String(arg);
            try { return JSON.stringify(arg); } catch (_) { return String(arg); }
        }).join(' ');
    }
    const emit = (level) => (...args) => ops.op_source_log({ level, message: render(args) });
    globalThis.console = {
        log: emit('info'),
        info: emit('info'),
        debug: emit('debug'),
        trace: emit('debug'),
        warn: emit('warn'),
        error: emit('error'),
    };

    class Headers {
        constructor(init) {
            this.map = new Map();
            if (init) {
                const entries = init instanceof Headers
                    ? Array.from(init.map, ([k, v]) => [k, v.join(', ')])
                    : Array.isArray(init) ? init : Object.entries(init);
                entries.forEach(([key, value]) => this.append(key, value));
            }
        }
        append(name, value) {
            name = String(name).toLowerCase();
            const values = this.map.get(name) || [];
            values.push(String(value));
            this.map.set(name, values);
        }
        delete(name) { this.map.delete(String(name).toLowerCase()); }
        get(name) {
            const values = this.map.get(String(name).toLowerCase());
            return values ? values.join(', ') : null;
        }
        has(name) { return this.map.has(String(name).toLowerCase()); }
        set(name, value) { this.map.set(String(name).toLowerCase(), [String(value)]); }
        forEach(callback, thisArg) {
            for (const [name, values] of this.map) {
                callback.call(thisArg, values.join(', '), name, this);
            }
        }
        toObject() {
            const out = {};
            this.forEach((value, name) => { out[name] = value; });
            return out;
        }
    }
    globalThis.Headers = Headers;

    async function fetch(input, init) {
        const url = typeof input === 'string' ? input : String(input);
        const options = init ? {
            method: init.method,
            headers: init.headers instanceof Headers ? init.headers.toObject() : (init.headers || {}),
            body: init.body == null ? undefined : String(init.body),
        } : null;
        const res = await ops.op_source_fetch(url, options);
        return {
            ok: res.ok,
            status: res.status,
            statusText: res.statusText,
            url: res.url,
            headers: new Headers(res.headers),
            text: async () => res.body,
            json: async () => JSON.parse(res.body),
        };
    }
    globalThis.fetch = fetch;

    class BaseSource {
        constructor(context) {
            const ctx = context || globalThis.__source_context || {};
            this.id = ctx.id;
            this.name = ctx.name;
            this.version = ctx.version;
            this.baseUrl = ctx.baseUrl;
        }

        absoluteUrl(href) {
            return ops.op_source_resolve_url(String(this.baseUrl || ''), String(href));
        }

        async fetchText(url, init) {
            const res = await fetch(this.absoluteUrl(url), init);
            if (!res.ok) {
                throw new Error(`HTTP ${res.status} for ${res.url}`);
            }
            return res.text();
        }

        async fetchJson(url, init) {
            return JSON.parse(await this.fetchText(url, init));
        }
    }

    globalThis.__host = Object.freeze({
        BaseSource,
        default: BaseSource,
        fetch,
        Headers,
        console: globalThis.console,
    });

    globalThis.__source_invoke = async function (method, args) {
        globalThis.__source_status = 'pending';
        globalThis.__source_result = undefined;
        globalThis.__source_error = undefined;
        try {
            const target = globalThis.__source_instance;
            if (!target || typeof target[method] !== 'function') {
                throw new Error(`method ${method} is not implemented`);
            }
            const result = await target[method](...args);
            globalThis.__source_result = JSON.stringify(result === undefined ? null : result);
            globalThis.__source_status = 'success';
        } catch (e) {
            globalThis.__source_error = (e && e.message) ? String(e.message) : String(e);
            globalThis.__source_status = 'error';
        }
    };
})();
"#;

/// Create an engine with the host ops and prelude installed
pub fn create_runtime(scope: HostScope) -> Result<JsRuntime> {
    let ext = Extension {
        name: "source_host",
        ops: std::borrow::Cow::Borrowed(&[
            op_source_fetch::DECL,
            op_source_log::DECL,
            op_source_resolve_url::DECL,
        ]),
        ..Default::default()
    };

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ext],
        ..Default::default()
    });

    runtime.op_state().borrow_mut().put(scope);

    runtime
        .execute_script("<source_host>", HOST_BOOTSTRAP.to_string().into())
        .context("Failed to initialize host bindings")?;

    Ok(runtime)
}
