//! Plugin activation
//!
//! Turns validated source text into a live `PluginInstance`:
//! 1. Imports of the base module are bound to the host object; any other
//!    import fails activation
//! 2. Default exports are normalised onto a CommonJS-style `module.exports`
//! 3. The rewritten module is written to a private scratch directory
//! 4. A fresh engine on its own thread loads it, instantiates the default
//!    export and probes the contract methods
//!
//! The scratch directory is removed on every path out of `activate`.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::core::config::LoaderConfig;
use crate::core::error::{Result, SourceError};
use super::instance::PluginInstance;
use super::js_runtime::SourceContext;
use super::js_wrapper::JsSource;
use super::types::PluginDescriptor;
use super::validator::ValidatedSource;

/// Logical module plugins import the host API from
pub const BASE_MODULE: &str = "@sources/base";

const MODULE_FILE: &str = "module.js";

lazy_static! {
    static ref IMPORT_FROM: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+([\w$*{}\s,]+?)\s+from\s*['"]([^'"]+)['"][ \t]*;?"#
    ).unwrap();
    static ref IMPORT_BARE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s*['"]([^'"]+)['"][ \t]*;?"#
    ).unwrap();
    static ref DYNAMIC_IMPORT: Regex = Regex::new(
        r#"\bimport\s*\(\s*['"`]([^'"`]+)['"`]\s*\)"#
    ).unwrap();
    static ref REQUIRE: Regex = Regex::new(
        r#"\brequire\s*\(\s*['"`]([^'"`]+)['"`]\s*\)"#
    ).unwrap();
    static ref EXPORT_FROM: Regex = Regex::new(
        r#"(?m)^[ \t]*export\s+[^;\n]*?\bfrom\s*['"]([^'"]+)['"]"#
    ).unwrap();

    static ref EXPORT_DEFAULT_DECL: Regex = Regex::new(
        r"\bexport\s+default\s+((?:async\s+)?function\b\s*\*?|class\b)\s*([A-Za-z_$][\w$]*)?"
    ).unwrap();
    static ref EXPORT_DEFAULT: Regex = Regex::new(r"\bexport\s+default\s+").unwrap();
    static ref EXPORT_LIST: Regex = Regex::new(r"\bexport\s*\{([^}]*)\}[ \t]*;?").unwrap();
    static ref EXPORT_DECL: Regex = Regex::new(
        r"\bexport\s+((?:async\s+)?function|class|const|let|var)\b"
    ).unwrap();
}

fn bind_import_clause(clause: &str) -> std::result::Result<String, String> {
    let clause = clause.trim();
    let mut statements = Vec::new();

    let (default_binding, rest) = if clause.starts_with('{') || clause.starts_with('*') {
        (None, clause)
    } else {
        match clause.split_once(',') {
            Some((default, rest)) => (Some(default.trim()), rest.trim()),
            None => (Some(clause), ""),
        }
    };

    if let Some(name) = default_binding {
        statements.push(format!("const {} = __host.default;", name));
    }

    if let Some(namespace) = rest.strip_prefix('*') {
        let name = namespace
            .trim()
            .strip_prefix("as")
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| format!("malformed namespace import: {}", clause))?;
        statements.push(format!("const {} = __host;", name));
    } else if rest.starts_with('{') {
        let inner = rest.trim_start_matches('{').trim_end_matches('}');
        let mut bindings = Vec::new();
        for binding in inner.split(',') {
            let tokens: Vec<&str> = binding.split_whitespace().collect();
            match tokens.as_slice() {
                [] => {}
                [name] => bindings.push(name.to_string()),
                [name, "as", alias] => bindings.push(format!("{}: {}", name, alias)),
                _ => return Err(format!("malformed import binding: {}", binding.trim())),
            }
        }
        statements.push(format!("const {{ {} }} = __host;", bindings.join(", ")));
    } else if !rest.is_empty() {
        return Err(format!("malformed import clause: {}", clause));
    }

    Ok(statements.join(" "))
}

fn rewrite_imports(source: &str) -> std::result::Result<String, String> {
    let mut failure: Option<String> = None;

    let text = IMPORT_FROM.replace_all(source, |caps: &Captures| {
        let specifier = &caps[2];
        if specifier != BASE_MODULE {
            failure.get_or_insert_with(|| format!("unresolved import: {}", specifier));
            return String::new();
        }
        match bind_import_clause(&caps[1]) {
            Ok(bound) => bound,
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });

    let text = IMPORT_BARE.replace_all(&text, |caps: &Captures| {
        if &caps[1] != BASE_MODULE {
            failure.get_or_insert_with(|| format!("unresolved import: {}", &caps[1]));
        }
        String::new()
    });

    let text = REQUIRE.replace_all(&text, |caps: &Captures| {
        if &caps[1] != BASE_MODULE {
            failure.get_or_insert_with(|| format!("unresolved import: {}", &caps[1]));
        }
        "__host".to_string()
    });

    let text = DYNAMIC_IMPORT.replace_all(&text, |caps: &Captures| {
        if &caps[1] != BASE_MODULE {
            failure.get_or_insert_with(|| format!("unresolved import: {}", &caps[1]));
        }
        "Promise.resolve(__host)".to_string()
    });

    if let Some(caps) = EXPORT_FROM.captures(&text) {
        failure.get_or_insert_with(|| format!("unresolved import: {}", &caps[1]));
    }

    match failure {
        Some(reason) => Err(reason),
        None => Ok(text.into_owned()),
    }
}

fn normalise_exports(source: &str) -> (String, Vec<String>) {
    let mut trailer = Vec::new();

    let text = EXPORT_DEFAULT_DECL.replace_all(source, |caps: &Captures| {
        let keyword = &caps[1];
        match caps.get(2).map(|m| m.as_str()) {
            Some(name) if name != "extends" => {
                trailer.push(format!("module.exports.default = {};", name));
                format!("{} {}", keyword, name)
            }
            Some(_) => format!("module.exports.default = {} extends", keyword),
            None => format!("module.exports.default = {}", keyword),
        }
    });

    let text = EXPORT_DEFAULT.replace_all(&text, "module.exports.default = ");

    let text = EXPORT_LIST.replace_all(&text, |caps: &Captures| {
        caps[1]
            .split(',')
            .filter_map(|binding| {
                let tokens: Vec<&str> = binding.split_whitespace().collect();
                match tokens.as_slice() {
                    [name, "as", "default"] => Some(format!("module.exports.default = {};", name)),
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    });

    let text = EXPORT_DECL.replace_all(&text, "$1");

    (text.into_owned(), trailer)
}

/// Rewrite plugin text into a script that defines `__source_factory`
///
/// The factory takes `(module, exports, __host)`; plugin code runs in its
/// own function scope with `BaseSource` pre-bound.
pub fn rewrite_module(source: &str) -> std::result::Result<String, String> {
    let imported = rewrite_imports(source)?;
    let (body, trailer) = normalise_exports(&imported);

    Ok(format!(
        "globalThis.__source_factory = function (module, exports, __host) {{\n\
         const BaseSource = __host.BaseSource;\n\
         (function () {{\n{}\n;{}\n}})();\n\
         }};\n",
        body,
        trailer.join("\n")
    ))
}

/// Builds live instances from validated source
#[async_trait]
pub trait Activator: Send + Sync {
    async fn activate(
        &self,
        descriptor: &PluginDescriptor,
        digest: &str,
        source: ValidatedSource,
    ) -> Result<PluginInstance>;
}

/// Activator running each plugin in its own JavaScript engine
#[derive(Debug, Clone)]
pub struct JsActivator {
    scratch_root: PathBuf,
    activation_timeout: Duration,
    call_timeout: Duration,
}

impl JsActivator {
    pub fn new(scratch_root: PathBuf, activation_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            scratch_root,
            activation_timeout,
            call_timeout,
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(
            config.scratch_dir.clone(),
            Duration::from_secs(config.activation_timeout_secs),
            Duration::from_secs(config.call_timeout_secs),
        )
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    fn scratch_dir(&self, id: &str) -> Result<TempDir> {
        std::fs::create_dir_all(&self.scratch_root)
            .map_err(|e| SourceError::activation(id, format!("cannot create scratch root: {}", e)))?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", id))
            .tempdir_in(&self.scratch_root)
            .map_err(|e| SourceError::activation(id, format!("cannot create scratch directory: {}", e)))
    }

    async fn load(&self, descriptor: &PluginDescriptor, module: String, dir: &Path) -> Result<JsSource> {
        let path = dir.join(MODULE_FILE);
        tokio::fs::write(&path, module)
            .await
            .map_err(|e| SourceError::activation(&descriptor.id, format!("cannot write module: {}", e)))?;

        let context = SourceContext {
            id: descriptor.id.clone(),
            name: descriptor.display_name.clone(),
            version: descriptor.version.clone(),
            base_url: descriptor.base_endpoint.clone(),
        };

        JsSource::spawn(
            context,
            descriptor.base_host(),
            path,
            self.activation_timeout,
            self.call_timeout,
        )
        .await
    }
}

fn close_scratch(dir: TempDir, id: &str) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(plugin_id = %id, path = %path.display(), error = %e, "Failed to remove scratch directory");
    }
}

#[async_trait]
impl Activator for JsActivator {
    async fn activate(
        &self,
        descriptor: &PluginDescriptor,
        digest: &str,
        source: ValidatedSource,
    ) -> Result<PluginInstance> {
        let id = descriptor.id.as_str();
        let module = rewrite_module(source.as_str()).map_err(|reason| SourceError::activation(id, reason))?;

        let dir = self.scratch_dir(id)?;
        debug!(plugin_id = %id, path = %dir.path().display(), "Activating plugin");

        let loaded = self.load(descriptor, module, dir.path()).await;
        close_scratch(dir, id);
        let js_source = loaded?;

        let instance = PluginInstance::new(descriptor, digest.to_string(), Arc::new(js_source));
        info!(
            plugin_id = %id,
            version = %descriptor.version,
            implemented = ?instance.implemented.iter().collect::<Vec<_>>(),
            "Plugin activated"
        );
        Ok(instance)
    }
}
