use async_trait::async_trait;
use deno_core::v8;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::core::error::{Result, SourceError};
use super::js_bindings::HostScope;
use super::js_runtime::{ProbeReport, SourceContext, SourceRuntime};
use super::source::{Asset, Item, ListOptions, PaginationInfo, SourcePlugin};
use super::types::{Capabilities, Capability};

/// Command sent to the JS worker thread
enum JsCommand {
    Call {
        method: &'static str,
        args: Vec<Value>,
        resp: oneshot::Sender<Result<Value>>,
    },
    GarbageCollect {
        resp: oneshot::Sender<()>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// A plugin running in its own engine on a dedicated thread
///
/// The engine is single-threaded, so every call is sent over a channel and
/// answered on a oneshot. Dropping the last handle ends the thread.
///
/// A call that overruns `call_timeout` terminates the engine. From then on
/// every call fails immediately and the worker thread exits.
pub struct JsSource {
    id: String,
    implemented: Capabilities,
    call_timeout: Duration,
    tx: mpsc::Sender<JsCommand>,
    handle: v8::IsolateHandle,
    halted: Arc<AtomicBool>,
}

impl JsSource {
    /// Start a worker, load the module at `module_path` and wait until the
    /// plugin is instantiated, all within `activation_timeout`
    pub async fn spawn(
        context: SourceContext,
        allowed_host: Option<String>,
        module_path: PathBuf,
        activation_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self> {
        let id = context.id.clone();
        let deadline = Instant::now() + activation_timeout;

        let (tx, mut rx) = mpsc::channel::<JsCommand>(32);
        let halted = Arc::new(AtomicBool::new(false));
        let worker_halted = Arc::clone(&halted);
        let (handle_tx, handle_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<ProbeReport, String>>();

        let worker_id = id.clone();
        thread::Builder::new()
            .name(format!("source-{}", id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(format!("cannot start engine runtime: {}", e)));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let mut runtime = match HostScope::new(worker_id.clone(), allowed_host)
                        .and_then(SourceRuntime::new)
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = handle_tx.send(Err(e.to_string()));
                            return;
                        }
                    };

                    if handle_tx.send(Ok(runtime.isolate_handle())).is_err() {
                        return;
                    }

                    let loaded = runtime
                        .load_module(&module_path, &context)
                        .map_err(|e| e.to_string());
                    let failed = loaded.is_err();
                    if ready_tx.send(loaded).is_err() || failed {
                        return;
                    }

                    debug!(plugin_id = %worker_id, "Engine worker ready");

                    while let Some(cmd) = rx.recv().await {
                        // dropping the command closes its reply channel
                        if worker_halted.load(Ordering::SeqCst) {
                            break;
                        }
                        match cmd {
                            JsCommand::Call { method, args, resp } => {
                                let result = runtime
                                    .call(method, &args)
                                    .await
                                    .map_err(|e| {
                                        SourceError::PluginExecution(format!("{}.{}: {}", worker_id, method, e))
                                    });
                                let _ = resp.send(result);
                            }
                            JsCommand::GarbageCollect { resp } => {
                                runtime.garbage_collect();
                                let _ = resp.send(());
                            }
                            JsCommand::Shutdown { resp } => {
                                let _ = resp.send(());
                                break;
                            }
                        }
                        if worker_halted.load(Ordering::SeqCst) {
                            break;
                        }
                    }

                    debug!(plugin_id = %worker_id, "Engine worker exiting");
                });
            })
            .map_err(|e| SourceError::activation(&id, format!("cannot spawn engine thread: {}", e)))?;

        let handle = match timeout_at(deadline, handle_rx).await {
            Ok(Ok(Ok(handle))) => handle,
            Ok(Ok(Err(message))) => return Err(SourceError::activation(&id, message)),
            Ok(Err(_)) => return Err(SourceError::activation(&id, "engine thread exited before start")),
            Err(_) => return Err(SourceError::activation(&id, "engine start timed out")),
        };

        let report = match timeout_at(deadline, ready_rx).await {
            Ok(Ok(Ok(report))) => report,
            Ok(Ok(Err(message))) => return Err(SourceError::activation(&id, message)),
            Ok(Err(_)) => return Err(SourceError::activation(&id, "engine thread exited during activation")),
            Err(_) => {
                handle.terminate_execution();
                error!(plugin_id = %id, timeout_ms = activation_timeout.as_millis() as u64, "Activation timed out, engine terminated");
                return Err(SourceError::activation(
                    &id,
                    format!("activation timed out after {:?}", activation_timeout),
                ));
            }
        };

        if !report.missing.is_empty() {
            return Err(SourceError::activation(
                &id,
                format!("missing mandatory method(s): {}", report.missing.join(", ")),
            ));
        }

        Ok(Self {
            id,
            implemented: report.implemented,
            call_timeout,
            tx,
            handle,
            halted,
        })
    }

    /// Whether the engine was terminated after an overrun
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop whatever script is running and retire the worker
    fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            self.handle.terminate_execution();
            warn!(plugin_id = %self.id, "Plugin engine terminated");
        }
    }

    fn stopped(&self) -> SourceError {
        SourceError::PluginExecution(format!("{}: engine has stopped", self.id))
    }

    fn timed_out(&self, method: &str) -> SourceError {
        warn!(plugin_id = %self.id, method, timeout_ms = self.call_timeout.as_millis() as u64, "Plugin call timed out");
        self.halt();
        SourceError::PluginExecution(format!("{}.{} timed out after {:?}", self.id, method, self.call_timeout))
    }

    async fn invoke(&self, method: &'static str, args: Vec<Value>) -> Result<Value> {
        if self.is_halted() {
            return Err(self.stopped());
        }

        let deadline = Instant::now() + self.call_timeout;
        let (resp_tx, resp_rx) = oneshot::channel();

        match timeout_at(deadline, self.tx.send(JsCommand::Call { method, args, resp: resp_tx })).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(self.stopped()),
            Err(_) => return Err(self.timed_out(method)),
        }

        match timeout_at(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SourceError::PluginExecution(format!("{}.{}: channel closed", self.id, method))),
            Err(_) => Err(self.timed_out(method)),
        }
    }

    async fn invoke_as<T: DeserializeOwned>(&self, method: &'static str, args: Vec<Value>) -> Result<T> {
        let value = self.invoke(method, args).await?;
        serde_json::from_value(value).map_err(|e| {
            SourceError::PluginExecution(format!("{}.{} returned an unexpected shape: {}", self.id, method, e))
        })
    }

    async fn invoke_list<T: DeserializeOwned>(&self, method: &'static str, args: Vec<Value>) -> Result<Vec<T>> {
        let value = self.invoke(method, args).await?;
        let list = unwrap_list(value);
        serde_json::from_value(list).map_err(|e| {
            SourceError::PluginExecution(format!("{}.{} returned an unexpected shape: {}", self.id, method, e))
        })
    }

    async fn listing(&self, capability: Capability, options: &ListOptions) -> Result<Vec<Item>> {
        if !self.implemented.has(capability) {
            return Err(self.unsupported(capability));
        }
        self.invoke_list(capability.method_name(), vec![options_value(options)]).await
    }

    /// Ask the engine to release memory it no longer needs
    pub async fn garbage_collect(&self) -> Result<()> {
        if self.is_halted() {
            return Err(self.stopped());
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        timeout(self.call_timeout, self.tx.send(JsCommand::GarbageCollect { resp: resp_tx }))
            .await
            .map_err(|_| self.timed_out("gc"))?
            .map_err(|_| self.stopped())?;
        timeout(self.call_timeout, resp_rx)
            .await
            .map_err(|_| self.timed_out("gc"))?
            .map_err(|_| SourceError::PluginExecution(format!("{}: channel closed", self.id)))
    }
}

/// Accept a bare array or the usual `{ items | results | data: [...] }` envelopes
fn unwrap_list(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            for key in ["items", "results", "data"] {
                if let Some(list @ Value::Array(_)) = map.remove(key) {
                    return list;
                }
            }
            Value::Object(map)
        }
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

fn options_value(options: &ListOptions) -> Value {
    serde_json::to_value(options).unwrap_or(Value::Null)
}

#[async_trait]
impl SourcePlugin for JsSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.implemented
    }

    async fn search(&self, query: &str, options: &ListOptions) -> Result<Vec<Item>> {
        self.invoke_list("search", vec![Value::from(query), options_value(options)]).await
    }

    async fn get_details(&self, id: &str) -> Result<Item> {
        self.invoke_as("getDetails", vec![Value::from(id)]).await
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<Item>> {
        self.invoke_list("getChildren", vec![Value::from(parent_id)]).await
    }

    async fn get_leaf_assets(&self, child_id: &str) -> Result<Vec<Asset>> {
        let value = self.invoke("getLeafAssets", vec![Value::from(child_id)]).await?;
        let list = match unwrap_list(value) {
            // Plain URL lists are common; index them in order
            Value::Array(entries) => Value::Array(
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(i, entry)| match entry {
                        Value::String(url) => serde_json::json!({ "index": i, "url": url }),
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        };
        serde_json::from_value(list).map_err(|e| {
            SourceError::PluginExecution(format!("{}.getLeafAssets returned an unexpected shape: {}", self.id, e))
        })
    }

    async fn list_all(&self, options: &ListOptions) -> Result<Vec<Item>> {
        self.invoke_list("listAll", vec![options_value(options)]).await
    }

    async fn extract_pagination_info(&self, url: &str) -> Result<PaginationInfo> {
        self.invoke_as("extractPaginationInfo", vec![Value::from(url)]).await
    }

    async fn get_latest(&self, options: &ListOptions) -> Result<Vec<Item>> {
        self.listing(Capability::Latest, options).await
    }

    async fn get_popular(&self, options: &ListOptions) -> Result<Vec<Item>> {
        self.listing(Capability::Popular, options).await
    }

    async fn get_trending(&self, options: &ListOptions) -> Result<Vec<Item>> {
        self.listing(Capability::Trending, options).await
    }

    async fn shutdown(&self) -> Result<()> {
        let deadline = Instant::now() + self.call_timeout;
        let (resp_tx, resp_rx) = oneshot::channel();

        let answered = match timeout_at(deadline, self.tx.send(JsCommand::Shutdown { resp: resp_tx })).await {
            // Worker already gone
            Ok(Err(_)) => return Ok(()),
            Ok(Ok(())) => timeout_at(deadline, resp_rx).await.is_ok(),
            Err(_) => false,
        };

        if !answered {
            warn!(plugin_id = %self.id, "Plugin did not stop in time");
            self.halt();
        }
        debug!(plugin_id = %self.id, "Plugin shut down");
        Ok(())
    }
}
