//! Plugin loading pipeline
//!
//! Turns a descriptor into a live instance: fetch, reject HTML, verify the
//! digest, validate the text, activate. Each stage either hands a complete
//! value forward or fails with an error naming that stage. Nothing here
//! touches the registry.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::LoaderConfig;
use crate::core::error::{Result, SourceError};
use super::activator::{Activator, JsActivator};
use super::events::{InstallStage, ProgressReporter};
use super::fetcher::{looks_like_html, ArtifactFetcher, FetchPolicy, HttpFetcher};
use super::instance::PluginInstance;
use super::integrity;
use super::types::PluginDescriptor;
use super::validator;

pub struct PluginLoader {
    fetcher: Arc<dyn ArtifactFetcher>,
    activator: Arc<dyn Activator>,
    policy: FetchPolicy,
}

impl PluginLoader {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, activator: Arc<dyn Activator>, policy: FetchPolicy) -> Self {
        Self {
            fetcher,
            activator,
            policy,
        }
    }

    /// Loader using HTTP and the JavaScript engine
    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpFetcher::new()?),
            Arc::new(JsActivator::from_config(config)),
            FetchPolicy::from_config(config),
        ))
    }

    pub fn fetcher(&self) -> &Arc<dyn ArtifactFetcher> {
        &self.fetcher
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Run the full pipeline for `descriptor`
    pub async fn load(&self, descriptor: &PluginDescriptor, progress: &ProgressReporter) -> Result<PluginInstance> {
        descriptor.validate()?;
        let expected = descriptor.digest()?;

        progress.stage(InstallStage::DownloadStarted);
        let bytes = self.fetcher.fetch(&descriptor.artifact_url, &self.policy).await?;
        debug!(plugin_id = %descriptor.id, size = bytes.len(), "Artifact downloaded");
        progress.stage(InstallStage::Downloaded);

        if looks_like_html(&bytes) {
            warn!(plugin_id = %descriptor.id, url = %descriptor.artifact_url, "Artifact is an HTML page");
            return Err(SourceError::HtmlInsteadOfCode {
                url: descriptor.artifact_url.clone(),
            });
        }

        let actual = integrity::sha256_hex(&bytes);
        if !integrity::verify(&bytes, expected) {
            warn!(plugin_id = %descriptor.id, expected = %expected, actual = %actual, "Digest mismatch");
            return Err(SourceError::IntegrityMismatch {
                id: descriptor.id.clone(),
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
        progress.stage(InstallStage::Verified);

        let source = validator::validated_source(&bytes).map_err(|e| {
            warn!(plugin_id = %descriptor.id, error = %e, "Plugin failed validation");
            e
        })?;
        progress.stage(InstallStage::Validated);

        let instance = self.activator.activate(descriptor, &actual, source).await?;
        progress.stage(InstallStage::Activated);

        info!(
            plugin_id = %descriptor.id,
            version = %descriptor.version,
            capabilities = ?instance.effective_capabilities(),
            "Plugin loaded"
        );
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{FetchError, FetchErrorKind};
    use crate::plugin::test_support::{sample_descriptor, CountingActivator, MockFetcher, ESM_PLUGIN};
    use std::sync::Mutex;
    use std::time::Duration;

    const URL: &str = "https://cdn.test/fixture.js";

    fn loader(fetcher: Arc<MockFetcher>, scratch: &tempfile::TempDir) -> (PluginLoader, Arc<CountingActivator>) {
        let activator = Arc::new(CountingActivator::new(JsActivator::new(
            scratch.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )));
        let loader = PluginLoader::new(fetcher, activator.clone(), FetchPolicy::default());
        (loader, activator)
    }

    #[tokio::test]
    async fn test_load_reports_every_stage() {
        let scratch = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new().with_artifact(URL, ESM_PLUGIN));
        let (loader, _) = loader(fetcher, &scratch);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let progress = ProgressReporter::new(Some(Arc::new(move |percent, label: &str| {
            sink_seen.lock().unwrap().push((percent, label.to_string()));
        })));

        let descriptor = sample_descriptor("fixture", "1.0.0", URL, ESM_PLUGIN.as_bytes());
        let instance = loader.load(&descriptor, &progress).await.unwrap();
        assert_eq!(instance.version, "1.0.0");
        assert_eq!(instance.digest, integrity::sha256_hex(ESM_PLUGIN.as_bytes()));

        let labels: Vec<_> = seen.lock().unwrap().iter().map(|(_, l)| l.clone()).collect();
        assert_eq!(labels, vec!["downloading", "downloaded", "verified", "validated", "activated"]);
    }

    #[tokio::test]
    async fn test_digest_mismatch_stops_before_activation() {
        let scratch = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new().with_artifact(URL, ESM_PLUGIN));
        let (loader, activator) = loader(fetcher, &scratch);

        let descriptor = sample_descriptor("fixture", "1.0.0", URL, b"something else");
        let err = loader.load(&descriptor, &ProgressReporter::silent()).await.unwrap_err();

        match err {
            SourceError::IntegrityMismatch { actual, .. } => {
                assert_eq!(actual, integrity::sha256_hex(ESM_PLUGIN.as_bytes()))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(activator.activations(), 0);
    }

    #[tokio::test]
    async fn test_html_rejected_before_digest() {
        let scratch = tempfile::tempdir().unwrap();
        let page = "\n<!DOCTYPE html><html><body>Not here</body></html>";
        let fetcher = Arc::new(MockFetcher::new().with_artifact(URL, page));
        let (loader, _) = loader(fetcher, &scratch);

        // digest matches the page, so only the HTML check can reject it
        let descriptor = sample_descriptor("fixture", "1.0.0", URL, page.as_bytes());
        let err = loader.load(&descriptor, &ProgressReporter::silent()).await.unwrap_err();
        assert_eq!(err.error_type(), "HtmlInsteadOfCode");
    }

    #[tokio::test]
    async fn test_denylisted_source_never_activated() {
        let scratch = tempfile::tempdir().unwrap();
        let source = ESM_PLUGIN.replace("return [{ id: 'new-1'", "eval('1'); return [{ id: 'new-1'");
        let fetcher = Arc::new(MockFetcher::new().with_artifact(URL, source.clone()));
        let (loader, activator) = loader(fetcher, &scratch);

        let descriptor = sample_descriptor("fixture", "1.0.0", URL, source.as_bytes());
        let err = loader.load(&descriptor, &ProgressReporter::silent()).await.unwrap_err();

        assert_eq!(err.error_type(), "ValidationFailure");
        assert!(err.to_string().contains("eval"));
        assert_eq!(activator.activations(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_passes_through() {
        let scratch = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_failure(
            URL,
            FetchError::new(URL, FetchErrorKind::Timeout, "too slow").with_attempts(4),
        );
        let (loader, _) = loader(fetcher, &scratch);

        let descriptor = sample_descriptor("fixture", "1.0.0", URL, ESM_PLUGIN.as_bytes());
        match loader.load(&descriptor, &ProgressReporter::silent()).await.unwrap_err() {
            SourceError::Fetch(e) => {
                assert_eq!(e.kind, FetchErrorKind::Timeout);
                assert_eq!(e.attempts, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected_without_fetch() {
        let scratch = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new().with_artifact(URL, ESM_PLUGIN));
        let (loader, _) = loader(fetcher.clone(), &scratch);

        let mut descriptor = sample_descriptor("fixture", "1.0.0", URL, ESM_PLUGIN.as_bytes());
        descriptor.expected_digest = None;
        let err = loader.load(&descriptor, &ProgressReporter::silent()).await.unwrap_err();

        assert_eq!(err.error_type(), "InvalidDescriptor");
        assert_eq!(fetcher.total_fetches(), 0);
    }
}
