use std::sync::Mutex;

use tracing::debug;

use crate::metadata;
use crate::types::HttpClient;

/// The Google Cloud runtime a process executes in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    /// A plain Compute Engine instance
    ComputeEngine,
    /// A GKE node or pod
    KubernetesEngine,
    /// Cloud Run service or job
    CloudRun,
    /// Cloud Functions (1st or 2nd gen)
    CloudFunctions,
    /// App Engine standard or flexible
    AppEngine,
    /// Not a recognized Google Cloud runtime
    None,
}

static DETECTED: Mutex<Option<Environment>> = Mutex::new(None);

/// Classify the current runtime environment
///
/// The outcome is cached process-wide; call [`reset_environment`] to force
/// re-detection (mainly useful in tests).
pub async fn detect_environment(client: &HttpClient) -> Environment {
    if let Some(cached) = *DETECTED.lock().unwrap() {
        return cached;
    }

    let environment = classify(client).await;
    debug!(?environment, "detected runtime environment");
    *DETECTED.lock().unwrap() = Some(environment);
    environment
}

/// Forget the cached detection result (for tests)
pub fn reset_environment() {
    *DETECTED.lock().unwrap() = None;
}

async fn classify(client: &HttpClient) -> Environment {
    if env_set("K_CONFIGURATION") && metadata::is_on_gce(client).await {
        return Environment::CloudRun;
    }

    if env_set("FUNCTION_NAME") || env_set("FUNCTION_TARGET") {
        return Environment::CloudFunctions;
    }

    if env_set("GAE_SERVICE") {
        return Environment::AppEngine;
    }

    if metadata::is_on_gce(client).await {
        if metadata::has_cluster_name(client).await {
            return Environment::KubernetesEngine;
        }

        return Environment::ComputeEngine;
    }

    Environment::None
}

fn env_set(name: &str) -> bool {
    std::env::var_os(name).map(|v| !v.is_empty()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn function_env_vars_classify_as_cloud_functions() {
        std::env::set_var("FUNCTION_TARGET", "handler");
        let client = HttpClient::new().unwrap();
        assert_eq!(classify(&client).await, Environment::CloudFunctions);
        std::env::remove_var("FUNCTION_TARGET");
    }

    #[tokio::test]
    async fn gae_service_classifies_as_app_engine() {
        std::env::set_var("GAE_SERVICE", "default");
        let client = HttpClient::new().unwrap();
        assert_eq!(classify(&client).await, Environment::AppEngine);
        std::env::remove_var("GAE_SERVICE");
    }

    #[test]
    fn detection_cache_resets() {
        *DETECTED.lock().unwrap() = Some(Environment::ComputeEngine);
        reset_environment();
        assert_eq!(*DETECTED.lock().unwrap(), None);
    }
}
