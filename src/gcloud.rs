use std::sync::Arc;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::Error;

/// Last-resort project id lookup through the gcloud CLI
///
/// Runs `gcloud config config-helper --format json` and reads
/// `configuration.properties.core.project` from its output.
pub(crate) async fn config_helper_project_id() -> Result<Arc<str>, Error> {
    debug!("querying gcloud config config-helper for a project id");
    let output = Command::new("gcloud")
        .args(["config", "config-helper", "--format", "json"])
        .output()
        .await
        .map_err(|err| Error::Io("failed to run gcloud config config-helper", err))?;

    if !output.status.success() {
        return Err(Error::Str("gcloud config config-helper exited with failure"));
    }

    project_from_output(&output.stdout)
}

fn project_from_output(stdout: &[u8]) -> Result<Arc<str>, Error> {
    #[derive(Deserialize)]
    struct Helper {
        configuration: Configuration,
    }

    #[derive(Deserialize)]
    struct Configuration {
        properties: Properties,
    }

    #[derive(Deserialize)]
    struct Properties {
        core: Core,
    }

    #[derive(Deserialize)]
    struct Core {
        project: Option<String>,
    }

    let helper = serde_json::from_slice::<Helper>(stdout)
        .map_err(|err| Error::Json("failed to parse gcloud config-helper output", err))?;
    helper
        .configuration
        .properties
        .core
        .project
        .map(|project| Arc::from(project.as_str()))
        .ok_or(Error::Str("gcloud configuration has no core project"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_project_from_helper_output() {
        let stdout = br#"{
            "configuration": {
                "active_configuration": "default",
                "properties": {
                    "core": {
                        "account": "user@example.com",
                        "project": "gcloud_project"
                    }
                }
            },
            "credential": {"access_token": "redacted"}
        }"#;
        assert_eq!(&*project_from_output(stdout).unwrap(), "gcloud_project");
    }

    #[test]
    fn missing_project_is_an_error() {
        let stdout = br#"{"configuration": {"properties": {"core": {}}}}"#;
        assert!(project_from_output(stdout).is_err());
    }
}
