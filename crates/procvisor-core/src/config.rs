use crate::error::SupervisorError;
use crate::spec::{ProcessSpec, SpecInput};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Behaviour switches for one supervisor instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into), default)]
pub struct SupervisorConfig {
    /// Label attached to every log line of this supervisor
    #[serde(default = "default_name")]
    pub name: String,

    /// Stop already spawned siblings when a later spawn fails
    #[serde(default)]
    pub rollback_on_spawn_failure: bool,

    /// Spawn each child as the leader of a new process group
    #[serde(default)]
    pub process_group: bool,

    /// Kill descendants of each child before the child itself
    #[serde(default)]
    pub kill_descendants: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            rollback_on_spawn_failure: false,
            process_group: false,
            kill_descendants: false,
        }
    }
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }
}

/// Options for a single `start` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into), default)]
pub struct StartOptions {
    /// Block until every child has exited on its own
    #[serde(default)]
    pub wait: bool,

    /// Upper bound for the whole wait (in milliseconds), no bound if absent
    #[serde(default)]
    #[builder(setter(strip_option))]
    pub wait_timeout_ms: Option<u64>,
}

impl StartOptions {
    pub fn builder() -> StartOptionsBuilder {
        StartOptionsBuilder::default()
    }

    /// Return immediately after spawning
    pub fn detached() -> Self {
        Self::default()
    }

    /// Wait for natural exit of every child, without a bound
    pub fn waiting() -> Self {
        Self {
            wait: true,
            wait_timeout_ms: None,
        }
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

/// A JSON launch plan: supervisor settings plus the processes to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchPlan {
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(flatten)]
    pub options: StartOptions,

    pub processes: Vec<SpecInput>,
}

impl LaunchPlan {
    pub fn from_json(text: &str) -> Result<Self, SupervisorError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SupervisorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::Plan(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Resolve every entry into a canonical spec, reporting the first bad one
    pub fn specs(&self) -> Result<Vec<ProcessSpec>, SupervisorError> {
        self.processes
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, input)| {
                ProcessSpec::try_from(input)
                    .map_err(|source| SupervisorError::InvalidSpec { index, source })
            })
            .collect()
    }
}

// Default value functions for serde
fn default_name() -> String {
    "supervisor".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpecError;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.name, "supervisor");
        assert!(!config.rollback_on_spawn_failure);
        assert!(!config.process_group);
        assert!(!config.kill_descendants);
    }

    #[test]
    fn test_config_builder() {
        let config = SupervisorConfig::builder()
            .name("workers")
            .rollback_on_spawn_failure(true)
            .build()
            .unwrap();
        assert_eq!(config.name, "workers");
        assert!(config.rollback_on_spawn_failure);
        assert!(!config.kill_descendants);
    }

    #[test]
    fn test_start_options() {
        assert!(!StartOptions::detached().wait);
        assert!(StartOptions::waiting().wait);
        assert_eq!(StartOptions::waiting().wait_timeout(), None);

        let options = StartOptions::builder()
            .wait(true)
            .wait_timeout_ms(250u64)
            .build()
            .unwrap();
        assert_eq!(options.wait_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_launch_plan_parsing() {
        let plan = LaunchPlan::from_json(
            r#"{
                "supervisor": {"name": "web", "killDescendants": true},
                "wait": true,
                "waitTimeoutMs": 5000,
                "processes": [
                    "python3 -m http.server 9000",
                    {"command": ["sleep", "1"], "name": "sleeper"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.supervisor.name, "web");
        assert!(plan.supervisor.kill_descendants);
        assert!(!plan.supervisor.rollback_on_spawn_failure);
        assert!(plan.options.wait);
        assert_eq!(plan.options.wait_timeout(), Some(Duration::from_secs(5)));

        let specs = plan.specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].argv(), vec!["python3", "-m", "http.server", "9000"]);
        assert_eq!(specs[1].display_name(), "sleeper");
    }

    #[test]
    fn test_launch_plan_defaults() {
        let plan = LaunchPlan::from_json(r#"{"processes": []}"#).unwrap();
        assert_eq!(plan.supervisor, SupervisorConfig::default());
        assert_eq!(plan.options, StartOptions::default());
        assert!(plan.specs().unwrap().is_empty());
    }

    #[test]
    fn test_launch_plan_reports_bad_entry() {
        let plan = LaunchPlan::from_json(r#"{"processes": ["true", "  "]}"#).unwrap();
        match plan.specs() {
            Err(SupervisorError::InvalidSpec { index, source }) => {
                assert_eq!(index, 1);
                assert_eq!(source, SpecError::EmptyCommand);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_launch_plan_invalid_json() {
        assert!(matches!(
            LaunchPlan::from_json("{\"processes\": 3}"),
            Err(SupervisorError::Plan(_))
        ));
    }

    #[test]
    fn test_serialization() {
        let config = SupervisorConfig::builder()
            .process_group(true)
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("processGroup"));
        let deserialized: SupervisorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }
}
