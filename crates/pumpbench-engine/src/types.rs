//! Test states, test configuration and transition contexts.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use pumpbench_core::types::unix_timestamp;
use pumpbench_devices::{PowerSupply, Valve};

use crate::state_machine::MachineState;

/// State of a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    /// No test in progress
    Idle,
    /// Preparing a test
    Initializing,
    /// Prepared and waiting to run
    Ready,
    /// Running
    Running,
    /// Suspended by the operator
    Paused,
    /// Ran for its full duration
    Completed,
    /// Aborted by an error
    Failed,
    /// Stopped by the operator
    Stopped,
}

impl TestState {
    /// Every state
    pub const ALL: [TestState; 8] = [
        TestState::Idle,
        TestState::Initializing,
        TestState::Ready,
        TestState::Running,
        TestState::Paused,
        TestState::Completed,
        TestState::Failed,
        TestState::Stopped,
    ];

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            TestState::Idle => "idle",
            TestState::Initializing => "initializing",
            TestState::Ready => "ready",
            TestState::Running => "running",
            TestState::Paused => "paused",
            TestState::Completed => "completed",
            TestState::Failed => "failed",
            TestState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MachineState for TestState {
    fn initial() -> Self {
        TestState::Idle
    }

    fn successors(self) -> &'static [Self] {
        use TestState::*;
        match self {
            Idle => &[Initializing, Ready],
            Initializing => &[Ready, Idle, Failed],
            Ready => &[Running, Idle],
            Running => &[Paused, Completed, Failed, Stopped],
            Paused => &[Running, Stopped, Idle],
            Completed => &[Idle, Ready],
            Failed => &[Idle, Ready],
            Stopped => &[Idle, Ready],
        }
    }
}

/// Parameters of one test run, as sent with a start command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Identifier of the run; generated when absent
    #[serde(default)]
    pub test_id: Option<String>,

    /// Run time in seconds; zero or less runs until stopped
    #[serde(default)]
    pub duration: Option<i64>,

    /// Go from ready to running without a further command
    #[serde(default)]
    pub auto_start: bool,

    /// Supply to switch on while running
    #[serde(default)]
    pub power_on: Option<bool>,

    /// Which supply `power_on` refers to
    #[serde(default)]
    pub power_type: Option<PowerSupply>,

    /// Valve positions while running
    #[serde(default)]
    pub valve_state: Option<BTreeMap<Valve, bool>>,
}

impl TestConfig {
    /// The configured test id, or `test_<unix seconds>`
    pub fn resolve_test_id(&self) -> String {
        match &self.test_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("test_{}", unix_timestamp() as u64),
        }
    }

    /// The configured duration, or `default`
    pub fn duration_or(&self, default: i64) -> i64 {
        self.duration.unwrap_or(default)
    }
}

/// Context recorded with a test state transition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TestContext {
    /// A test was started with this configuration
    Config(TestConfig),
    /// A failure that moved the run to failed
    Error {
        /// What went wrong
        message: String,
    },
    /// Why the transition happened
    Reason {
        /// Short description
        reason: String,
    },
}

impl TestContext {
    /// Context for a failure
    pub fn error<S: Into<String>>(message: S) -> Self {
        TestContext::Error { message: message.into() }
    }

    /// Context naming the cause of a transition
    pub fn reason<S: Into<String>>(reason: S) -> Self {
        TestContext::Reason { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateMachine;

    #[test]
    fn test_adjacency_table() {
        assert!(TestState::Idle.can_reach(TestState::Initializing));
        assert!(!TestState::Idle.can_reach(TestState::Running));
        assert!(TestState::Paused.can_reach(TestState::Idle));
        assert!(!TestState::Completed.can_reach(TestState::Running));
        for state in TestState::ALL {
            assert!(!state.can_reach(state));
        }
    }

    #[test]
    fn test_config_from_command_body() {
        let config: TestConfig = serde_json::from_str(
            r#"{"test_id":"T1","duration":30,"auto_start":true,"power_on":true,
                "power_type":"ac220_3p","valve_state":{"A":true,"b":false}}"#,
        )
        .unwrap();

        assert_eq!(config.resolve_test_id(), "T1");
        assert_eq!(config.duration_or(60), 30);
        assert_eq!(config.power_type, Some(PowerSupply::Ac220ThreePhase));
        let valves = config.valve_state.unwrap();
        assert_eq!(valves.get(&Valve::A), Some(&true));
        assert_eq!(valves.get(&Valve::B), Some(&false));
    }

    #[test]
    fn test_config_defaults() {
        let config: TestConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.auto_start);
        assert_eq!(config.duration_or(60), 60);
        assert!(config.resolve_test_id().starts_with("test_"));
    }

    #[tokio::test]
    async fn test_illegal_transition_changes_nothing() {
        let mut machine: StateMachine<TestState, TestContext> = StateMachine::new("test");

        assert!(!machine.transition_to(TestState::Running, None).await);
        assert_eq!(machine.current(), TestState::Idle);
        assert!(machine.history().is_empty());
        assert_eq!(machine.changes(), 0);

        assert!(
            machine
                .transition_to(TestState::Initializing, Some(TestContext::reason("start")))
                .await
        );
        assert_eq!(machine.current(), TestState::Initializing);
        assert_eq!(machine.history().len(), 1);
        assert_eq!(machine.history()[0].from, TestState::Idle);
        assert_eq!(machine.history()[0].to, TestState::Initializing);
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_value(TestState::Initializing).unwrap(), "initializing");
        assert_eq!(TestState::Stopped.to_string(), "stopped");
    }
}
