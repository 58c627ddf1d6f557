use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to a run whose approval deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Resume the run down the reject path
    Reject,
    /// Mark the run FAILED with a timeout error
    Fail,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Reject
    }
}

/// Runtime settings for the workflow runner (`[engine]` section of the config file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds a run may wait for approval; unset waits forever
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Live event buffer per subscriber. A subscriber that falls further
    /// behind replays the missed events from the run log.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Seconds a COMPLETED or FAILED run stays inspectable before it is
    /// evicted; unset keeps finished runs for the life of the process
    #[serde(default)]
    pub retain_finished_secs: Option<u64>,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: None,
            timeout_policy: TimeoutPolicy::default(),
            event_capacity: default_event_capacity(),
            retain_finished_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs.map(Duration::from_secs)
    }

    pub fn retain_finished(&self) -> Option<Duration> {
        self.retain_finished_secs.map(Duration::from_secs)
    }

    pub fn with_retention(mut self, secs: u64) -> Self {
        self.retain_finished_secs = Some(secs);
        self
    }

    pub fn with_approval_timeout(mut self, secs: u64, policy: TimeoutPolicy) -> Self {
        self.approval_timeout_secs = Some(secs);
        self.timeout_policy = policy;
        self
    }
}
