use serde::{Deserialize, Serialize};

/// Interpreter settings as read from a JSON config file. Every field is optional,
/// missing fields keep the defaults of `InterpreterConfig`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct InterpreterConfigDto {
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    #[serde(default)]
    pub pause_backoff_initial_ms: Option<u64>,

    #[serde(default)]
    pub pause_backoff_max_ms: Option<u64>,

    #[serde(default)]
    pub handler_grace_period_ms: Option<u64>,

    /// "zipped" or "crossProduct"
    #[serde(default)]
    pub for_each_policy: Option<String>,

    #[serde(default)]
    pub for_each_delimiter: Option<String>,

    #[serde(default)]
    pub max_parallel_runs: Option<usize>,

    #[serde(default)]
    pub max_loop_iterations: Option<usize>,

    #[serde(default)]
    pub credential_token: Option<String>,
}
