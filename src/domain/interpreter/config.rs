use std::time::Duration;

use crate::api::config_dto::InterpreterConfigDto;
use crate::error::{Error, Result};

/// How the input lists of a ForEach are combined into fan-out runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForEachPolicy {
    /// Lists of length 1 are broadcast, all others must have equal length.
    #[default]
    Zipped,
    /// Every pairing of exactly two lists.
    CrossProduct,
}

impl ForEachPolicy {
    pub fn parse(name: &str) -> Option<ForEachPolicy> {
        let normalized: String = name.chars().filter(|c| *c != '_' && *c != '-').collect::<String>().to_ascii_lowercase();
        match normalized.as_str() {
            "zipped" | "zip" | "broadcast" => Some(ForEachPolicy::Zipped),
            "crossproduct" | "cross" => Some(ForEachPolicy::CrossProduct),
            _ => None,
        }
    }
}

/// Settings threaded through the scheduler, every handler and nested interpreters.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Sleep between two scheduler ticks.
    pub poll_interval: Duration,

    /// Poll interval while paused doubles from `pause_backoff_initial` up to `pause_backoff_max`.
    pub pause_backoff_initial: Duration,
    pub pause_backoff_max: Duration,

    /// How long cleanup waits for handler units to wind down before aborting them.
    pub handler_grace_period: Duration,

    pub for_each_policy: ForEachPolicy,

    /// Joins the fields of a ForEach input combination, and splits string inputs into lists.
    pub for_each_delimiter: String,

    /// Upper bound on concurrently running ForEach body executions.
    pub max_parallel_runs: usize,

    /// Optional cap on DoWhile iterations. `None` loops until the condition is false.
    pub max_loop_iterations: Option<usize>,

    /// Passed along with every task submission.
    pub credential_token: String,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            poll_interval: Duration::from_millis(20),
            pause_backoff_initial: Duration::from_millis(20),
            pause_backoff_max: Duration::from_secs(1),
            handler_grace_period: Duration::from_secs(5),
            for_each_policy: ForEachPolicy::Zipped,
            for_each_delimiter: ",".to_string(),
            max_parallel_runs: 16,
            max_loop_iterations: None,
            credential_token: String::new(),
        }
    }
}

impl InterpreterConfig {
    /// Overlays the fields present in `dto` onto the defaults.
    pub fn from_dto(dto: InterpreterConfigDto) -> Result<Self> {
        let mut config = InterpreterConfig::default();

        if let Some(ms) = dto.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = dto.pause_backoff_initial_ms {
            config.pause_backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = dto.pause_backoff_max_ms {
            config.pause_backoff_max = Duration::from_millis(ms);
        }
        if let Some(ms) = dto.handler_grace_period_ms {
            config.handler_grace_period = Duration::from_millis(ms);
        }
        if let Some(policy) = dto.for_each_policy {
            config.for_each_policy = ForEachPolicy::parse(&policy).ok_or_else(|| Error::ConfigError(format!("Unknown ForEach policy '{}'", policy)))?;
        }
        if let Some(delimiter) = dto.for_each_delimiter {
            if delimiter.is_empty() {
                return Err(Error::ConfigError("ForEach delimiter must not be empty".to_string()));
            }
            config.for_each_delimiter = delimiter;
        }
        if let Some(runs) = dto.max_parallel_runs {
            if runs == 0 {
                return Err(Error::ConfigError("maxParallelRuns must be at least 1".to_string()));
            }
            config.max_parallel_runs = runs;
        }
        if let Some(token) = dto.credential_token {
            config.credential_token = token;
        }
        config.max_loop_iterations = dto.max_loop_iterations;

        if config.pause_backoff_max < config.pause_backoff_initial {
            config.pause_backoff_max = config.pause_backoff_initial;
        }

        Ok(config)
    }
}
