use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default size of a custom I/O context's internal buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Settings for the worker runtime behind [`crate::TaskExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
  pub worker_threads: usize,
  pub max_blocking_threads: usize,
  pub keep_alive: Duration,
  pub thread_name: String,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      worker_threads: 1,
      max_blocking_threads: 64,
      keep_alive: Duration::from_secs(10),
      thread_name: "avbridge-worker".to_string(),
    }
  }
}

fn parse_var<T: FromStr>(name: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<T> {
  let raw = lookup(name)?;
  match raw.trim().parse::<T>() {
    Ok(value) => Some(value),
    Err(_) => {
      log::warn!("ignoring {name}={raw:?}: not a valid number");
      None
    }
  }
}

fn positive(name: &str, value: Option<usize>) -> Option<usize> {
  match value {
    Some(0) => {
      log::warn!("ignoring {name}=0: must be at least 1");
      None
    }
    other => other,
  }
}

impl ExecutorConfig {
  /// Defaults overridden by `AVBRIDGE_WORKER_THREADS`,
  /// `AVBRIDGE_MAX_BLOCKING_THREADS` and `AVBRIDGE_KEEP_ALIVE_MS`.
  pub fn from_env() -> Self {
    Self::from_lookup(|name| env::var(name).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut config = Self::default();
    if let Some(n) = positive(
      "AVBRIDGE_WORKER_THREADS",
      parse_var("AVBRIDGE_WORKER_THREADS", &lookup),
    ) {
      config.worker_threads = n;
    }
    if let Some(n) = positive(
      "AVBRIDGE_MAX_BLOCKING_THREADS",
      parse_var("AVBRIDGE_MAX_BLOCKING_THREADS", &lookup),
    ) {
      config.max_blocking_threads = n;
    }
    if let Some(ms) = parse_var::<u64>("AVBRIDGE_KEEP_ALIVE_MS", &lookup) {
      config.keep_alive = Duration::from_millis(ms);
    }
    config
  }
}

/// Settings for one custom I/O context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfig {
  pub buffer_size: usize,
  /// Whether the context is opened for writing.
  pub write_flag: bool,
}

impl Default for IoConfig {
  fn default() -> Self {
    Self {
      buffer_size: DEFAULT_BUFFER_SIZE,
      write_flag: false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name| vars.get(name).cloned()
  }

  #[test]
  fn test_defaults_without_overrides() {
    assert_eq!(ExecutorConfig::from_lookup(lookup(&[])), ExecutorConfig::default());
    assert_eq!(IoConfig::default().buffer_size, 4096);
    assert!(!IoConfig::default().write_flag);
  }

  #[test]
  fn test_overrides_are_applied() {
    let config = ExecutorConfig::from_lookup(lookup(&[
      ("AVBRIDGE_WORKER_THREADS", "3"),
      ("AVBRIDGE_MAX_BLOCKING_THREADS", " 8 "),
      ("AVBRIDGE_KEEP_ALIVE_MS", "250"),
    ]));
    assert_eq!(config.worker_threads, 3);
    assert_eq!(config.max_blocking_threads, 8);
    assert_eq!(config.keep_alive, Duration::from_millis(250));
  }

  #[test]
  fn test_invalid_values_are_ignored() {
    let config = ExecutorConfig::from_lookup(lookup(&[
      ("AVBRIDGE_WORKER_THREADS", "many"),
      ("AVBRIDGE_MAX_BLOCKING_THREADS", "0"),
      ("AVBRIDGE_KEEP_ALIVE_MS", "-1"),
    ]));
    assert_eq!(config, ExecutorConfig::default());
  }
}
