//! Runtime configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::ApiServerConfig;
use crate::dispatcher::DispatcherConfig;
use crate::lanes::DEFAULT_PARALLEL_WIDTH;

/// Upper bound on the parallel lane width.
pub const MAX_PARALLEL_WIDTH: usize = 256;
use crate::notification::WebhookAlertConfig;
use crate::runner::ProcessRunnerConfig;
use crate::{Error, Result};

/// Deployment tier; selects the default listener port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Prod,
    Staging,
    Dev,
}

impl AppEnv {
    /// Anything other than `prod` or `staging` is treated as dev.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn listener_port(&self) -> u16 {
        match self {
            Self::Prod => 7702,
            Self::Staging => 7701,
            Self::Dev => 7002,
        }
    }
}

/// Full runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub app_env: AppEnv,
    pub listener: ApiServerConfig,
    /// Job Source Gateway base URL.
    pub job_service_url: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub dispatcher: DispatcherConfig,
    pub tasks_dir: PathBuf,
    /// Launcher prefix for task scripts; empty runs them directly.
    pub interpreter: Vec<String>,
    pub runner: ProcessRunnerConfig,
    /// Optional registry file replacing the built-in table.
    pub registry_file: Option<PathBuf>,
    pub alert_webhook: Option<WebhookAlertConfig>,
    pub gateway_timeout: Duration,
    pub log_dir: PathBuf,
}

impl RunnerConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let app_env = get("APP_ENV")
            .map(|v| AppEnv::parse(&v))
            .unwrap_or(AppEnv::Dev);

        let mut listener = ApiServerConfig {
            port: app_env.listener_port(),
            ..ApiServerConfig::default()
        };
        if let Some(bind) = get("JOB_RUNNER_BIND") {
            listener.bind_address = bind;
        }
        if let Some(port) = parse_opt::<u16>(&get, "JOB_RUNNER_PORT")? {
            listener.port = port;
        }

        let job_service_url = get("JOB_SERVICE_URL")
            .ok_or_else(|| Error::config("JOB_SERVICE_URL must be set"))?;
        let database_url =
            get("DATABASE_URL").ok_or_else(|| Error::config("DATABASE_URL must be set"))?;

        let parallel_width =
            parse_opt::<usize>(&get, "JOB_RUNNER_PARALLEL_WIDTH")?.unwrap_or(DEFAULT_PARALLEL_WIDTH);
        if !(1..=MAX_PARALLEL_WIDTH).contains(&parallel_width) {
            return Err(Error::config(format!(
                "JOB_RUNNER_PARALLEL_WIDTH must be between 1 and {}",
                MAX_PARALLEL_WIDTH
            )));
        }

        let dispatcher = DispatcherConfig {
            wait_timeout: Duration::from_secs(
                parse_opt(&get, "JOB_RUNNER_WAIT_TIMEOUT_SECS")?.unwrap_or(60),
            ),
            cycle_delay: Duration::from_secs(
                parse_opt(&get, "JOB_RUNNER_CYCLE_DELAY_SECS")?.unwrap_or(5),
            ),
            parallel_width,
        };

        let interpreter = match lookup("JOB_RUNNER_INTERPRETER") {
            Some(value) => value.split_whitespace().map(str::to_string).collect(),
            None => vec!["python3".to_string(), "-u".to_string()],
        };

        let mut runner = ProcessRunnerConfig::default();
        if let Some(var) = get("JOB_RUNNER_SEARCH_PATH_VAR") {
            runner.search_path_var = var;
        }
        if let Some(paths) = get("JOB_RUNNER_SEARCH_PATH") {
            runner.search_path = std::env::split_paths(&paths).collect();
        }

        Ok(Self {
            app_env,
            listener,
            job_service_url,
            database_url,
            database_max_connections: parse_opt(&get, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(parallel_width as u32 + 5),
            dispatcher,
            tasks_dir: get("JOB_RUNNER_TASKS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tasks")),
            interpreter,
            runner,
            registry_file: get("JOB_RUNNER_REGISTRY").map(PathBuf::from),
            alert_webhook: get("ALERT_WEBHOOK_URL").map(WebhookAlertConfig::new),
            gateway_timeout: Duration::from_secs(
                parse_opt(&get, "JOB_SERVICE_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            log_dir: get("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
        })
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, raw, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<RunnerConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunnerConfig::from_lookup(|key| map.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("JOB_SERVICE_URL", "http://jobs.local/api/v1"),
        ("DATABASE_URL", "postgres://localhost/jobs"),
    ];

    #[test]
    fn defaults() {
        let cfg = config(&REQUIRED).unwrap();
        assert_eq!(cfg.app_env, AppEnv::Dev);
        assert_eq!(cfg.listener.port, 7002);
        assert_eq!(cfg.dispatcher.parallel_width, 5);
        assert_eq!(cfg.dispatcher.wait_timeout, Duration::from_secs(60));
        assert_eq!(cfg.dispatcher.cycle_delay, Duration::from_secs(5));
        assert_eq!(cfg.interpreter, vec!["python3", "-u"]);
        assert_eq!(cfg.runner.search_path_var, "PYTHONPATH");
        assert_eq!(cfg.tasks_dir, PathBuf::from("tasks"));
        assert!(cfg.alert_webhook.is_none());
        assert!(cfg.registry_file.is_none());
    }

    #[test]
    fn port_follows_tier_unless_overridden() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("APP_ENV", "prod"));
        assert_eq!(config(&vars).unwrap().listener.port, 7702);

        vars[2] = ("APP_ENV", "staging");
        assert_eq!(config(&vars).unwrap().listener.port, 7701);

        vars.push(("JOB_RUNNER_PORT", "9000"));
        assert_eq!(config(&vars).unwrap().listener.port, 9000);
    }

    #[test]
    fn missing_required_values_fail() {
        assert!(matches!(
            config(&REQUIRED[..1]),
            Err(Error::Configuration(msg)) if msg.contains("DATABASE_URL")
        ));
        assert!(config(&[]).is_err());
    }

    #[test]
    fn invalid_values_fail() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("JOB_RUNNER_PARALLEL_WIDTH", "0"));
        assert!(config(&vars).is_err());

        vars[2] = ("JOB_RUNNER_PARALLEL_WIDTH", "many");
        assert!(matches!(config(&vars), Err(Error::Configuration(_))));
    }

    #[test]
    fn parallel_width_is_bounded() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("JOB_RUNNER_PARALLEL_WIDTH", "4294967296"));
        assert!(matches!(
            config(&vars),
            Err(Error::Configuration(msg)) if msg.contains("between 1 and 256")
        ));

        vars[2] = ("JOB_RUNNER_PARALLEL_WIDTH", "256");
        let cfg = config(&vars).unwrap();
        assert_eq!(cfg.dispatcher.parallel_width, 256);
        assert_eq!(cfg.database_max_connections, 261);
    }

    #[test]
    fn empty_interpreter_runs_scripts_directly() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("JOB_RUNNER_INTERPRETER", ""));
        vars.push(("ALERT_WEBHOOK_URL", "https://ping.example/hook"));
        let cfg = config(&vars).unwrap();
        assert!(cfg.interpreter.is_empty());
        assert_eq!(cfg.alert_webhook.unwrap().url, "https://ping.example/hook");
    }
}
