use bitseek_actions::dispatcher::DEFAULT_ACTION_TIMEOUT;
use bitseek_actions::{DispatchConfig, DEFAULT_EXECUTOR_URL};
use bitseek_session::config::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MESSAGE_TIMEOUT, DEFAULT_URL};
use bitseek_session::{RetryPolicy, SessionConfig, DEFAULT_IDLE_TIMEOUT};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Options shared by every subcommand. Unset flags fall back to `BITSEEK_*`
/// environment variables, then to built-in defaults.
#[derive(Args, Debug, Default, Clone)]
pub struct GlobalArgs {
    /// WebSocket endpoint of the generation service
    #[arg(long, global = true)]
    pub url: Option<String>,
    /// Base URL of the action executor
    #[arg(long, global = true)]
    pub executor_url: Option<String>,
    #[arg(long, global = true)]
    pub heartbeat_interval_ms: Option<u64>,
    #[arg(long, global = true)]
    pub message_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    pub action_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    pub retry_delay_ms: Option<u64>,
    /// Total executor attempts per action
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
    #[arg(long, global = true)]
    pub idle_timeout_secs: Option<u64>,
    /// Log per-chunk stream events
    #[arg(long, global = true)]
    pub verbose: bool,
    /// Show raw results and error details
    #[arg(long, global = true)]
    pub debug: bool,
    /// Directory for an append-only log file
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub executor_url: String,
    pub idle_timeout: Duration,
    pub verbose: bool,
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn resolve<E>(args: &GlobalArgs, env: E) -> Self
    where
        E: Fn(&str) -> Option<String>,
    {
        let verbose = resolve_flag(args.verbose, "BITSEEK_VERBOSE", &env);
        let debug = resolve_flag(args.debug, "BITSEEK_DEBUG", &env);

        let mut session = SessionConfig::with_url(resolve_text(
            args.url.as_deref(),
            "BITSEEK_URL",
            &env,
            DEFAULT_URL,
        ));
        session.heartbeat_interval = Duration::from_millis(resolve_number(
            args.heartbeat_interval_ms,
            "BITSEEK_HEARTBEAT_INTERVAL_MS",
            &env,
            DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
        ));
        session.message_timeout = Duration::from_millis(resolve_number(
            args.message_timeout_ms,
            "BITSEEK_MESSAGE_TIMEOUT_MS",
            &env,
            DEFAULT_MESSAGE_TIMEOUT.as_millis() as u64,
        ));
        session.verbose = verbose;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            resolve_number(
                args.max_retries,
                "BITSEEK_MAX_RETRIES",
                &env,
                defaults.max_attempts,
            ),
            Duration::from_millis(resolve_number(
                args.retry_delay_ms,
                "BITSEEK_RETRY_DELAY_MS",
                &env,
                defaults.initial_delay.as_millis() as u64,
            )),
        );
        let dispatch = DispatchConfig {
            retry,
            action_timeout: Duration::from_millis(resolve_number(
                args.action_timeout_ms,
                "BITSEEK_ACTION_TIMEOUT_MS",
                &env,
                DEFAULT_ACTION_TIMEOUT.as_millis() as u64,
            )),
            debug,
        };

        let log_dir = args.log_dir.clone().or_else(|| {
            env("BITSEEK_LOG_DIR")
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        });

        Self {
            session,
            dispatch,
            executor_url: resolve_text(
                args.executor_url.as_deref(),
                "BITSEEK_EXECUTOR_URL",
                &env,
                DEFAULT_EXECUTOR_URL,
            ),
            idle_timeout: Duration::from_secs(resolve_number(
                args.idle_timeout_secs,
                "BITSEEK_IDLE_TIMEOUT_SECS",
                &env,
                DEFAULT_IDLE_TIMEOUT.as_secs(),
            )),
            verbose,
            debug,
            log_dir,
        }
    }
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF" => Some(false),
        _ => None,
    }
}

fn resolve_flag<E>(flag: bool, var: &str, env: &E) -> bool
where
    E: Fn(&str) -> Option<String>,
{
    if flag {
        return true;
    }
    env(var)
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false)
}

fn resolve_text<E>(flag: Option<&str>, var: &str, env: &E, default: &str) -> String
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(value) = flag.filter(|value| !value.trim().is_empty()) {
        return value.to_string();
    }
    if let Some(value) = env(var).filter(|value| !value.trim().is_empty()) {
        return value;
    }
    default.to_string()
}

fn resolve_number<T, E>(flag: Option<T>, var: &str, env: &E, default: T) -> T
where
    T: std::str::FromStr,
    E: Fn(&str) -> Option<String>,
{
    if let Some(value) = flag {
        return value;
    }
    env(var)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_flags_or_env() {
        let config = RuntimeConfig::resolve(&GlobalArgs::default(), env_of(&[]));
        assert_eq!(config.session.url, DEFAULT_URL);
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.session.message_timeout, Duration::from_secs(120));
        assert_eq!(config.executor_url, DEFAULT_EXECUTOR_URL);
        assert_eq!(config.dispatch.action_timeout, Duration::from_secs(60));
        assert_eq!(config.dispatch.retry, RetryPolicy::default());
        assert_eq!(config.idle_timeout, Duration::from_secs(1200));
        assert!(!config.verbose);
        assert!(!config.debug);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn flag_beats_env_beats_default() {
        let env = env_of(&[
            ("BITSEEK_URL", "ws://env.example/generate"),
            ("BITSEEK_MESSAGE_TIMEOUT_MS", "5000"),
            ("BITSEEK_MAX_RETRIES", "7"),
            ("BITSEEK_DEBUG", "yes"),
            ("BITSEEK_LOG_DIR", "/tmp/bitseek-logs"),
        ]);
        let args = GlobalArgs {
            url: Some("ws://flag.example/generate".to_string()),
            max_retries: Some(2),
            ..GlobalArgs::default()
        };
        let config = RuntimeConfig::resolve(&args, env);
        assert_eq!(config.session.url, "ws://flag.example/generate");
        assert_eq!(config.session.message_timeout, Duration::from_millis(5000));
        assert_eq!(config.dispatch.retry.max_attempts, 2);
        assert!(config.debug);
        assert!(config.dispatch.debug);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/bitseek-logs")));
    }

    #[test]
    fn unparseable_env_values_fall_back() {
        let env = env_of(&[
            ("BITSEEK_HEARTBEAT_INTERVAL_MS", "soon"),
            ("BITSEEK_VERBOSE", "maybe"),
            ("BITSEEK_EXECUTOR_URL", "   "),
        ]);
        let config = RuntimeConfig::resolve(&GlobalArgs::default(), env);
        assert_eq!(config.session.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert!(!config.verbose);
        assert_eq!(config.executor_url, DEFAULT_EXECUTOR_URL);
    }

    #[test]
    fn verbose_env_reaches_session() {
        let env = env_of(&[("BITSEEK_VERBOSE", "on")]);
        let config = RuntimeConfig::resolve(&GlobalArgs::default(), env);
        assert!(config.verbose);
        assert!(config.session.verbose);
    }

    #[test]
    fn bool_env_values() {
        assert_eq!(parse_bool_env(" true "), Some(true));
        assert_eq!(parse_bool_env("OFF"), Some(false));
        assert_eq!(parse_bool_env("sometimes"), None);
    }
}
