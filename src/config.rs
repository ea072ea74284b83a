use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use stream_backend::{BackendType, Credentials};

use crate::errors::WatchdogError;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server_url: Option<String>,
    pub backend: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Must match exactly what the backend reports for our own probe client
    pub user_agent: String,
    pub query_interval: u64,
    pub buffer_speed_threshold: f64,
    pub buffer_time_threshold: u64,
    pub buffer_extension_time: u64,
    /// 0 disables decoder error detection
    pub error_threshold: u32,
    pub error_reset_time: u64,
    pub error_switch_cooldown: u64,
    pub custom_command: Option<String>,
    pub custom_command_timeout: u64,
    pub ffmpeg_path: PathBuf,
    pub max_memory_mb: u64,
    pub memory_check_interval: u64,
    pub stop_timeout: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_url: None,
            backend: BackendType::StreamMaster.as_str().to_string(),
            username: None,
            password: None,
            user_agent: "Buffer Watchdog".to_string(),
            query_interval: 5,
            buffer_speed_threshold: 1.0,
            buffer_time_threshold: 30,
            buffer_extension_time: 10,
            error_threshold: 0,
            error_reset_time: 20,
            error_switch_cooldown: 10,
            custom_command: None,
            custom_command_timeout: 10,
            ffmpeg_path: PathBuf::from("/usr/bin/ffmpeg"),
            max_memory_mb: 150,
            memory_check_interval: 5,
            stop_timeout: 5,
            log_level: "info".to_string(),
        }
    }
}

/// Command line flags. Every flag can also be given through the environment
/// variable of the same name in upper case.
#[derive(Parser, Debug, Default)]
#[command(name = "stream-watchdog", version, about)]
pub struct Args {
    /// TOML config file; flags and environment variables override its values
    #[arg(short, long, env = "WATCHDOG_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "SERVER_URL")]
    pub server_url: Option<String>,
    /// Backend module: stream_master or dispatcharr
    #[arg(long, env = "MODULE")]
    pub backend: Option<String>,
    #[arg(long, env = "USERNAME")]
    pub username: Option<String>,
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long, env = "USER_AGENT")]
    pub user_agent: Option<String>,
    #[arg(long, env = "QUERY_INTERVAL")]
    pub query_interval: Option<u64>,
    #[arg(long, env = "BUFFER_SPEED_THRESHOLD")]
    pub buffer_speed_threshold: Option<f64>,
    #[arg(long, env = "BUFFER_TIME_THRESHOLD")]
    pub buffer_time_threshold: Option<u64>,
    #[arg(long, env = "BUFFER_EXTENSION_TIME")]
    pub buffer_extension_time: Option<u64>,
    #[arg(long, env = "ERROR_THRESHOLD")]
    pub error_threshold: Option<u32>,
    #[arg(long, env = "ERROR_RESET_TIME")]
    pub error_reset_time: Option<u64>,
    #[arg(long, env = "ERROR_SWITCH_COOLDOWN")]
    pub error_switch_cooldown: Option<u64>,
    #[arg(long, env = "CUSTOM_COMMAND")]
    pub custom_command: Option<String>,
    #[arg(long, env = "CUSTOM_COMMAND_TIMEOUT")]
    pub custom_command_timeout: Option<u64>,
    #[arg(long, env = "FFMPEG_PATH")]
    pub ffmpeg_path: Option<PathBuf>,
    #[arg(long, env = "MAX_MEMORY_MB")]
    pub max_memory_mb: Option<u64>,
    #[arg(long, env = "MEMORY_CHECK_INTERVAL")]
    pub memory_check_interval: Option<u64>,
    #[arg(long, env = "STOP_TIMEOUT")]
    pub stop_timeout: Option<u64>,
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

macro_rules! override_from {
    ($config:expr, $args:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $args.$field.clone() {
                $config.$field = value;
            }
        )+
    };
}

impl Config {
    /// Load from `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, WatchdogError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Config::default()),
        }
    }

    /// Resolve the final configuration: flags/env > file > defaults.
    pub fn from_args(args: &Args) -> Result<Self, WatchdogError> {
        let mut config = Config::load(args.config.as_deref())?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if args.server_url.is_some() {
            self.server_url = args.server_url.clone();
        }
        if args.username.is_some() {
            self.username = args.username.clone();
        }
        if args.password.is_some() {
            self.password = args.password.clone();
        }
        if args.custom_command.is_some() {
            self.custom_command = args.custom_command.clone();
        }
        override_from!(
            self,
            args,
            backend,
            user_agent,
            query_interval,
            buffer_speed_threshold,
            buffer_time_threshold,
            buffer_extension_time,
            error_threshold,
            error_reset_time,
            error_switch_cooldown,
            custom_command_timeout,
            ffmpeg_path,
            max_memory_mb,
            memory_check_interval,
            stop_timeout,
            log_level,
        );
    }

    pub fn validate(&self) -> Result<(), WatchdogError> {
        if self.server_url().is_none() {
            return Err(WatchdogError::Config("SERVER_URL is not defined".to_string()));
        }
        self.backend_type()?;
        if self.buffer_speed_threshold.is_nan() || self.buffer_speed_threshold <= 0.0 {
            return Err(WatchdogError::Config(format!(
                "buffer speed threshold must be positive, got {}",
                self.buffer_speed_threshold
            )));
        }
        if self.query_interval == 0 || self.memory_check_interval == 0 {
            return Err(WatchdogError::Config(
                "query and memory check intervals must be at least one second".to_string(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(WatchdogError::Config("user agent must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn server_url(&self) -> Option<&str> {
        self.server_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn backend_type(&self) -> Result<BackendType, WatchdogError> {
        self.backend.parse().map_err(|_| {
            WatchdogError::Config(format!(
                "unknown backend '{}', expected stream_master or dispatcharr",
                self.backend
            ))
        })
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.username
            .as_ref()
            .filter(|username| !username.is_empty())
            .map(|username| Credentials {
                username: username.clone(),
                password: self.password.clone(),
            })
    }

    pub fn custom_command(&self) -> Option<&str> {
        self.custom_command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
    }

    pub fn error_detection_enabled(&self) -> bool {
        self.error_threshold > 0
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_secs(self.memory_check_interval)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    pub fn custom_command_timeout(&self) -> Duration {
        Duration::from_secs(self.custom_command_timeout)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}
