use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::queue::QueueRegistry;

pub const ENV_PREFIX: &str = "RELAYMQ_";

fn default_db_host() -> String {
    "localhost".to_owned()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_owned()
}

fn default_db_name() -> String {
    "relaymq".to_owned()
}

fn default_max_connections() -> u32 {
    10
}

fn default_batch_size_limit() -> usize {
    100
}

fn default_max_poll_secs() -> u64 {
    300
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

/// Process configuration, read from `RELAYMQ_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Overrides the individual `db_*` settings when present.
    pub database_url: Option<String>,
    #[serde(default = "default_db_host")]
    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    #[serde(default = "default_db_user")]
    pub db_user: String,
    pub db_password: Option<String>,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Largest `limit` a single claim or sweep batch may ask for.
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: usize,
    /// Longest long poll a consumer may request.
    #[serde(default = "default_max_poll_secs")]
    pub max_poll_secs: u64,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub queues_file: Option<PathBuf>,
    pub sweep_interval_secs: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed(ENV_PREFIX).from_env::<Self>()?)
    }

    pub fn connect_options(&self) -> eyre::Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return Ok(url.parse()?);
        }

        let options = PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .username(&self.db_user)
            .database(&self.db_name);

        Ok(match &self.db_password {
            Some(password) => options.password(password),
            None => options,
        })
    }

    /// Queue policies from `queues_file`, or the built-in defaults.
    pub fn queues(&self) -> eyre::Result<QueueRegistry> {
        match &self.queues_file {
            Some(path) => QueueRegistry::load(path),
            None => Ok(QueueRegistry::default()),
        }
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_host: default_db_host(),
            db_port: default_db_port(),
            db_user: default_db_user(),
            db_password: None,
            db_name: default_db_name(),
            max_connections: default_max_connections(),
            batch_size_limit: default_batch_size_limit(),
            max_poll_secs: default_max_poll_secs(),
            listen_addr: default_listen_addr(),
            queues_file: None,
            sweep_interval_secs: None,
        }
    }
}
