//! Agent configuration.
//!
//! Every setting has a default and can be overridden through the
//! environment; the binary layers command-line flags on top.

use crate::error::{Error, Result};

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
    pub const MQTT_KEEP_ALIVE_SECS: &str = "MQTT_KEEP_ALIVE_SECS";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
    /// Switches the binary to JSON log lines.
    pub const LOG_JSON: &str = "IOTAGENT_LOG_JSON";
}

/// Default values.
pub mod defaults {
    pub const MQTT_HOST: &str = "localhost";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_KEEP_ALIVE_SECS: u64 = 60;
    pub const CLIENT_ID_PREFIX: &str = "iotagent-mqtt";
}

/// Runtime configuration for the agent and its MQTT transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub log_json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mqtt_host: defaults::MQTT_HOST.to_string(),
            mqtt_port: defaults::MQTT_PORT,
            client_id: generated_client_id(),
            keep_alive_secs: defaults::MQTT_KEEP_ALIVE_SECS,
            username: None,
            password: None,
            log_json: false,
        }
    }
}

impl AgentConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup(env_vars::MQTT_HOST) {
            config.mqtt_host = host;
        }
        config.mqtt_port = lookup(env_vars::MQTT_PORT)
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::MQTT_PORT);
        if let Some(client_id) = lookup(env_vars::MQTT_CLIENT_ID) {
            config.client_id = client_id;
        }
        config.keep_alive_secs = lookup(env_vars::MQTT_KEEP_ALIVE_SECS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::MQTT_KEEP_ALIVE_SECS);
        config.username = lookup(env_vars::MQTT_USERNAME);
        config.password = lookup(env_vars::MQTT_PASSWORD);
        config.log_json = lookup(env_vars::LOG_JSON)
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);
        config
    }

    /// Set the broker host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.mqtt_host = host.into();
        self
    }

    /// Set the broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.mqtt_port = port;
        self
    }

    /// Set broker credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Reject configurations the transport cannot use.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt_host.trim().is_empty() {
            return Err(Error::config("MQTT host must not be empty"));
        }
        if self.mqtt_port == 0 {
            return Err(Error::config("MQTT port must not be 0"));
        }
        if self.client_id.is_empty() {
            return Err(Error::config("MQTT client id must not be empty"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::config(
                "MQTT username and password must be set together",
            ));
        }
        Ok(())
    }

    /// `host:port` of the broker.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.mqtt_host, self.mqtt_port)
    }
}

fn generated_client_id() -> String {
    format!("{}-{}", defaults::CLIENT_ID_PREFIX, uuid::Uuid::new_v4())
}
