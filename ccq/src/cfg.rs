use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    admission::{AllowedRequesters, parse_allowed_requesters},
    chain::{ChainId, default_supported_query_chains},
};

/// The network a node is running in. Determines the domain separation tag of signed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    Mainnet,
    Testnet,
    #[serde(alias = "devnet")]
    UnsafeDevNet,
    /// Used by tests. Signs like a devnet.
    Test,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" => Ok(Environment::Mainnet),
            "testnet" => Ok(Environment::Testnet),
            "unsafe-dev-net" | "devnet" => Ok(Environment::UnsafeDevNet),
            "test" => Ok(Environment::Test),
            _ => Err(anyhow!("unknown environment: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    pub environment: Environment,
    /// Comma separated list of hex-encoded addresses which may submit queries.
    pub allowed_requesters: String,
    /// How long a request may stay in flight before it is abandoned. Defaults to 1 minute.
    #[serde(default = "request_timeout_default")]
    pub request_timeout: Duration,
    /// How long to wait before re-dispatching a leg which needs a retry or has not been answered. Defaults to 10
    /// seconds.
    #[serde(default = "retry_interval_default")]
    pub retry_interval: Duration,
    /// Chains which may be queried. A chain must also have a watcher to be usable.
    #[serde(default = "default_supported_query_chains")]
    pub supported_chains: Vec<ChainId>,
    /// Capacity of the inbound signed request channel.
    #[serde(default = "signed_request_channel_size_default")]
    pub signed_request_channel_size: usize,
    /// Capacity of each per-chain watcher request channel.
    #[serde(default = "chain_request_channel_size_default")]
    pub chain_request_channel_size: usize,
    /// Capacity of the channel shared by all watchers for their responses.
    #[serde(default = "response_channel_size_default")]
    pub response_channel_size: usize,
    /// Capacity of the outbound publication channel.
    #[serde(default = "publication_channel_size_default")]
    pub publication_channel_size: usize,
    /// Log a warning when more than this many completed responses are waiting to be published. Nothing is dropped.
    #[serde(default = "publication_backlog_warning_default")]
    pub publication_backlog_warning: usize,
}

pub fn request_timeout_default() -> Duration {
    Duration::from_secs(60)
}

pub fn retry_interval_default() -> Duration {
    Duration::from_secs(10)
}

pub fn signed_request_channel_size_default() -> usize {
    50
}

pub fn chain_request_channel_size_default() -> usize {
    25
}

pub fn response_channel_size_default() -> usize {
    500
}

pub fn publication_channel_size_default() -> usize {
    50
}

pub fn publication_backlog_warning_default() -> usize {
    100
}

impl QueryConfig {
    pub fn new(environment: Environment, allowed_requesters: impl Into<String>) -> Self {
        QueryConfig {
            environment,
            allowed_requesters: allowed_requesters.into(),
            request_timeout: request_timeout_default(),
            retry_interval: retry_interval_default(),
            supported_chains: default_supported_query_chains(),
            signed_request_channel_size: signed_request_channel_size_default(),
            chain_request_channel_size: chain_request_channel_size_default(),
            response_channel_size: response_channel_size_default(),
            publication_channel_size: publication_channel_size_default(),
            publication_backlog_warning: publication_backlog_warning_default(),
        }
    }

    pub fn allowed_requesters(&self) -> Result<AllowedRequesters> {
        Ok(parse_allowed_requesters(&self.allowed_requesters)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.allowed_requesters()?;
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be non-zero"));
        }
        if self.retry_interval.is_zero() {
            return Err(anyhow!("retry_interval must be non-zero"));
        }
        if self.retry_interval >= self.request_timeout {
            return Err(anyhow!(
                "retry_interval ({:?}) must be shorter than request_timeout ({:?})",
                self.retry_interval,
                self.request_timeout
            ));
        }
        for (name, size) in [
            ("signed_request_channel_size", self.signed_request_channel_size),
            ("chain_request_channel_size", self.chain_request_channel_size),
            ("response_channel_size", self.response_channel_size),
            ("publication_channel_size", self.publication_channel_size),
        ] {
            // tokio panics when asked for a zero capacity channel.
            if size == 0 {
                return Err(anyhow!("{name} must be non-zero"));
            }
        }
        Ok(())
    }
}

pub fn read_config(config_file: &Path) -> Result<QueryConfig> {
    if !config_file.exists() {
        return Err(anyhow!("config file {config_file:?} does not exist"));
    }
    let config_content = fs::read_to_string(config_file)?;
    let config: QueryConfig = toml::from_str(&config_content)?;
    config.validate()?;
    Ok(config)
}
