use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use ccq_auth::AllowedRequesters;
use ccq_messages::ChainId;
use ccq_messages::Environment;
use config::builder::DefaultState;
use config::ConfigBuilder;
use config::FileFormat;
use lazy_static_include::*;
use redact::Secret;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub node: NodeConfig,
    pub query: QueryConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    pub permissions: PermissionsConfig,
    pub http: HttpConfig,
    pub prometheus: PrometheusConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub environment: Environment,
    /// Key signing response publications.
    pub guardian_private_key: Option<Secret<String>>,
    /// Key co-signing unsigned requests of trusted callers.
    pub signer_private_key: Option<Secret<String>>,
    /// Comma separated list of requester addresses. Empty disables the check.
    #[serde(default)]
    pub allowed_requesters: String,
}

impl NodeConfig {
    pub fn validate(&self) {
        for key in [&self.guardian_private_key, &self.signer_private_key]
            .into_iter()
            .flatten()
        {
            assert!(
                !key.expose_secret().is_empty(),
                "Private key value is empty"
            );
        }
    }

    pub fn allowed_requesters(&self) -> Result<Option<AllowedRequesters>> {
        if self.allowed_requesters.trim().is_empty() {
            return Ok(None);
        }
        let requesters = self
            .allowed_requesters
            .parse()
            .context("parsing allowed requesters")?;
        Ok(Some(requesters))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct QueryConfig {
    pub request_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub audit_interval_ms: u64,
    pub request_channel_size: usize,
    pub response_channel_size: usize,
    pub outcome_channel_size: usize,
    pub chain_queue_size: usize,
}

impl QueryConfig {
    pub fn validate(&self) {
        assert!(self.request_timeout_ms > 0, "Request timeout is required");
        assert!(self.retry_interval_ms > 0, "Retry interval is required");
        assert!(self.audit_interval_ms > 0, "Audit interval is required");
        assert!(
            self.audit_interval_ms <= self.request_timeout_ms,
            "Audit interval must not exceed the request timeout"
        );
        assert!(
            self.request_channel_size > 0
                && self.response_channel_size > 0
                && self.outcome_channel_size > 0
                && self.chain_queue_size > 0,
            "Channel sizes must be positive"
        );
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_millis(self.audit_interval_ms)
    }
}

#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WatcherKind {
    /// Answers with random, well formed results.
    Dummy,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    pub num_workers: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub watcher: WatcherKind,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PermissionsConfig {
    pub file: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub port: u16,
    pub response_timeout_ms: u64,
}

impl HttpConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PrometheusConfig {
    pub port: u16,
}

impl Config {
    pub fn load(local_file: Option<String>) -> Result<Config> {
        let mut config_builder = Self::defaults();

        if let Some(local_file) = local_file {
            debug!("Loading local configuration from {}", local_file);
            config_builder = config_builder.add_source(config::File::with_name(&local_file));
        }

        Self::build(config_builder)
    }

    fn defaults() -> ConfigBuilder<DefaultState> {
        config::Config::builder().add_source(config::File::from_str(
            &DEFAULT_CONFIG,
            FileFormat::Toml,
        ))
    }

    fn build(config_builder: ConfigBuilder<DefaultState>) -> Result<Config> {
        config_builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()
            .context("Could not load configuration")?
            .try_deserialize()
            .context("Could not deserialize configuration")
    }

    pub fn validate(&self) {
        self.node.validate();
        self.query.validate();

        assert!(
            !self.permissions.file.is_empty(),
            "Permissions file is required"
        );
        assert!(
            self.chains.iter().any(|c| c.enabled),
            "At least one enabled chain is required"
        );

        let mut seen = HashSet::new();
        for chain in &self.chains {
            assert!(
                chain.chain_id != ChainId::UNSET,
                "Chain id 0 is not a valid chain"
            );
            assert!(
                chain.num_workers > 0,
                "Chain {} has an invalid number of workers: {}",
                chain.chain_id,
                chain.num_workers
            );
            assert!(
                seen.insert(chain.chain_id),
                "Chain {} is configured more than once",
                chain.chain_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_with(overrides: &str) -> Result<Config> {
        Config::build(
            Config::defaults().add_source(config::File::from_str(overrides, FileFormat::Toml)),
        )
    }

    #[test]
    fn test_default_config_is_valid() -> Result<()> {
        let config = Config::load(None)?;
        config.validate();

        assert_eq!(config.node.environment, Environment::MainNet);
        assert_eq!(config.query.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.query.retry_interval(), Duration::from_secs(10));
        assert_eq!(config.query.audit_interval(), Duration::from_secs(1));
        assert!(config.node.allowed_requesters()?.is_none());
        assert!(config
            .chains
            .iter()
            .any(|c| c.chain_id == ChainId::SOLANA && c.watcher == WatcherKind::Dummy));

        Ok(())
    }

    #[test]
    fn test_local_overrides() -> Result<()> {
        let config = load_with(
            r#"
            [node]
            environment = "devnet"
            allowed_requesters = "beFA429d57cD18b7F8A4d91A2da9AB4AF05d0FBe"
            signer_private_key = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"

            [[chains]]
            chain_id = 5
            num_workers = 3
            watcher = "dummy"
            "#,
        )?;
        config.validate();

        assert_eq!(config.node.environment, Environment::DevNet);
        assert_eq!(config.node.allowed_requesters()?.map(|r| r.len()), Some(1));
        assert_eq!(config.chains.len(), 1);
        assert!(config.chains[0].enabled);
        assert!(!format!("{:?}", config.node).contains("ac0974"));

        Ok(())
    }

    #[test]
    fn test_separator_only_requesters_are_rejected() -> Result<()> {
        let config = load_with(
            r#"
            [node]
            environment = "testnet"
            allowed_requesters = ","
            "#,
        )?;
        assert!(config.node.allowed_requesters().is_err());

        Ok(())
    }

    #[test]
    #[should_panic(expected = "invalid number of workers")]
    fn test_zero_workers_is_rejected() {
        let config = load_with(
            r#"
            [[chains]]
            chain_id = 2
            num_workers = 0
            watcher = "dummy"
            "#,
        )
        .unwrap();
        config.validate();
    }

    #[test]
    #[should_panic(expected = "configured more than once")]
    fn test_duplicate_chain_is_rejected() {
        let config = load_with(
            r#"
            [[chains]]
            chain_id = 2
            num_workers = 1
            watcher = "dummy"

            [[chains]]
            chain_id = 2
            num_workers = 2
            watcher = "dummy"
            "#,
        )
        .unwrap();
        config.validate();
    }
}
