//! Configuration system for kgmerge.
//!
//! An [`EngineConfig`] is loaded once at startup and shared by reference with
//! every engine component. It carries the per-type storage schema, the
//! extracted-to-storage field mapping with merge strategies, the match rules,
//! and the runtime knobs for retries, timeouts and batch concurrency.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KgError, KgResult};
use crate::traits::{EmbedderProvider, EmbedderProviderConfig, GraphStoreConfig, GraphStoreProvider};

/// Declared storage fields of one entity type: field name to type string.
///
/// Type strings follow the store's vocabulary (`STRING`, `DOUBLE`, ...); a
/// `[]` suffix marks an array field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitySchema {
    fields: BTreeMap<String, String>,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    pub fn with_field(mut self, name: impl Into<String>, field_type: impl Into<String>) -> Self {
        self.fields.insert(name.into(), field_type.into());
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_type(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_array(&self, name: &str) -> bool {
        self.field_type(name).is_some_and(|t| t.trim_end().ends_with("[]"))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Conflict-resolution strategy for one storage field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep a non-empty existing value.
    #[serde(alias = "preserveExisting")]
    PreserveExisting,
    /// Union of existing and new values, order preserved.
    #[serde(alias = "appendUnique")]
    AppendUnique,
    /// Replace when the new value is strictly longer.
    #[serde(alias = "replaceIfBetter")]
    ReplaceIfBetter,
    /// Last writer wins.
    #[serde(alias = "replaceAlways")]
    ReplaceAlways,
    /// Only written by system or cleanup processes.
    #[serde(alias = "agentOnly")]
    AgentOnly,
}

/// Mapping and strategy for one storage field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Extracted field name that feeds this storage field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
}

impl FieldSpec {
    pub fn mapped_from(extracted: impl Into<String>) -> Self {
        Self {
            mapping: Some(extracted.into()),
            merge_strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = Some(strategy);
        self
    }
}

/// How a rule compares values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuleKind {
    /// Normalized equality of a scalar field.
    Exact,
    /// Membership of a scalar in a list field, or list overlap.
    Search,
}

/// Shape of the storage field a rule targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    #[serde(alias = "string")]
    Scalar,
    List,
}

/// One match rule for an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    #[serde(alias = "rule")]
    pub kind: RuleKind,
    /// Extracted field read from each record.
    #[serde(alias = "match")]
    pub source_field: String,
    /// Storage field compared against; defaults to `source_field`.
    #[serde(default, alias = "db")]
    pub storage_field: String,
    #[serde(default, alias = "type")]
    pub value_type: ValueType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Lower is evaluated first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_priority() -> u32 {
    999
}

impl MatchRule {
    /// Exact rule on a field stored under the same name.
    pub fn exact(field: impl Into<String>, confidence: f64, priority: u32) -> Self {
        let field = field.into();
        Self {
            kind: RuleKind::Exact,
            storage_field: field.clone(),
            source_field: field,
            value_type: ValueType::Scalar,
            confidence,
            priority,
        }
    }

    /// Search rule: scalar `source_field` against list `storage_field`.
    pub fn search(
        source_field: impl Into<String>,
        storage_field: impl Into<String>,
        confidence: f64,
        priority: u32,
    ) -> Self {
        Self {
            kind: RuleKind::Search,
            source_field: source_field.into(),
            storage_field: storage_field.into(),
            value_type: ValueType::List,
            confidence,
            priority,
        }
    }

    /// Target a different storage field.
    pub fn stored_as(mut self, storage_field: impl Into<String>) -> Self {
        self.storage_field = storage_field.into();
        self
    }
}

/// Retry policy for transient store failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum delay between retries (milliseconds)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0_f32,
        }
    }
}

impl RetryPolicy {
    /// No retries; useful in tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Storage schema per entity type.
    pub schema: BTreeMap<String, EntitySchema>,
    /// Field mapping and strategies per entity type, keyed by storage field.
    pub fields: BTreeMap<String, BTreeMap<String, FieldSpec>>,
    /// Match rules per entity type.
    pub matching: BTreeMap<String, Vec<MatchRule>>,
    /// Storage fields whose change triggers re-embedding.
    pub content_fields: Vec<String>,
    /// Retry policy for store calls.
    pub retry: RetryPolicy,
    /// Deadline for a single store call.
    pub store_timeout_ms: u64,
    /// Deadline for a single embedding call.
    pub embedding_timeout_ms: u64,
    /// Batches merged at once by the pipeline.
    pub max_concurrent_batches: usize,
    /// Graph store configuration.
    pub graph_store: GraphStoreConfig,
    /// Embedder configuration.
    pub embedder: EmbedderProviderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: BTreeMap::new(),
            fields: BTreeMap::new(),
            matching: BTreeMap::new(),
            content_fields: vec![
                "name".to_string(),
                "rawDescriptions".to_string(),
                "title".to_string(),
            ],
            retry: RetryPolicy::default(),
            store_timeout_ms: 30_000,
            embedding_timeout_ms: 10_000,
            max_concurrent_batches: 1,
            graph_store: GraphStoreConfig::default(),
            embedder: EmbedderProviderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> KgResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KgError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let ext = path.extension().and_then(|e| e.to_str());

        let config: Self = match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| KgError::Configuration(e.to_string()))?
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| KgError::Configuration(e.to_string()))?,
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| KgError::Configuration(e.to_string()))?,
            _ => {
                return Err(KgError::Configuration(
                    "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
                ))
            }
        };

        config.prepared()
    }

    /// Load configuration from environment variables.
    ///
    /// `KGMERGE_CONFIG` names a config file; otherwise the user config file is
    /// used when present. Individual settings are then overridden from the
    /// environment.
    pub fn from_env() -> KgResult<Self> {
        let mut config = match std::env::var("KGMERGE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Default location of the user config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("kgmerge").join("config.yaml"))
    }

    /// Apply `KGMERGE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> KgResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("KGMERGE_STORE_URL") {
            self.graph_store.url = url;
        }
        if let Some(provider) = lookup("KGMERGE_STORE_PROVIDER") {
            self.graph_store.provider = provider.parse::<GraphStoreProvider>().map_err(|_| {
                KgError::Configuration(format!("unknown store provider '{}'", provider))
            })?;
        }
        if let Some(provider) = lookup("KGMERGE_EMBEDDER") {
            self.embedder.provider = provider.parse::<EmbedderProvider>().map_err(|_| {
                KgError::Configuration(format!("unknown embedder '{}'", provider))
            })?;
        }
        if let Some(model) = lookup("KGMERGE_EMBEDDING_MODEL") {
            self.embedder.config.model = model;
        }
        if let Some(url) = lookup("KGMERGE_EMBEDDING_URL") {
            self.embedder.config.base_url = Some(url);
        }
        if let Some(n) = lookup("KGMERGE_MAX_CONCURRENT_BATCHES") {
            self.max_concurrent_batches = n.trim().parse().map_err(|_| {
                KgError::Configuration(format!("KGMERGE_MAX_CONCURRENT_BATCHES must be a positive integer, got '{}'", n))
            })?;
        }
        Ok(())
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Fill rule defaults, sort rules by priority, and validate.
    fn prepared(mut self) -> KgResult<Self> {
        for rules in self.matching.values_mut() {
            for rule in rules.iter_mut() {
                if rule.storage_field.is_empty() {
                    rule.storage_field = rule.source_field.clone();
                }
            }
            rules.sort_by_key(|r| r.priority);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants that would otherwise surface mid-batch.
    pub fn validate(&self) -> KgResult<()> {
        for (entity_type, rules) in &self.matching {
            for rule in rules {
                if rule.source_field.trim().is_empty() {
                    return Err(KgError::Configuration(format!(
                        "{}: match rule has no source field",
                        entity_type
                    )));
                }
                if !(0.0..=1.0).contains(&rule.confidence) {
                    return Err(KgError::Configuration(format!(
                        "{}.{}: confidence {} is outside [0, 1]",
                        entity_type, rule.source_field, rule.confidence
                    )));
                }
                if rule.kind == RuleKind::Search && rule.value_type != ValueType::List {
                    return Err(KgError::Configuration(format!(
                        "{}.{}: search rules require type 'list'",
                        entity_type, rule.source_field
                    )));
                }
            }
        }
        if self.retry.multiplier < 1.0 {
            return Err(KgError::Configuration(format!(
                "retry.multiplier must be at least 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.max_concurrent_batches == 0 {
            return Err(KgError::Configuration(
                "max_concurrent_batches must be at least 1".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(KgError::Configuration(
                "store_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Match rules for a type, in priority order.
    pub fn rules_for(&self, entity_type: &str) -> &[MatchRule] {
        self.matching
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn schema_for(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.schema.get(entity_type)
    }

    /// Error when a rule compares against a field the type's schema lacks.
    pub fn check_rule_field(&self, entity_type: &str, rule: &MatchRule) -> KgResult<()> {
        if self.has_field(entity_type, &rule.storage_field) {
            return Ok(());
        }
        Err(KgError::config_mismatch(
            entity_type,
            &rule.storage_field,
            "field not in schema, rule skipped",
        ))
    }

    /// Whether the type's schema declares `field`.
    pub fn has_field(&self, entity_type: &str, field: &str) -> bool {
        self.schema_for(entity_type)
            .is_some_and(|s| s.has_field(field))
    }

    /// Whether `field` is declared as an array field of the type.
    pub fn is_array_field(&self, entity_type: &str, field: &str) -> bool {
        self.schema_for(entity_type)
            .is_some_and(|s| s.is_array(field))
    }

    /// Storage field fed by an extracted field. Unmapped fields pass through.
    pub fn target_field<'a>(&'a self, entity_type: &str, extracted: &'a str) -> Cow<'a, str> {
        self.fields
            .get(entity_type)
            .and_then(|specs| {
                specs
                    .iter()
                    .find(|(_, spec)| spec.mapping.as_deref() == Some(extracted))
                    .map(|(storage, _)| Cow::Borrowed(storage.as_str()))
            })
            .unwrap_or(Cow::Borrowed(extracted))
    }

    /// Merge strategy of a storage field.
    pub fn strategy_for(&self, entity_type: &str, storage_field: &str) -> MergeStrategy {
        self.fields
            .get(entity_type)
            .and_then(|specs| specs.get(storage_field))
            .and_then(|spec| spec.merge_strategy)
            .unwrap_or_else(|| {
                if self.is_array_field(entity_type, storage_field) {
                    MergeStrategy::AppendUnique
                } else {
                    MergeStrategy::ReplaceIfBetter
                }
            })
    }

    pub fn is_content_field(&self, field: &str) -> bool {
        self.content_fields.iter().any(|f| f == field)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }
}

/// Builder for EngineConfig.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Declare the schema of an entity type.
    pub fn schema(mut self, entity_type: impl Into<String>, schema: EntitySchema) -> Self {
        self.config.schema.insert(entity_type.into(), schema);
        self
    }

    /// Configure one storage field of an entity type.
    pub fn field(
        mut self,
        entity_type: impl Into<String>,
        storage_field: impl Into<String>,
        spec: FieldSpec,
    ) -> Self {
        self.config
            .fields
            .entry(entity_type.into())
            .or_default()
            .insert(storage_field.into(), spec);
        self
    }

    /// Add a match rule for an entity type.
    pub fn rule(mut self, entity_type: impl Into<String>, rule: MatchRule) -> Self {
        self.config
            .matching
            .entry(entity_type.into())
            .or_default()
            .push(rule);
        self
    }

    /// Set the content fields.
    pub fn content_fields(mut self, fields: Vec<&str>) -> Self {
        self.config.content_fields = fields.into_iter().map(String::from).collect();
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the store call timeout.
    pub fn store_timeout_ms(mut self, ms: u64) -> Self {
        self.config.store_timeout_ms = ms;
        self
    }

    /// Set the embedding call timeout.
    pub fn embedding_timeout_ms(mut self, ms: u64) -> Self {
        self.config.embedding_timeout_ms = ms;
        self
    }

    /// Set batch concurrency.
    pub fn max_concurrent_batches(mut self, n: usize) -> Self {
        self.config.max_concurrent_batches = n;
        self
    }

    /// Set graph store configuration.
    pub fn graph_store(mut self, config: GraphStoreConfig) -> Self {
        self.config.graph_store = config;
        self
    }

    /// Set embedder configuration.
    pub fn embedder(mut self, config: EmbedderProviderConfig) -> Self {
        self.config.embedder = config;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> KgResult<EngineConfig> {
        self.config.prepared()
    }
}
