//! Pipeline orchestration: engine settings, the `pipelines.yaml` registry and
//! the sequential registry runner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regcat_adapters::{transform_for_name, MatchPolicy, SelectionPolicy, TransformContext};
use regcat_core::ColumnMapping;
use regcat_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, MemberSelection, SchemaPolicy};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

pub mod engine;

pub use engine::{PipelineConfig, PipelineEngine, PipelineError, PipelineState, RunOutcome};

pub const CRATE_NAME: &str = "regcat-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub workspace_root: PathBuf,
    pub registry_path: PathBuf,
    pub working_dir: PathBuf,
    pub store_target: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("REGCAT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let registry_path = lookup("REGCAT_REGISTRY")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join("pipelines.yaml"));
        Self {
            registry_path,
            working_dir: lookup("REGCAT_WORKING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./tmp")),
            store_target: lookup("REGCAT_STORE").unwrap_or_else(|| "sqlite://data/regcat.db".to_string()),
            user_agent: lookup("REGCAT_USER_AGENT").unwrap_or_else(|| "regcat-bot/0.1".to_string()),
            http_timeout_secs: lookup("REGCAT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_max_retries: lookup("REGCAT_HTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            workspace_root,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn build_engine(&self) -> Result<PipelineEngine> {
        let fetcher = HttpFetcher::new(self.http_client_config())?;
        Ok(PipelineEngine::new(Arc::new(fetcher)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMemberRule {
    #[default]
    RequireUnique,
    Pattern,
    FirstListed,
}

fn default_enabled() -> bool {
    true
}

fn default_transform() -> String {
    "identity".to_string()
}

/// One entry of `pipelines.yaml`. Optional fields fall back to [`EngineSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub pipeline_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    pub source_url: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub strict_mapping: bool,
    #[serde(default)]
    pub normalize_column_names: bool,
    pub table_name: String,
    #[serde(default)]
    pub store_target: Option<String>,
    #[serde(default = "default_transform")]
    pub transform: String,
    #[serde(default)]
    pub extension_allowlist: Vec<String>,
    #[serde(default)]
    pub link_name_pattern: Option<String>,
    #[serde(default)]
    pub link_selection_policy: SelectionPolicy,
    #[serde(default)]
    pub archive_member_selection: ArchiveMemberRule,
    #[serde(default)]
    pub archive_member_pattern: Option<String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub schema_policy: SchemaPolicy,
    #[serde(default)]
    pub add_row_id: bool,
}

fn compile(pattern: &str, what: &str, pipeline_id: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid {what} `{pattern}` for pipeline {pipeline_id}"))
}

impl PipelineDefinition {
    pub fn to_config(&self, settings: &EngineSettings) -> Result<PipelineConfig> {
        let id = self.pipeline_id.as_str();

        let transform = transform_for_name(
            &self.transform,
            &TransformContext {
                source_url: self.source_url.clone(),
                add_row_id: self.add_row_id,
            },
        )
        .ok_or_else(|| anyhow!("no transform registered as `{}` (pipeline {id})", self.transform))?;

        let mapping = ColumnMapping::new(self.column_mapping.clone())
            .with_context(|| format!("invalid column_mapping for pipeline {id}"))?
            .strict(self.strict_mapping)
            .normalize_names(self.normalize_column_names);

        let name_pattern = self
            .link_name_pattern
            .as_deref()
            .map(|p| compile(p, "link_name_pattern", id))
            .transpose()?;
        let match_policy = MatchPolicy::new(self.extension_allowlist.as_slice())
            .with_context(|| format!("invalid extension_allowlist for pipeline {id}"))?
            .with_name_pattern(name_pattern)
            .with_selection(self.link_selection_policy);

        let member_selection = match (self.archive_member_selection, self.archive_member_pattern.as_deref()) {
            (ArchiveMemberRule::Pattern, Some(p)) => {
                MemberSelection::Pattern(compile(p, "archive_member_pattern", id)?)
            }
            (ArchiveMemberRule::Pattern, None) => {
                bail!("pipeline {id}: archive_member_selection `pattern` needs archive_member_pattern")
            }
            (ArchiveMemberRule::RequireUnique, _) => MemberSelection::RequireUnique,
            (ArchiveMemberRule::FirstListed, _) => MemberSelection::FirstListed,
        };

        if self.table_name.trim().is_empty() {
            bail!("pipeline {id}: table_name is empty");
        }

        Ok(PipelineConfig::new(
            id,
            self.source_url.clone(),
            self.working_dir.clone().unwrap_or_else(|| settings.working_dir.clone()),
            self.table_name.clone(),
            self.store_target
                .clone()
                .unwrap_or_else(|| settings.store_target.clone()),
            transform,
        )
        .with_mapping(mapping)
        .with_match_policy(match_policy)
        .with_member_selection(member_selection)
        .with_sheet_name(self.sheet_name.clone())
        .with_schema_policy(self.schema_policy))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRegistry {
    pub pipelines: Vec<PipelineDefinition>,
}

impl PipelineRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing pipeline registry")?;
        let mut ids = std::collections::HashSet::new();
        for pipeline in &registry.pipelines {
            if !ids.insert(pipeline.pipeline_id.as_str()) {
                bail!("duplicate pipeline_id `{}` in registry", pipeline.pipeline_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, pipeline_id: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.pipeline_id == pipeline_id)
    }

    /// Definitions to run: the named one (even if disabled), or every enabled one.
    pub fn select(&self, only: Option<&str>) -> Result<Vec<&PipelineDefinition>> {
        match only {
            Some(id) => self
                .get(id)
                .map(|p| vec![p])
                .ok_or_else(|| anyhow!("pipeline `{id}` is not in the registry")),
            None => Ok(self.pipelines.iter().filter(|p| p.enabled).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub outcomes: Vec<RunOutcome>,
    pub skipped: Vec<String>,
}

impl RegistrySummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &RunOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Runs the selected pipelines one after another. Configuration problems
/// abort before any pipeline starts; stage failures are collected.
pub async fn run_registry(
    engine: &PipelineEngine,
    settings: &EngineSettings,
    registry: &PipelineRegistry,
    only: Option<&str>,
) -> Result<RegistrySummary> {
    let selected = registry.select(only)?;
    let configs = selected
        .iter()
        .map(|definition| definition.to_config(settings))
        .collect::<Result<Vec<_>>>()?;
    let skipped = registry
        .pipelines
        .iter()
        .filter(|p| !selected.iter().any(|s| s.pipeline_id == p.pipeline_id))
        .map(|p| p.pipeline_id.clone())
        .collect::<Vec<_>>();

    let mut outcomes = Vec::with_capacity(configs.len());
    for config in &configs {
        outcomes.push(engine.run(config).await);
    }

    let failed = outcomes.iter().filter(|o| !o.success).count();
    info!(ran = outcomes.len(), failed, skipped = skipped.len(), "registry run finished");
    Ok(RegistrySummary { outcomes, skipped })
}

pub async fn run_registry_from_env(only: Option<&str>) -> Result<RegistrySummary> {
    let settings = EngineSettings::from_env();
    let registry = PipelineRegistry::load(&settings.registry_path).await?;
    let engine = settings.build_engine()?;
    run_registry(&engine, &settings, &registry, only).await
}
