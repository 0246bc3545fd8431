//! The staged pipeline engine: one sequential run from link discovery to
//! table replacement, with cleanup on every exit path.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regcat_adapters::{discover, read_spreadsheet, DiscoveryError, IngestError, MatchPolicy};
use regcat_core::{apply_mapping, run_checked, ColumnMapping, MappingError, TransformError, TransformStrategy};
use regcat_storage::{
    AcquisitionError, ArtifactLedger, Fetch, MemberSelection, SchemaPolicy, SqliteTableStore,
    TableStoreError, WorkingDir,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Discovering,
    Acquiring,
    Ingesting,
    Mapping,
    Transforming,
    Persisting,
    CleaningUp,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Discovering => "discovering",
            PipelineState::Acquiring => "acquiring",
            PipelineState::Ingesting => "ingesting",
            PipelineState::Mapping => "mapping",
            PipelineState::Transforming => "transforming",
            PipelineState::Persisting => "persisting",
            PipelineState::CleaningUp => "cleaning_up",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage failure carried in a [`RunOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("acquisition failed: {0}")]
    Acquisition(String),
    #[error("ingestion failed: {0}")]
    Ingestion(String),
    #[error("mapping failed: {0}")]
    Mapping(String),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineState {
        match self {
            PipelineError::Discovery(_) => PipelineState::Discovering,
            PipelineError::Acquisition(_) => PipelineState::Acquiring,
            PipelineError::Ingestion(_) => PipelineState::Ingesting,
            PipelineError::Mapping(_) => PipelineState::Mapping,
            PipelineError::Transform(_) => PipelineState::Transforming,
            PipelineError::Persistence(_) => PipelineState::Persisting,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PipelineError::Discovery(r)
            | PipelineError::Acquisition(r)
            | PipelineError::Ingestion(r)
            | PipelineError::Mapping(r)
            | PipelineError::Transform(r)
            | PipelineError::Persistence(r) => r,
        }
    }
}

impl From<DiscoveryError> for PipelineError {
    fn from(err: DiscoveryError) -> Self {
        PipelineError::Discovery(err.to_string())
    }
}

impl From<AcquisitionError> for PipelineError {
    fn from(err: AcquisitionError) -> Self {
        PipelineError::Acquisition(err.to_string())
    }
}

impl From<IngestError> for PipelineError {
    fn from(err: IngestError) -> Self {
        PipelineError::Ingestion(err.to_string())
    }
}

impl From<MappingError> for PipelineError {
    fn from(err: MappingError) -> Self {
        PipelineError::Mapping(err.to_string())
    }
}

impl From<TransformError> for PipelineError {
    fn from(err: TransformError) -> Self {
        PipelineError::Transform(err.to_string())
    }
}

impl From<TableStoreError> for PipelineError {
    fn from(err: TableStoreError) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

/// Everything one run needs. Built once per invocation and only read by the engine.
#[derive(Clone)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub source_url: String,
    pub working_dir: PathBuf,
    pub mapping: ColumnMapping,
    pub table_name: String,
    pub store_target: String,
    pub transform: Arc<dyn TransformStrategy>,
    pub match_policy: MatchPolicy,
    pub member_selection: MemberSelection,
    pub sheet_name: Option<String>,
    pub schema_policy: SchemaPolicy,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("pipeline_id", &self.pipeline_id)
            .field("source_url", &self.source_url)
            .field("working_dir", &self.working_dir)
            .field("mapping", &self.mapping)
            .field("table_name", &self.table_name)
            .field("store_target", &self.store_target)
            .field("transform", &self.transform.name())
            .field("match_policy", &self.match_policy)
            .field("member_selection", &self.member_selection)
            .field("sheet_name", &self.sheet_name)
            .field("schema_policy", &self.schema_policy)
            .finish()
    }
}

impl PipelineConfig {
    pub fn new(
        pipeline_id: impl Into<String>,
        source_url: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        table_name: impl Into<String>,
        store_target: impl Into<String>,
        transform: Arc<dyn TransformStrategy>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            source_url: source_url.into(),
            working_dir: working_dir.into(),
            mapping: ColumnMapping::default(),
            table_name: table_name.into(),
            store_target: store_target.into(),
            transform,
            match_policy: MatchPolicy::default(),
            member_selection: MemberSelection::default(),
            sheet_name: None,
            schema_policy: SchemaPolicy::default(),
        }
    }

    pub fn with_mapping(mut self, mapping: ColumnMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    pub fn with_member_selection(mut self, selection: MemberSelection) -> Self {
        self.member_selection = selection;
        self
    }

    pub fn with_sheet_name(mut self, sheet_name: Option<String>) -> Self {
        self.sheet_name = sheet_name;
        self
    }

    pub fn with_schema_policy(mut self, policy: SchemaPolicy) -> Self {
        self.schema_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub success: bool,
    pub failure: Option<PipelineError>,
    pub rows_written: usize,
    pub selected_link: Option<String>,
    pub content_hash: Option<String>,
    pub trace: Vec<PipelineState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cleanup_warnings: Vec<String>,
}

impl RunOutcome {
    pub fn final_state(&self) -> PipelineState {
        self.trace.last().copied().unwrap_or(PipelineState::Idle)
    }

    /// `true` if the run entered `state` at some point.
    pub fn visited(&self, state: PipelineState) -> bool {
        self.trace.contains(&state)
    }
}

/// Per-run mutable bookkeeping; never outlives `PipelineEngine::run`.
struct RunContext {
    trace: Vec<PipelineState>,
    ledger: ArtifactLedger,
    selected_link: Option<String>,
    content_hash: Option<String>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            trace: vec![PipelineState::Idle],
            ledger: ArtifactLedger::new(),
            selected_link: None,
            content_hash: None,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        let from = self.trace.last().copied().unwrap_or(PipelineState::Idle);
        info!(from = %from, to = %state, "pipeline transition");
        self.trace.push(state);
    }
}

pub struct PipelineEngine {
    fetcher: Arc<dyn Fetch>,
}

impl PipelineEngine {
    pub fn new(fetcher: Arc<dyn Fetch>) -> Self {
        Self { fetcher }
    }

    /// Runs every stage in order. Never returns early without cleaning up;
    /// failures are reported in the outcome rather than as an `Err`.
    pub async fn run(&self, config: &PipelineConfig) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", pipeline = %config.pipeline_id, %run_id);
        self.run_with_id(config, run_id).instrument(span).await
    }

    async fn run_with_id(&self, config: &PipelineConfig, run_id: Uuid) -> RunOutcome {
        let started_at = Utc::now();
        let mut ctx = RunContext::new();

        let result = self.execute(config, &mut ctx).await;

        ctx.enter(PipelineState::CleaningUp);
        let report = ctx.ledger.cleanup().await;

        let (success, failure, rows_written) = match result {
            Ok(rows) => {
                ctx.enter(PipelineState::Succeeded);
                info!(rows, table = %config.table_name, "pipeline succeeded");
                (true, None, rows)
            }
            Err(err) => {
                ctx.enter(PipelineState::Failed);
                error!(stage = %err.stage(), error = %err, "pipeline failed");
                (false, Some(err), 0)
            }
        };
        if !report.warnings.is_empty() {
            warn!(warnings = report.warnings.len(), "cleanup left artifacts behind");
        }

        RunOutcome {
            run_id,
            pipeline_id: config.pipeline_id.clone(),
            success,
            failure,
            rows_written,
            selected_link: ctx.selected_link,
            content_hash: ctx.content_hash,
            trace: ctx.trace,
            started_at,
            finished_at: Utc::now(),
            cleanup_warnings: report.warnings,
        }
    }

    async fn execute(&self, config: &PipelineConfig, ctx: &mut RunContext) -> Result<usize, PipelineError> {
        ctx.enter(PipelineState::Discovering);
        let found = discover(self.fetcher.as_ref(), &config.source_url, &config.match_policy).await?;
        ctx.selected_link = Some(found.selected.url.clone());

        ctx.enter(PipelineState::Acquiring);
        let working_dir = WorkingDir::new(&config.working_dir, &config.pipeline_id);
        let artifact = working_dir
            .acquire(
                self.fetcher.as_ref(),
                &found.selected,
                &config.member_selection,
                &mut ctx.ledger,
            )
            .await?;
        ctx.content_hash = Some(artifact.content_hash.clone());

        ctx.enter(PipelineState::Ingesting);
        let dataset = read_spreadsheet(artifact.spreadsheet_path(), config.sheet_name.as_deref())?;

        ctx.enter(PipelineState::Mapping);
        let dataset = apply_mapping(dataset, &config.mapping)?;

        ctx.enter(PipelineState::Transforming);
        let dataset = run_checked(config.transform.as_ref(), dataset)?;

        ctx.enter(PipelineState::Persisting);
        let store = SqliteTableStore::connect(&config.store_target).await?;
        let outcome = store
            .persist(&config.table_name, &dataset, config.schema_policy)
            .await;
        store.close().await;

        if outcome.success {
            Ok(outcome.rows_written)
        } else {
            Err(PipelineError::Persistence(
                outcome.error.unwrap_or_else(|| "unknown persistence error".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_their_stage() {
        let err = PipelineError::from(TransformError::Validation("bad".into()));
        assert_eq!(err.stage(), PipelineState::Transforming);
        assert_eq!(err.reason(), "validation failed: bad");
        assert_eq!(err.to_string(), "transform failed: validation failed: bad");
    }

    #[test]
    fn states_render_in_snake_case() {
        assert_eq!(PipelineState::CleaningUp.to_string(), "cleaning_up");
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::Persisting.is_terminal());
    }
}
