//! Phase bodies. Each reads the run context and the state left by earlier
//! phases, and returns its artifacts or why it did not run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::context::RunContext;
use super::{Phase, PipelineError};
use crate::config::{EventConfig, TicketConfig};
use crate::embedding::SentenceEmbedder;
use crate::events::catalog::CatalogError;
use crate::events::predictor::fit_width;
use crate::events::{
    build_dataset, load_captures, summarize, write_predictions, write_summary, Capture, ErrorSummary, EventDataset,
    EventPrediction, EventPredictor, FormatCatalog, SequenceKind, SequenceModel,
};
use crate::forecast::artifacts::artifact_file_name;
use crate::forecast::{run_arma_job, ArmaJob, ForecastArtifact, ForecastError};
use crate::lstm::{run_lstm_job, LstmJob};
use crate::plot::{Chart, Series};
use crate::pool::{Job, JobResult};
use crate::report::ReportData;
use crate::telemetry::{self, DecoderError, FieldValue, Object, ObjectStore};
use crate::tickets::{
    analyze_tickets, search_query, Credentials, JiraClient, KnownCauseResolver, KnownCauseSource, KnownCauses,
    MiningOutcome, MiningStatus, NoiseSet, TicketAnalysis, TicketMiner, TicketRecord, TicketSource, WikiClient,
};

pub const EVENT_SUMMARY_FILE: &str = "event_summary.txt";
pub const PREDICTED_EVENTS_FILE: &str = "predicted_events.txt";

/// Everything the phases hand to each other during one run.
#[derive(Default)]
pub(super) struct RunState {
    decoded: Option<ObjectStore>,
    pub ini_path: Option<PathBuf>,
    pub store: Option<Arc<ObjectStore>>,
    pub graphs: Vec<PathBuf>,
    pub arma: Vec<ForecastArtifact>,
    pub lstm: Vec<ForecastArtifact>,
    captures: Vec<Capture>,
    pub event_summary: Option<ErrorSummary>,
    pub event_prediction: Option<EventPrediction>,
    pub tickets: Option<TicketAnalysis>,
}

#[derive(Debug, Default)]
pub(super) struct PhaseOutput {
    pub artifacts: Vec<PathBuf>,
    /// Per-job failures that did not stop the phase
    pub exceptions: Vec<String>,
    pub detail: Option<String>,
    /// Ran on cached data because a live source failed
    pub cache_fallback: bool,
}

#[derive(Debug)]
pub(super) enum PhaseError {
    /// Inputs absent; dependents downgrade
    Skip(String),
    Failed(String),
    Fatal(PipelineError),
}

type PhaseResult = Result<PhaseOutput, PhaseError>;

fn fatal(phase: Phase, input: &Path, source: impl std::error::Error + Send + Sync + 'static) -> PhaseError {
    PhaseError::Fatal(PipelineError::Fatal { phase, input: input.display().to_string(), source: Box::new(source) })
}

fn failed(e: impl std::fmt::Display) -> PhaseError {
    PhaseError::Failed(e.to_string())
}

/// Split pool results into values and `job: error` lines.
fn collect_jobs<R>(results: Vec<JobResult<R>>) -> (Vec<R>, Vec<String>) {
    let mut ok = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result.outcome {
            Ok(value) => ok.push(value),
            Err(e) => {
                warn!(job = %result.name, error = %e, "Job failed");
                errors.push(format!("{}: {}", result.name, e));
            }
        }
    }
    (ok, errors)
}

fn selected_objects<'a>(ctx: &RunContext, store: &'a ObjectStore) -> Vec<&'a Object> {
    store.select(&ctx.config.decoder.objects_of_interest)
}

fn require_store(state: &RunState) -> Result<Arc<ObjectStore>, PhaseError> {
    state
        .store
        .clone()
        .ok_or_else(|| PhaseError::Skip("no object store".to_string()))
}

// ============================================================================
// PHASE 1-2: Decode and publish the object store
// ============================================================================

pub(super) async fn decode(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    let (Some(binary_dir), Some(format_dir)) = (ctx.inputs.binary_dir.clone(), ctx.inputs.format_dir.clone()) else {
        return Err(PhaseError::Skip("no payload directory or layout catalog".to_string()));
    };
    let ini_path = ctx.output_path(&ctx.config.decoder.ini_name);

    let target = ini_path.clone();
    let input = binary_dir.clone();
    let decoded = tokio::task::spawn_blocking(move || telemetry::decode(&input, &format_dir, &target))
        .await
        .map_err(failed)?;

    match decoded {
        Ok(store) => {
            let detail = format!("{} objects", store.len());
            state.decoded = Some(store);
            state.ini_path = Some(ini_path.clone());
            Ok(PhaseOutput { artifacts: vec![ini_path], detail: Some(detail), ..PhaseOutput::default() })
        }
        Err(e @ (DecoderError::NoDecoder { .. } | DecoderError::BadHeader { .. } | DecoderError::NoPayloads(_))) => {
            Err(fatal(Phase::Decode, &binary_dir, e))
        }
        Err(e) => Err(failed(e)),
    }
}

pub(super) fn object_store(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    let store = match (state.decoded.take(), &ctx.inputs.ini_path) {
        (Some(store), _) => store,
        (None, Some(path)) => {
            let store = telemetry::load(path).map_err(failed)?;
            state.ini_path = Some(path.clone());
            store
        }
        (None, None) => return Err(PhaseError::Skip("nothing decoded and no INI input".to_string())),
    };

    let selected = selected_objects(ctx, &store).len();
    info!(objects = store.len(), selected, "Object store ready");
    let detail = format!("{} objects, {} selected", store.len(), selected);
    state.store = Some(Arc::new(store));
    Ok(PhaseOutput { detail: Some(detail), ..PhaseOutput::default() })
}

// ============================================================================
// PHASE 3: Per-object graphs
// ============================================================================

struct GraphJob {
    object: Object,
    out_dir: PathBuf,
}

fn plot_object(job: GraphJob) -> Result<PathBuf, std::io::Error> {
    let GraphJob { object, out_dir } = job;
    let mut chart = Chart::new(format!("{} ({})", object.name, object.uid), "capture", "value");
    for (field, values) in object.numeric_fields() {
        chart.push(Series::indexed(field, 0, values));
    }
    let path = out_dir.join(artifact_file_name(&object.uid, &object.name, chrono::Utc::now()));
    chart.write_pdf(&path)?;
    Ok(path)
}

pub(super) async fn graph(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    let store = require_store(state)?;
    let out_dir = ctx.subdir("graphs").map_err(PhaseError::Fatal)?;
    let jobs: Vec<Job<GraphJob>> = selected_objects(ctx, &store)
        .into_iter()
        .filter(|o| o.numeric_fields().next().is_some())
        .map(|o| Job::new(format!("graph:{}", o.uid), GraphJob { object: o.clone(), out_dir: out_dir.clone() }))
        .collect();
    if jobs.is_empty() {
        return Err(PhaseError::Skip("no numeric fields in the selected objects".to_string()));
    }

    let (paths, exceptions) = collect_jobs(ctx.pool.map_ordered(plot_object, jobs).await);
    state.graphs.clone_from(&paths);
    let detail = format!("{} plots", paths.len());
    Ok(PhaseOutput { artifacts: paths, exceptions, detail: Some(detail), ..PhaseOutput::default() })
}

// ============================================================================
// PHASE 4-5: Forecasts
// ============================================================================

pub(super) async fn arma(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    let store = require_store(state)?;
    let out_dir = ctx.subdir("arma").map_err(PhaseError::Fatal)?;
    let mut jobs = Vec::new();
    for object in selected_objects(ctx, &store) {
        for (field, series) in object.numeric_fields() {
            jobs.push(Job::new(
                format!("arma:{}/{}", object.uid, field),
                ArmaJob {
                    object: object.uid.clone(),
                    field: field.to_string(),
                    series: series.to_vec(),
                    config: ctx.config.arma.clone(),
                    out_dir: out_dir.clone(),
                },
            ));
        }
    }
    if jobs.is_empty() {
        return Err(PhaseError::Skip("no numeric fields in the selected objects".to_string()));
    }

    info!(jobs = jobs.len(), backend = %ctx.pool.backend(), "Dispatching ARMA jobs");
    let (artifacts, exceptions) = collect_jobs(ctx.pool.map_ordered(run_arma_job, jobs).await);
    let paths = artifacts.iter().filter_map(|a| a.path.clone()).collect();
    let detail = format!("{} forecasts, {} failed", artifacts.len(), exceptions.len());
    state.arma = artifacts;
    Ok(PhaseOutput { artifacts: paths, exceptions, detail: Some(detail), ..PhaseOutput::default() })
}

pub(super) async fn lstm(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    let store = require_store(state)?;
    let out_dir = ctx.subdir("lstm").map_err(PhaseError::Fatal)?;
    let mut jobs = Vec::new();
    for object in selected_objects(ctx, &store) {
        let fields: Vec<(String, FieldValue)> = object
            .fields
            .iter()
            .filter(|(_, v)| matches!(v, FieldValue::Numeric(_) | FieldValue::Categorical(_)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if fields.is_empty() {
            continue;
        }
        jobs.push(Job::new(
            format!("lstm:{}", object.uid),
            LstmJob {
                object: object.uid.clone(),
                fields,
                config: ctx.config.lstm.clone(),
                seed: ctx.seed(),
                out_dir: out_dir.clone(),
                cancel: ctx.cancel.clone(),
            },
        ));
    }
    if jobs.is_empty() {
        return Err(PhaseError::Skip("no sequence fields in the selected objects".to_string()));
    }

    info!(jobs = jobs.len(), backend = %ctx.pool.backend(), "Dispatching LSTM jobs");
    let (per_object, exceptions) = collect_jobs(ctx.pool.map_ordered(run_lstm_job, jobs).await);
    let paths: Vec<PathBuf> = per_object
        .iter()
        .filter_map(|artifacts| artifacts.first().and_then(|a| a.path.clone()))
        .collect();
    let detail = format!("{} objects forecast, {} skipped", paths.len(), exceptions.len());
    state.lstm = per_object.into_iter().flatten().collect();
    Ok(PhaseOutput { artifacts: paths, exceptions, detail: Some(detail), ..PhaseOutput::default() })
}

// ============================================================================
// PHASE 6-7: Event log
// ============================================================================

pub(super) fn event_summarize(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    let dir = ctx
        .inputs
        .nlog_dir
        .as_ref()
        .ok_or_else(|| PhaseError::Skip("no nlog directory".to_string()))?;
    let captures = load_captures(dir, ctx.config.events.header_lines).map_err(failed)?;
    if captures.is_empty() {
        return Err(PhaseError::Skip(format!("no dated captures in {}", dir.display())));
    }

    let summary = summarize(&captures);
    let path = ctx.output_path(EVENT_SUMMARY_FILE);
    write_summary(&summary, &path).map_err(failed)?;
    info!(
        captures = summary.captures,
        errors = summary.errors.len(),
        duration_s = summary.duration.seconds,
        "Event summary written"
    );
    let detail = format!("{} captures, {} ERR events", summary.captures, summary.errors.len());
    state.captures = captures;
    state.event_summary = Some(summary);
    Ok(PhaseOutput { artifacts: vec![path], detail: Some(detail), ..PhaseOutput::default() })
}

struct SequenceJob {
    kind: SequenceKind,
    dataset: Arc<EventDataset>,
    config: EventConfig,
    seed: u64,
    cancel: tokio_util::sync::CancellationToken,
}

fn train_sequence(job: SequenceJob) -> Result<SequenceModel, ForecastError> {
    SequenceModel::train(job.kind, &job.dataset, &job.config, job.seed, Some(&job.cancel))
}

pub(super) async fn event_predict(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    if state.captures.is_empty() {
        return Err(PhaseError::Skip("no captures loaded".to_string()));
    }
    let catalog_path = ctx
        .inputs
        .event_catalog
        .as_ref()
        .ok_or_else(|| PhaseError::Skip("no event format catalog".to_string()))?;

    let config = &ctx.config.events;
    let catalog = match FormatCatalog::load(catalog_path, ctx.embedder.as_ref(), config.signature_dim, ctx.seed()) {
        Ok(c) => c,
        Err(e @ CatalogError::Io { .. }) => return Err(PhaseError::Skip(e.to_string())),
        Err(e) => return Err(fatal(Phase::EventPredict, catalog_path, e)),
    };

    let dataset = Arc::new(build_dataset(&catalog, &state.captures, config).map_err(failed)?);
    let jobs = SequenceKind::ALL
        .iter()
        .map(|&kind| {
            Job::new(
                format!("event-model:{}", kind),
                SequenceJob {
                    kind,
                    dataset: Arc::clone(&dataset),
                    config: config.clone(),
                    seed: ctx.seed(),
                    cancel: ctx.cancel.clone(),
                },
            )
        })
        .collect();
    let (models, errors) = collect_jobs(ctx.pool.map_ordered(train_sequence, jobs).await);
    if !errors.is_empty() {
        return Err(PhaseError::Failed(errors.join("; ")));
    }

    let predictor = EventPredictor::from_parts(fit_width(&dataset, config), models, config).map_err(failed)?;
    let prediction = predictor.predict_next(&catalog, &state.captures).map_err(failed)?;
    let path = ctx.output_path(PREDICTED_EVENTS_FILE);
    write_predictions(&prediction, &path).map_err(failed)?;
    info!(
        pairs = dataset.pairs.len(),
        predicted = prediction.predicted_count,
        rendered = prediction.lines.len(),
        "Next capture predicted"
    );
    let detail = format!("{} events predicted", prediction.lines.len());
    state.event_prediction = Some(prediction);
    Ok(PhaseOutput { artifacts: vec![path], detail: Some(detail), ..PhaseOutput::default() })
}

// ============================================================================
// PHASE 8: Tickets
// ============================================================================

fn ticket_source(ctx: &RunContext, timeout: Duration, exceptions: &mut Vec<String>) -> Option<Arc<dyn TicketSource>> {
    let base_url = ctx.config.tickets.base_url.as_deref()?;
    let (Some(path), Some(passphrase)) = (&ctx.inputs.credentials, &ctx.inputs.passphrase) else {
        info!("No ticket-system credentials, mining from cache only");
        return None;
    };
    let credentials = match Credentials::open(path, passphrase) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            exceptions.push(format!("credentials: {}", e));
            return None;
        }
    };
    match JiraClient::new(base_url, timeout, Some(credentials)) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            exceptions.push(format!("ticket client: {}", e));
            None
        }
    }
}

fn wiki_source(config: &TicketConfig, timeout: Duration, exceptions: &mut Vec<String>) -> Option<Arc<dyn KnownCauseSource>> {
    let url = config.wiki_url.as_deref()?;
    match WikiClient::new(url, timeout) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            exceptions.push(format!("wiki client: {}", e));
            None
        }
    }
}

fn mined_placeholder(signature: &str, outcome: &MiningOutcome, detail: String) -> TicketAnalysis {
    let mut analysis = TicketAnalysis::placeholder(Some(signature.to_string()), outcome.status, detail);
    analysis.query = Some(outcome.query.clone());
    analysis.ticket_count = outcome.tickets.len();
    analysis
}

pub(super) async fn tickets(ctx: &RunContext, state: &mut RunState) -> PhaseResult {
    let signature = ctx
        .inputs
        .signature()
        .ok_or_else(|| PhaseError::Skip("no fault signature".to_string()))?;
    let config = &ctx.config.tickets;
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let mut exceptions = Vec::new();

    let noise = match &config.noise_path {
        Some(path) => NoiseSet::load(path).unwrap_or_else(|e| {
            exceptions.push(format!("noise list: {}", e));
            NoiseSet::default()
        }),
        None => NoiseSet::default(),
    };

    let source = ticket_source(ctx, timeout, &mut exceptions);
    let outcome = TicketMiner::new(source, &config.cache_path, config.page_size)
        .mine(&search_query(&signature))
        .await;
    info!(signature = %signature, status = %outcome.status, tickets = outcome.tickets.len(), "Ticket mining finished");
    if let Some(e) = &outcome.error {
        exceptions.push(format!("ticket search: {}", e));
    }

    let wiki = wiki_source(config, timeout, &mut exceptions);
    let causes = KnownCauseResolver::new(wiki, &config.known_cause_cache).resolve(&signature).await;

    let analysis = match causes {
        _ if outcome.tickets.is_empty() => {
            let detail = outcome.error.clone().unwrap_or_else(|| "no tickets found".to_string());
            mined_placeholder(&signature, &outcome, detail)
        }
        Err(e) => {
            exceptions.push(format!("known causes: {}", e));
            mined_placeholder(&signature, &outcome, e.to_string())
        }
        Ok(causes) => analyze(ctx, &signature, outcome, causes, noise, &mut exceptions).await?,
    };

    let artifacts = analysis.artifacts.clone();
    let detail = format!("{} ({} tickets)", analysis.status, analysis.ticket_count);
    let cache_fallback = analysis.status == MiningStatus::CacheFallback;
    if cache_fallback {
        warn!(signature = %signature, tickets = analysis.ticket_count, "Ticket search failed, using cached tickets");
    }
    state.tickets = Some(analysis);
    Ok(PhaseOutput { artifacts, exceptions, detail: Some(detail), cache_fallback })
}

async fn analyze(
    ctx: &RunContext,
    signature: &str,
    outcome: MiningOutcome,
    causes: KnownCauses,
    noise: NoiseSet,
    exceptions: &mut Vec<String>,
) -> Result<TicketAnalysis, PhaseError> {
    let out_dir = ctx.subdir("tickets").map_err(PhaseError::Fatal)?;
    let records: Vec<TicketRecord> = outcome.tickets.clone();
    let labels = causes.causes.clone();
    let embedder: Arc<dyn SentenceEmbedder> = Arc::clone(&ctx.embedder);
    let config = ctx.config.tickets.clone();
    let seed = ctx.seed();

    debug!(tickets = records.len(), causes = labels.len(), "Clustering mined tickets");
    let result = tokio::task::spawn_blocking(move || {
        analyze_tickets(&records, &labels, embedder.as_ref(), &noise, &config, seed, &out_dir)
    })
    .await
    .map_err(failed)?;

    Ok(match result {
        Ok((clusters, diagnostics, artifacts)) => TicketAnalysis {
            signature: Some(signature.to_string()),
            query: Some(outcome.query),
            status: outcome.status,
            status_detail: outcome.error,
            ticket_count: outcome.tickets.len(),
            known_causes: causes.causes,
            clusters: Some(clusters),
            diagnostics: Some(diagnostics),
            artifacts,
        },
        Err(e) => {
            exceptions.push(format!("ticket analysis: {}", e));
            let mut analysis = mined_placeholder(signature, &outcome, e.to_string());
            analysis.known_causes = causes.causes;
            analysis
        }
    })
}

// ============================================================================
// PHASE 9: Report
// ============================================================================

pub(super) fn report(ctx: &RunContext, state: &RunState, records: &[super::PhaseRecord]) -> PhaseResult {
    let mut data = ReportData::new(chrono::Utc::now());
    data.fault_signature = ctx.inputs.signature();
    data.decoded_store.clone_from(&state.ini_path);
    if let Some(store) = &state.store {
        data.add_objects(selected_objects(ctx, store));
    }
    data.graphs.clone_from(&state.graphs);
    data.forecasts.arma.clone_from(&state.arma);
    data.forecasts.lstm.clone_from(&state.lstm);
    data.events.summary.clone_from(&state.event_summary);
    data.events.prediction.clone_from(&state.event_prediction);
    data.tickets.clone_from(&state.tickets);
    data.artifact_links.clone_from(&ctx.inputs.artifact_links);
    data.phases = records.to_vec();

    let path = ctx.output_path(crate::report::REPORT_FILE);
    data.write(&path).map_err(failed)?;
    info!(path = %path.display(), artifacts = data.artifact_count(), "Report data written");
    Ok(PhaseOutput { artifacts: vec![path], ..PhaseOutput::default() })
}
