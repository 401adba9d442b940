//! Pipeline controller
//!
//! RATE LIMIT → (NORMALIZE) → SECURITY → KNOWLEDGE → PLAN → EXECUTE → SYNTHESIZE → SCORE
//!
//! `process` never fails: stage failures degrade locally and anything
//! unexpected becomes one generic apology.

use crate::audit::{prompt_digest, PostgresUsageSink, TracingUsageSink, UsageEntryBuilder, UsageLogger, UsageSink};
use crate::confidence::{ConfidenceScorer, ScoringContext};
use crate::config::PipelineConfig;
use crate::error::OrchestrationError;
use crate::execution::{ExecutionEngine, ExecutionReport};
use crate::gateway::mock::demo_model;
use crate::gateway::{GeminiTransport, LanguageModel, ModelGateway};
use crate::knowledge::{plain_context, EnhancedContext, KnowledgeEnhancer, StaticKnowledgeEnhancer};
use crate::models::{
    ExecutionStatus, InputFormat, NormalizedInput, PipelineOutcome, PipelineResult, ProcessingTrace, Request,
    SecurityBlock, SecurityVerdict, UsageStatus,
};
use crate::normalizer::{detect_format, BlobFetcher, HttpBlobFetcher, InputNormalizer, NormalizeOptions, MAX_FETCH_BYTES};
use crate::planner::{fallback_plan, ModelToolPlanner, PlanContext, ToolPlanner};
use crate::rate_limit::{Clock, RateLimitConfig, RateLimiter, SystemClock};
use crate::security::{is_input_safe, ScreenOptions, SecurityConfig, SecurityScreen};
use crate::synthesis::ResponseSynthesizer;
use crate::tools::{create_default_registry, HttpRecordStore, InMemoryRecordStore, RecordStore};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const RATE_LIMITED_TEXT: &str =
    "You're sending messages faster than I can keep up with. Please wait a minute and try again.";

pub const SECURITY_BLOCKED_TEXT: &str =
    "I can't help with that request. If you need help with your wallets, transactions or budgets, just ask.";

pub const UNREADABLE_INPUT_TEXT: &str =
    "I couldn't read that file. Please send a clear image (PNG, JPEG, GIF or WEBP), a PDF, or type your question.";

pub const GENERIC_APOLOGY_TEXT: &str =
    "Sorry, something went wrong while handling your message. Please try again.";

/// Provider tag on pipeline-level usage entries
const PIPELINE_PROVIDER: &str = "pipeline";

/// Stage names recorded in the processing trace
pub mod stage {
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const NORMALIZE: &str = "normalize";
    pub const SECURITY: &str = "security";
    pub const KNOWLEDGE: &str = "knowledge";
    pub const PLANNING: &str = "planning";
    pub const EXECUTION: &str = "execution";
    pub const SYNTHESIS: &str = "synthesis";
    pub const CONFIDENCE: &str = "confidence";
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub rate_limit: RateLimitConfig,
    pub security: SecurityConfig,
    /// Model name recorded on pipeline usage entries
    pub model_name: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig::default(),
            model_name: crate::gateway::gemini::DEFAULT_MODEL.to_string(),
        }
    }
}

/// Everything the pipeline talks to besides the model
pub struct Collaborators {
    pub planner: Arc<dyn ToolPlanner>,
    pub knowledge: Arc<dyn KnowledgeEnhancer>,
    pub record_store: Arc<dyn RecordStore>,
    pub blob_fetcher: Arc<dyn BlobFetcher>,
    pub usage: UsageLogger,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Model planner, static knowledge, in-memory records, HTTP blob fetcher
    pub fn standard(model: Arc<dyn LanguageModel>, usage: UsageLogger) -> Result<Self> {
        Ok(Self {
            planner: Arc::new(ModelToolPlanner::new(model)),
            knowledge: Arc::new(StaticKnowledgeEnhancer::default()),
            record_store: Arc::new(InMemoryRecordStore::new()),
            blob_fetcher: Arc::new(HttpBlobFetcher::new(MAX_FETCH_BYTES)?),
            usage,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_record_store(mut self, record_store: Arc<dyn RecordStore>) -> Self {
        self.record_store = record_store;
        self
    }
}

/// Per-request bookkeeping shared by every exit path
struct RunState {
    started: Instant,
    stages: Vec<String>,
    tools_used: Vec<String>,
    knowledge_snippets: usize,
    security: SecurityBlock,
    logged_prompt: String,
}

impl RunState {
    fn new(request: &Request) -> Self {
        let logged_prompt = match &request.input {
            crate::models::RequestInput::Text(text) => text.clone(),
            _ => format!("[{:?} input]", detect_format(&request.input)),
        };

        Self {
            started: Instant::now(),
            stages: Vec::new(),
            tools_used: Vec::new(),
            knowledge_snippets: 0,
            security: SecurityBlock::unchecked(),
            logged_prompt,
        }
    }

    fn enter(&mut self, stage: &str) {
        debug!(stage, "Pipeline stage");
        self.stages.push(stage.to_string());
    }

    fn trace(&self) -> ProcessingTrace {
        ProcessingTrace {
            stages: self.stages.clone(),
            tools_used: self.tools_used.clone(),
            knowledge_snippets: self.knowledge_snippets,
            total_latency_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Completed answer before it is wrapped into a `PipelineResult`
struct Answer {
    outcome: PipelineOutcome,
    text: String,
    confidence: Option<crate::models::ConfidenceScore>,
    content_type: Option<crate::models::ContentType>,
}

impl Answer {
    fn plain(outcome: PipelineOutcome, text: &str) -> Self {
        Self {
            outcome,
            text: text.to_string(),
            confidence: None,
            content_type: None,
        }
    }
}

/// Main orchestrator that sequences the pipeline stages
pub struct Orchestrator {
    rate_limiter: RateLimiter,
    security_screen: SecurityScreen,
    normalizer: InputNormalizer,
    knowledge: Arc<dyn KnowledgeEnhancer>,
    planner: Arc<dyn ToolPlanner>,
    execution_engine: ExecutionEngine,
    synthesizer: ResponseSynthesizer,
    scorer: ConfidenceScorer,
    usage: UsageLogger,
    model_name: String,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let Collaborators {
            planner,
            knowledge,
            record_store,
            blob_fetcher,
            usage,
            clock,
        } = collaborators;

        Self {
            rate_limiter: RateLimiter::new(settings.rate_limit, clock),
            security_screen: SecurityScreen::new(model.clone(), settings.security),
            normalizer: InputNormalizer::new(model.clone(), blob_fetcher),
            knowledge,
            planner,
            execution_engine: ExecutionEngine::new(create_default_registry(record_store)),
            synthesizer: ResponseSynthesizer::new(model.clone()),
            scorer: ConfidenceScorer::new(model),
            usage,
            model_name: settings.model_name,
        }
    }

    /// Run one request through the pipeline
    pub async fn process(&self, request: Request) -> PipelineResult {
        let mut state = RunState::new(&request);

        info!(
            request_id = %request.request_id,
            caller_id = %request.caller_id,
            "Pipeline: request received"
        );

        let answer = match self.run(&request, &mut state).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(
                    request_id = %request.request_id,
                    caller_id = %request.caller_id,
                    stages = ?state.stages,
                    error = %e,
                    "Pipeline failed unexpectedly"
                );
                Answer::plain(PipelineOutcome::Failed, GENERIC_APOLOGY_TEXT)
            }
        };

        let trace = state.trace();
        self.log_run(&request, &state, &answer, &trace).await;

        info!(
            request_id = %request.request_id,
            outcome = ?answer.outcome,
            latency_ms = trace.total_latency_ms,
            "Pipeline: request complete"
        );

        PipelineResult {
            request_id: request.request_id,
            outcome: answer.outcome,
            answer: answer.text,
            confidence: answer.confidence,
            security: state.security,
            content_type: answer.content_type,
            trace,
        }
    }

    async fn run(&self, request: &Request, state: &mut RunState) -> Result<Answer> {
        let call_context = request.call_context();

        // === RATE LIMIT ===
        state.enter(stage::RATE_LIMIT);
        if !self.rate_limiter.admit(&request.caller_id).await {
            return Ok(Answer::plain(PipelineOutcome::RateLimited, RATE_LIMITED_TEXT));
        }

        // === NORMALIZE === (non-text input has no text to screen until transcribed)
        let format = detect_format(&request.input);
        let normalized = if format == InputFormat::Text {
            None
        } else {
            state.enter(stage::NORMALIZE);
            let options = NormalizeOptions {
                extract_structured: request.options.extract_structured,
                call_context: call_context.clone(),
            };
            match self.normalizer.normalize(&request.input, &options).await {
                Ok(normalized) => Some(normalized),
                Err(OrchestrationError::ParseError(reason)) => {
                    warn!(caller_id = %request.caller_id, reason = %reason, "Input could not be normalized");
                    return Ok(Answer::plain(PipelineOutcome::Failed, UNREADABLE_INPUT_TEXT));
                }
                Err(e) => return Err(e),
            }
        };

        let raw_text = match (&normalized, &request.input) {
            (Some(normalized), _) => normalized.text.clone(),
            (None, crate::models::RequestInput::Text(text)) => text.clone(),
            (None, _) => {
                return Err(OrchestrationError::Unexpected(
                    "non-text input skipped normalization".to_string(),
                ))
            }
        };

        // === SECURITY ===
        state.enter(stage::SECURITY);
        let verdict = self
            .security_screen
            .screen(
                &raw_text,
                &ScreenOptions {
                    use_ai_analysis: true,
                    context: request.history.last().map(|turn| turn.content.clone()),
                    security_level: request.options.security_level,
                    call_context: call_context.clone(),
                },
            )
            .await;

        let passable = is_input_safe(&verdict);
        state.security = SecurityBlock::from_verdict(&verdict, !passable);
        if let Some(sanitized) = &verdict.sanitized_input {
            state.logged_prompt = sanitized.clone();
        }

        if !passable {
            warn!(
                caller_id = %request.caller_id,
                threat_level = %verdict.threat_level,
                patterns = ?verdict.detected_patterns,
                "Request blocked by security screen"
            );
            return Ok(Answer::plain(PipelineOutcome::SecurityBlocked, SECURITY_BLOCKED_TEXT));
        }

        let query = screened_query(&raw_text, &verdict);

        // === KNOWLEDGE ===
        let context = if request.options.enable_knowledge {
            state.enter(stage::KNOWLEDGE);
            self.enhance(&query, request).await
        } else {
            plain_context(&query, &request.user_state, &request.history)
        };
        state.knowledge_snippets = context.relevant_snippets.len();

        // === PLAN ===
        state.enter(stage::PLANNING);
        let plan_context = PlanContext {
            user_state: request.user_state.clone(),
            max_tools: request.options.max_tools,
            call_context: call_context.clone(),
        };
        let selection = match self.planner.plan(&query, &plan_context).await {
            Ok(selection) => selection,
            Err(e) => {
                warn!(caller_id = %request.caller_id, error = %e, "Planner failed, using fallback plan");
                fallback_plan(&query, &plan_context)
            }
        };

        debug!(
            tools = selection.selected_tools.len(),
            confidence = selection.confidence,
            reasoning = %selection.reasoning,
            "Plan selected"
        );

        // === EXECUTE ===
        let report = if selection.is_empty() {
            ExecutionReport::default()
        } else {
            state.enter(stage::EXECUTION);
            self.execution_engine.execute(&selection, &request.caller_id).await
        };
        state.tools_used = report.tools_used();

        // === SYNTHESIZE ===
        state.enter(stage::SYNTHESIS);
        let structured = normalized.as_ref().and_then(|n| n.structured.as_ref());
        let text = if let Some(clarification) = clarification_answer(&report) {
            clarification
        } else if report.outcomes.is_empty() {
            let prompt = with_structured_note(&context, normalized.as_ref());
            self.synthesizer
                .synthesize_general(&prompt, &query, &request.user_state, &call_context)
                .await
        } else {
            self.synthesizer
                .synthesize_with_tools(&context.enhanced_prompt, &report.outcomes, structured, &call_context)
                .await
        };

        // === SCORE ===
        let confidence = if request.options.include_confidence {
            state.enter(stage::CONFIDENCE);
            let scoring = ScoringContext {
                query: query.clone(),
                answer: text.clone(),
                tools_used: state.tools_used.clone(),
                data_retrieved: retrieved_data(&report),
                execution_time_ms: report.total_time_ms,
                had_errors: report.had_errors(),
            };
            Some(self.scorer.score(&scoring, &call_context).await)
        } else {
            None
        };

        Ok(Answer {
            outcome: PipelineOutcome::Answered,
            text,
            confidence,
            content_type: normalized.map(|n| n.content_type),
        })
    }

    async fn enhance(&self, query: &str, request: &Request) -> EnhancedContext {
        match self
            .knowledge
            .enhance(query, &request.user_state, &request.history)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(caller_id = %request.caller_id, error = %e, "Knowledge enhancement failed, continuing without snippets");
                plain_context(query, &request.user_state, &request.history)
            }
        }
    }

    async fn log_run(&self, request: &Request, state: &RunState, answer: &Answer, trace: &ProcessingTrace) {
        let status = match answer.outcome {
            PipelineOutcome::Answered | PipelineOutcome::SecurityBlocked => UsageStatus::Success,
            PipelineOutcome::RateLimited => UsageStatus::RateLimited,
            PipelineOutcome::Failed => UsageStatus::Error,
        };

        let entry = UsageEntryBuilder::new(
            request.caller_id.clone(),
            PIPELINE_PROVIDER,
            self.model_name.clone(),
            state.logged_prompt.clone(),
            status,
        )
        .response(answer.text.clone())
        .latency_ms(trace.total_latency_ms)
        .correlation_id(Some(request.correlation_id()))
        .metadata("stage_trace", json!(trace.stages))
        .metadata("outcome", json!(answer.outcome))
        .metadata("tools_used", json!(trace.tools_used))
        .metadata("threat_level", json!(state.security.threat_level))
        .metadata("prompt_sha256", Value::String(prompt_digest(&state.logged_prompt)))
        .build();

        self.usage.log(entry).await;
    }
}

/// Sanitized text for passable-but-unsafe verdicts, the raw text otherwise
fn screened_query(raw_text: &str, verdict: &SecurityVerdict) -> String {
    match &verdict.sanitized_input {
        Some(sanitized) if !sanitized.trim().is_empty() => sanitized.clone(),
        _ => raw_text.to_string(),
    }
}

/// When nothing ran except steps waiting on the user, ask directly
fn clarification_answer(report: &ExecutionReport) -> Option<String> {
    let clarifications = report.clarifications();
    let any_success = report
        .outcomes
        .iter()
        .any(|outcome| outcome.status == ExecutionStatus::Success);

    if clarifications.is_empty() || any_success {
        return None;
    }
    Some(clarifications.join("\n"))
}

fn retrieved_data(report: &ExecutionReport) -> Vec<Value> {
    report
        .outcomes
        .iter()
        .filter(|outcome| outcome.status == ExecutionStatus::Success)
        .filter_map(|outcome| outcome.result.data.clone())
        .collect()
}

fn with_structured_note(context: &EnhancedContext, normalized: Option<&NormalizedInput>) -> String {
    match normalized.and_then(|n| n.structured.as_ref().map(|s| (n.content_type, s))) {
        Some((content_type, structured)) => format!(
            "{}\n\nData extracted from the user's {}:\n{}",
            context.enhanced_prompt,
            content_type,
            serde_json::to_string_pretty(structured).unwrap_or_default()
        ),
        None => context.enhanced_prompt.clone(),
    }
}

/// Wire the production collaborators described by the configuration.
/// Without a Gemini key the pipeline runs against canned demo replies.
pub fn build_orchestrator(config: &PipelineConfig) -> Result<Orchestrator> {
    let sink: Arc<dyn UsageSink> = match &config.database_url {
        Some(url) => Arc::new(PostgresUsageSink::connect_lazy(url)?),
        None => Arc::new(TracingUsageSink),
    };
    let usage = UsageLogger::new(sink);

    let (model, model_name): (Arc<dyn LanguageModel>, String) = match &config.gemini_api_key {
        Some(api_key) => {
            let transport = GeminiTransport::new(
                api_key.clone(),
                config.gemini_model.clone(),
                config.gemini_base_url.clone(),
            )?;
            let gateway = ModelGateway::new(Arc::new(transport), config.retry_policy(), usage.clone());
            (Arc::new(gateway), config.gemini_model.clone())
        }
        None => {
            warn!("GEMINI_API_KEY not set, using scripted demo replies");
            (Arc::new(demo_model()), "scripted-demo".to_string())
        }
    };

    let record_store: Arc<dyn RecordStore> = match &config.financial_api_base_url {
        Some(base_url) => Arc::new(HttpRecordStore::new(base_url)?),
        None => Arc::new(InMemoryRecordStore::new()),
    };

    let collaborators = Collaborators::standard(model.clone(), usage)?.with_record_store(record_store);
    let settings = PipelineSettings {
        rate_limit: config.rate_limit(),
        security: config.security(),
        model_name,
    };

    info!(model = %settings.model_name, "Orchestrator initialized");
    Ok(Orchestrator::new(model, collaborators, settings))
}
