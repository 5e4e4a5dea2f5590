use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use quorum_core::config::{AgentProfile, ProviderConfig};
use quorum_core::deadline::{DeadlineScope, ScopeError};
use quorum_core::events::{ProgressEvent, Utterance, UtteranceKind};
use quorum_core::ids::DeliberationId;
use quorum_core::provider::{ModelHandle, ModelProvisioner};
use quorum_core::request::DeliberationRequest;

use crate::error::DeliberationError;
use crate::memory::{fallback_key_points, DiscussionExcerpt, MemoryStore};
use crate::moderator::{Moderator, MODERATOR_ID, MODERATOR_NAME, MODERATOR_ROLE};
use crate::registry::ToolRegistry;
use crate::runner::{ExpertRunner, ProgressSink, RunInput};

/// Callback fired once per completed utterance.
pub type UtteranceSink = Arc<dyn Fn(Utterance) + Send + Sync>;

/// The nested deadline budgets: deliberation ⊃ moderator step ⊃ agent step
/// ⊃ model creation.
#[derive(Clone, Debug)]
pub struct DeliberationTimeouts {
    pub deliberation: Duration,
    pub moderator: Duration,
    pub agent: Duration,
    pub model_creation: Duration,
}

impl Default for DeliberationTimeouts {
    fn default() -> Self {
        Self {
            deliberation: Duration::from_secs(300),
            moderator: Duration::from_secs(60),
            agent: Duration::from_secs(90),
            model_creation: Duration::from_secs(10),
        }
    }
}

/// How a deliberation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    /// The deliberation-wide deadline expired; the transcript holds
    /// everything produced up to that point.
    TimedOut,
    /// Externally cancelled; the transcript holds everything produced up
    /// to that point.
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct DeliberationResult {
    pub id: DeliberationId,
    pub transcript: Vec<Utterance>,
    pub outcome: Outcome,
}

impl DeliberationResult {
    pub fn is_partial(&self) -> bool {
        self.outcome != Outcome::Complete
    }
}

struct ActiveEntry {
    generation: u64,
    cancel: CancellationToken,
}

/// The deliberation orchestrator. At most one live deliberation per topic;
/// starting a new one for a topic cancels the previous one first.
pub struct DeliberationService {
    provisioner: Arc<dyn ModelProvisioner>,
    registry: Arc<ToolRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    timeouts: DeliberationTimeouts,
    active: DashMap<String, ActiveEntry>,
    generations: AtomicU64,
}

impl DeliberationService {
    pub fn new(provisioner: Arc<dyn ModelProvisioner>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            provisioner,
            registry,
            memory: None,
            timeouts: DeliberationTimeouts::default(),
            active: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_timeouts(mut self, timeouts: DeliberationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Cancel the in-flight deliberation for a topic, if any. Idempotent;
    /// a no-op when nothing is in flight.
    pub fn cancel(&self, topic: &str) {
        if let Some((_, entry)) = self.active.remove(topic) {
            entry.cancel.cancel();
            info!(topic, "deliberation cancelled");
        }
    }

    fn begin(&self, topic: &str) -> (u64, CancellationToken) {
        self.cancel(topic);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.active.insert(
            topic.to_string(),
            ActiveEntry { generation, cancel: cancel.clone() },
        );
        (generation, cancel)
    }

    fn end(&self, topic: &str, generation: u64) {
        self.active
            .remove_if(topic, |_, entry| entry.generation == generation);
    }

    fn create_model(
        &self,
        scope: &DeadlineScope,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ModelHandle>, DeliberationError> {
        let creation_scope = scope.child(self.timeouts.model_creation);
        match creation_scope.check() {
            Err(ScopeError::Cancelled) => return Err(DeliberationError::Cancelled),
            Err(ScopeError::TimedOut) => {
                return Err(DeliberationError::ModelCreation(
                    quorum_core::errors::ProviderError::Network(
                        "model creation deadline exceeded".into(),
                    ),
                ))
            }
            Ok(()) => {}
        }
        Ok(self.provisioner.create_model(config)?)
    }

    /// The handle an agent speaks through: the shared deliberation model,
    /// unless the profile binds its own.
    fn agent_model(
        &self,
        profile: &AgentProfile,
        config: &ProviderConfig,
        base: &Arc<dyn ModelHandle>,
    ) -> Arc<dyn ModelHandle> {
        match profile.model_override.as_deref() {
            Some(model) if !model.is_empty() => {
                match self.provisioner.create_model(&config.with_model(model)) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(agent = %profile.id, error = %e, "model override failed, using shared model");
                        Arc::clone(base)
                    }
                }
            }
            _ => Arc::clone(base),
        }
    }

    /// Parallel panel mode: the caller addressed specific agents; each runs
    /// independently with no cross-agent context. Results arrive in the
    /// order agents actually finish.
    #[instrument(skip_all, fields(topic = %request.stock.symbol, agents = request.agents.len()))]
    pub async fn run_panel(
        &self,
        config: Option<&ProviderConfig>,
        request: DeliberationRequest,
    ) -> Result<DeliberationResult, DeliberationError> {
        let config = config.ok_or(DeliberationError::NoProviderConfig)?;
        if request.agents.is_empty() {
            return Err(DeliberationError::NoAgents);
        }

        let topic = request.stock.symbol.clone();
        let id = DeliberationId::new();
        let (generation, cancel) = self.begin(&topic);
        let scope = DeadlineScope::with_token(cancel, self.timeouts.deliberation);

        let result = self.run_panel_inner(&scope, &id, config, request).await;
        self.end(&topic, generation);
        result
    }

    async fn run_panel_inner(
        &self,
        scope: &DeadlineScope,
        id: &DeliberationId,
        config: &ProviderConfig,
        request: DeliberationRequest,
    ) -> Result<DeliberationResult, DeliberationError> {
        let model = self.create_model(scope, config)?;

        let mut tasks: JoinSet<(AgentProfile, Result<String, crate::error::EngineError>)> =
            JoinSet::new();

        for profile in &request.agents {
            let agent_scope = scope.child(self.timeouts.agent);
            let runner = ExpertRunner::new(
                self.agent_model(profile, config, &model),
                Arc::clone(&self.registry),
            );
            let profile = profile.clone();
            let input = RunInput {
                stock: request.stock.clone(),
                query: request.query.clone(),
                reply_content: request.reply_content.clone(),
                position: request.position.clone(),
                previous_discussion: String::new(),
            };
            tasks.spawn(async move {
                let result = runner.run(&agent_scope, &profile, &input, None).await;
                (profile, result)
            });
        }

        let mut transcript = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((profile, Ok(content))) => {
                    debug!(agent = %profile.id, len = content.len(), "agent done");
                    transcript.push(Utterance {
                        agent_id: profile.id,
                        agent_name: profile.name,
                        role: profile.role,
                        content,
                        round: 1,
                        kind: UtteranceKind::Opinion,
                    });
                }
                Ok((profile, Err(e))) if e.is_timeout() => {
                    warn!(agent = %profile.id, "agent step timed out");
                }
                Ok((profile, Err(e))) => {
                    error!(agent = %profile.id, error = %e, "agent step failed");
                }
                Err(join_err) => {
                    error!(error = %join_err, "agent task failed");
                }
            }
        }

        info!(id = %id, count = transcript.len(), "panel finished");
        Ok(DeliberationResult {
            id: id.clone(),
            transcript,
            outcome: outcome_of(scope),
        })
    }

    /// Moderated sequential mode: the moderator selects speakers; each
    /// speaker sees every prior speaker's remarks for this round.
    #[instrument(skip_all, fields(topic = %request.stock.symbol, roster = request.all_agents.len()))]
    pub async fn run_smart(
        &self,
        config: Option<&ProviderConfig>,
        request: DeliberationRequest,
        on_utterance: Option<UtteranceSink>,
        on_progress: Option<ProgressSink>,
    ) -> Result<DeliberationResult, DeliberationError> {
        let config = config.ok_or(DeliberationError::NoProviderConfig)?;
        if request.all_agents.is_empty() {
            return Err(DeliberationError::NoAgents);
        }

        let topic = request.stock.symbol.clone();
        let id = DeliberationId::new();
        let (generation, cancel) = self.begin(&topic);
        let scope = DeadlineScope::with_token(cancel, self.timeouts.deliberation);

        let result = self
            .run_smart_inner(&scope, &id, config, request, on_utterance, on_progress)
            .await;
        self.end(&topic, generation);
        result
    }

    async fn run_smart_inner(
        &self,
        scope: &DeadlineScope,
        id: &DeliberationId,
        config: &ProviderConfig,
        request: DeliberationRequest,
        on_utterance: Option<UtteranceSink>,
        on_progress: Option<ProgressSink>,
    ) -> Result<DeliberationResult, DeliberationError> {
        let model = self.create_model(scope, config)?;
        let moderator = Moderator::new(Arc::clone(&model));

        // Cancellation stops all further notification delivery.
        let progress = guard_progress(on_progress, scope);
        let utterances = guard_utterances(on_utterance, scope);

        let memory_context = match &self.memory {
            Some(memory) => scope
                .bound(memory.build_context(&request.stock.symbol, &request.query))
                .await
                .unwrap_or_default(),
            None => String::new(),
        };

        // Round 0: intent analysis and speaker selection.
        emit_progress(&progress, ProgressEvent::AgentStart {
            agent_id: MODERATOR_ID.into(),
            agent_name: MODERATOR_NAME.into(),
            detail: "analyzing the question".into(),
        });

        let moderator_scope = scope.child(self.timeouts.moderator);
        let decision = moderator
            .analyze(&moderator_scope, &request.stock, &request.query, &request.all_agents)
            .await;

        emit_progress(&progress, ProgressEvent::AgentDone {
            agent_id: MODERATOR_ID.into(),
            agent_name: MODERATOR_NAME.into(),
        });

        let decision = match decision {
            Ok(decision) => decision,
            Err(e) if e.is_timeout() => return Err(DeliberationError::ModeratorTimeout),
            Err(crate::error::EngineError::Cancelled) => return Err(DeliberationError::Cancelled),
            Err(e) => return Err(DeliberationError::Moderator(e.to_string())),
        };
        debug!(selected = ?decision.selected, topic = %decision.topic, "moderator decision");

        let mut transcript = Vec::new();
        let opening = Utterance {
            agent_id: MODERATOR_ID.into(),
            agent_name: MODERATOR_NAME.into(),
            role: MODERATOR_ROLE.into(),
            content: decision.opening.clone(),
            round: 0,
            kind: UtteranceKind::Opening,
        };
        transcript.push(opening.clone());
        emit_utterance(&utterances, opening);

        let selected = filter_agents_ordered(&request.all_agents, &decision.selected);
        if selected.is_empty() {
            return Ok(DeliberationResult { id: id.clone(), transcript, outcome: Outcome::Complete });
        }

        // Round 1: experts speak in order, each seeing all prior remarks.
        let mut history: Vec<Utterance> = Vec::new();
        for (position, profile) in selected.iter().enumerate() {
            match scope.check() {
                Err(ScopeError::TimedOut) => {
                    warn!(spoken = history.len(), "deliberation deadline hit, returning partial transcript");
                    return Ok(DeliberationResult { id: id.clone(), transcript, outcome: Outcome::TimedOut });
                }
                Err(ScopeError::Cancelled) => {
                    return Ok(DeliberationResult { id: id.clone(), transcript, outcome: Outcome::Cancelled });
                }
                Ok(()) => {}
            }

            debug!(agent = %profile.id, position = position + 1, total = selected.len(), "agent starting");
            emit_progress(&progress, ProgressEvent::AgentStart {
                agent_id: profile.id.clone(),
                agent_name: profile.name.clone(),
                detail: profile.role.clone(),
            });

            let mut previous = build_previous_context(&history);
            if !memory_context.is_empty() {
                previous = format!("{memory_context}\n{previous}");
            }

            let input = RunInput {
                stock: request.stock.clone(),
                query: request.query.clone(),
                reply_content: request.reply_content.clone(),
                position: request.position.clone(),
                previous_discussion: previous,
            };

            let agent_scope = scope.child(self.timeouts.agent);
            let runner = ExpertRunner::new(
                self.agent_model(profile, config, &model),
                Arc::clone(&self.registry),
            );
            let result = runner
                .run(&agent_scope, profile, &input, progress.as_ref())
                .await;

            emit_progress(&progress, ProgressEvent::AgentDone {
                agent_id: profile.id.clone(),
                agent_name: profile.name.clone(),
            });

            match result {
                Ok(content) => {
                    let utterance = Utterance {
                        agent_id: profile.id.clone(),
                        agent_name: profile.name.clone(),
                        role: profile.role.clone(),
                        content,
                        round: 1,
                        kind: UtteranceKind::Opinion,
                    };
                    transcript.push(utterance.clone());
                    history.push(utterance.clone());
                    emit_utterance(&utterances, utterance);
                }
                Err(e) if e.is_timeout() => {
                    warn!(agent = %profile.id, "agent step timed out, skipping");
                }
                Err(crate::error::EngineError::Cancelled) => {
                    // next loop check returns the partial transcript
                }
                Err(e) => {
                    error!(agent = %profile.id, error = %e, "agent step failed, skipping");
                }
            }
        }

        // Final round: closing summary. Failure here degrades, never aborts.
        emit_progress(&progress, ProgressEvent::AgentStart {
            agent_id: MODERATOR_ID.into(),
            agent_name: MODERATOR_NAME.into(),
            detail: "summarizing the discussion".into(),
        });

        let summary_scope = scope.child(self.timeouts.moderator);
        let summary = moderator
            .summarize(&summary_scope, &request.stock, &request.query, &history)
            .await;

        emit_progress(&progress, ProgressEvent::AgentDone {
            agent_id: MODERATOR_ID.into(),
            agent_name: MODERATOR_NAME.into(),
        });

        let summary = match summary {
            Ok(summary) => summary,
            Err(e) if e.is_timeout() => {
                warn!("summary timed out, returning partial results");
                return Ok(DeliberationResult { id: id.clone(), transcript, outcome: Outcome::Complete });
            }
            Err(e) => {
                error!(error = %e, "summary failed");
                return Ok(DeliberationResult { id: id.clone(), transcript, outcome: Outcome::Complete });
            }
        };

        if !summary.is_empty() {
            let utterance = Utterance {
                agent_id: MODERATOR_ID.into(),
                agent_name: MODERATOR_NAME.into(),
                role: MODERATOR_ROLE.into(),
                content: summary.clone(),
                round: 2,
                kind: UtteranceKind::Summary,
            };
            transcript.push(utterance.clone());
            emit_utterance(&utterances, utterance);

            self.save_round(&request, &history, summary);
        }

        Ok(DeliberationResult { id: id.clone(), transcript, outcome: Outcome::Complete })
    }

    /// Persist the round to the memory collaborator on a detached,
    /// best-effort task outside the deliberation's deadline scope.
    fn save_round(&self, request: &DeliberationRequest, history: &[Utterance], summary: String) {
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let symbol = request.stock.symbol.clone();
        let query = request.query.clone();
        let excerpts: Vec<DiscussionExcerpt> = history
            .iter()
            .map(|entry| DiscussionExcerpt {
                agent_name: entry.agent_name.clone(),
                role: entry.role.clone(),
                content: entry.content.clone(),
            })
            .collect();

        tokio::spawn(async move {
            let key_points = match memory.extract_key_points(&excerpts).await {
                Ok(points) => points,
                Err(e) => {
                    warn!(error = %e, "key point extraction failed, using excerpts");
                    fallback_key_points(&excerpts)
                }
            };
            if let Err(e) = memory.add_round(&symbol, &query, &summary, &key_points).await {
                error!(error = %e, topic = %symbol, "saving deliberation round failed");
            } else {
                debug!(topic = %symbol, "deliberation round saved");
            }
        });
    }
}

fn outcome_of(scope: &DeadlineScope) -> Outcome {
    if scope.is_cancelled() {
        Outcome::Cancelled
    } else if scope.is_expired() {
        Outcome::TimedOut
    } else {
        Outcome::Complete
    }
}

/// Keep the moderator's speaking order; drop ids with no matching profile.
fn filter_agents_ordered(all: &[AgentProfile], ids: &[String]) -> Vec<AgentProfile> {
    ids.iter()
        .filter_map(|id| all.iter().find(|p| &p.id == id).cloned())
        .collect()
}

fn build_previous_context(history: &[Utterance]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut text = String::from("[Earlier panel remarks]\n");
    for entry in history {
        text.push_str(&format!(
            "- {} ({}): {}\n\n",
            entry.agent_name, entry.role, entry.content
        ));
    }
    text
}

fn guard_progress(sink: Option<ProgressSink>, scope: &DeadlineScope) -> Option<ProgressSink> {
    sink.map(|sink| {
        let scope = scope.clone();
        Arc::new(move |event: ProgressEvent| {
            if !scope.is_cancelled() {
                sink(event);
            }
        }) as ProgressSink
    })
}

fn guard_utterances(sink: Option<UtteranceSink>, scope: &DeadlineScope) -> Option<UtteranceSink> {
    sink.map(|sink| {
        let scope = scope.clone();
        Arc::new(move |utterance: Utterance| {
            if !scope.is_cancelled() {
                sink(utterance);
            }
        }) as UtteranceSink
    })
}

fn emit_progress(sink: &Option<ProgressSink>, event: ProgressEvent) {
    if let Some(sink) = sink {
        sink(event);
    }
}

fn emit_utterance(sink: &Option<UtteranceSink>, utterance: Utterance) {
    if let Some(sink) = sink {
        sink(utterance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use quorum_core::errors::ProviderError;
    use quorum_core::provider::ProviderKind;
    use quorum_core::request::StockContext;
    use quorum_llm::mock::{MockModel, MockScript};
    use std::collections::VecDeque;

    use crate::memory::MemoryError;

    /// Hands out pre-built model handles in call order.
    struct ScriptedProvisioner {
        models: Mutex<VecDeque<Arc<MockModel>>>,
    }

    impl ScriptedProvisioner {
        fn new(models: Vec<Arc<MockModel>>) -> Self {
            Self { models: Mutex::new(models.into()) }
        }
    }

    impl ModelProvisioner for ScriptedProvisioner {
        fn create_model(
            &self,
            _config: &ProviderConfig,
        ) -> Result<Arc<dyn ModelHandle>, ProviderError> {
            self.models
                .lock()
                .pop_front()
                .map(|m| m as Arc<dyn ModelHandle>)
                .ok_or_else(|| ProviderError::MissingCredentials("no model scripted".into()))
        }
    }

    struct RecordingMemory {
        context: String,
        extraction_fails: bool,
        rounds: Mutex<Vec<(String, String, String, Vec<String>)>>,
    }

    impl RecordingMemory {
        fn new(context: &str) -> Self {
            Self {
                context: context.into(),
                extraction_fails: false,
                rounds: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MemoryStore for RecordingMemory {
        async fn build_context(&self, _symbol: &str, _query: &str) -> String {
            self.context.clone()
        }

        async fn extract_key_points(
            &self,
            entries: &[DiscussionExcerpt],
        ) -> Result<Vec<String>, MemoryError> {
            if self.extraction_fails {
                return Err(MemoryError("model unavailable".into()));
            }
            Ok(entries.iter().map(|e| format!("point from {}", e.agent_name)).collect())
        }

        async fn add_round(
            &self,
            symbol: &str,
            query: &str,
            summary: &str,
            key_points: &[String],
        ) -> Result<(), MemoryError> {
            self.rounds.lock().push((
                symbol.into(),
                query.into(),
                summary.into(),
                key_points.to_vec(),
            ));
            Ok(())
        }
    }

    fn config() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::Anthropic, "sk-test", "claude-sonnet-4-5-20250929")
    }

    fn roster() -> Vec<AgentProfile> {
        vec![
            AgentProfile::new("fundamental", "Ledger Reader", "fundamental researcher"),
            AgentProfile::new("technical", "Chart Watcher", "technical analyst"),
            AgentProfile::new("sentiment", "Crowd Reader", "sentiment analyst"),
        ]
    }

    fn request_smart() -> DeliberationRequest {
        DeliberationRequest {
            stock: StockContext::new("sh600519", "Kweichow Moutai"),
            query: "is the pullback over?".into(),
            all_agents: roster(),
            ..Default::default()
        }
    }

    fn decision_json(ids: &[&str]) -> String {
        let quoted: Vec<String> = ids.iter().map(|id| format!("\"{id}\"")).collect();
        format!(
            "{{\"selected\": [{}], \"topic\": \"pullback\", \"opening\": \"Floor is open.\"}}",
            quoted.join(", ")
        )
    }

    fn service_with(model: Arc<MockModel>) -> DeliberationService {
        DeliberationService::new(
            Arc::new(ScriptedProvisioner::new(vec![model])),
            Arc::new(ToolRegistry::new()),
        )
    }

    fn kinds(result: &DeliberationResult) -> Vec<UtteranceKind> {
        result.transcript.iter().map(|u| u.kind).collect()
    }

    #[tokio::test]
    async fn smart_mode_full_run_produces_ordered_transcript() {
        quorum_telemetry::init();

        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental", "technical", "sentiment"])),
            MockScript::text("earnings support the price"),
            MockScript::text("chart agrees, higher lows"),
            MockScript::text("retail chatter is quiet"),
            MockScript::complete_only("Panel leans constructive."),
        ]));
        let service = service_with(Arc::clone(&model));

        let heard: Arc<Mutex<Vec<Utterance>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&heard);
        let on_utterance: UtteranceSink = Arc::new(move |u| sink_store.lock().push(u));

        let result = service
            .run_smart(Some(&config()), request_smart(), Some(on_utterance), None)
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Complete);
        assert_eq!(
            kinds(&result),
            vec![
                UtteranceKind::Opening,
                UtteranceKind::Opinion,
                UtteranceKind::Opinion,
                UtteranceKind::Opinion,
                UtteranceKind::Summary,
            ]
        );
        assert_eq!(result.transcript[1].agent_id, "fundamental");
        assert_eq!(result.transcript[3].agent_id, "sentiment");
        assert_eq!(result.transcript[0].round, 0);
        assert_eq!(result.transcript[1].round, 1);
        assert_eq!(result.transcript[4].round, 2);

        // the live callback saw every utterance, in order
        assert_eq!(heard.lock().len(), 5);
    }

    #[tokio::test]
    async fn later_agents_see_earlier_remarks_verbatim() {
        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental", "technical", "sentiment"])),
            MockScript::text("margins are stable"),
            MockScript::text("volume confirms"),
            MockScript::text("no froth visible"),
            MockScript::complete_only("done"),
        ]));
        let service = service_with(Arc::clone(&model));

        service
            .run_smart(Some(&config()), request_smart(), None, None)
            .await
            .unwrap();

        let requests = model.requests();
        // requests: [0] analyze, [1] agent1, [2] agent2, [3] agent3, [4] summary
        let second_agent = requests[2].messages[0].text_content();
        assert!(second_agent.contains("margins are stable"));

        let third_agent = requests[3].messages[0].text_content();
        assert!(third_agent.contains("margins are stable"));
        assert!(third_agent.contains("volume confirms"));

        let first_agent = requests[1].messages[0].text_content();
        assert!(!first_agent.contains("[Earlier panel remarks]"));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_timeout_is_skipped_without_aborting() {
        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental", "technical", "sentiment"])),
            MockScript::text("view one"),
            MockScript::delayed(Duration::from_secs(8), MockScript::text("too slow")),
            MockScript::text("view three"),
            MockScript::complete_only("two views made it"),
        ]));
        let service = service_with(model).with_timeouts(DeliberationTimeouts {
            deliberation: Duration::from_secs(60),
            moderator: Duration::from_secs(10),
            agent: Duration::from_secs(5),
            model_creation: Duration::from_secs(1),
        });

        let result = service
            .run_smart(Some(&config()), request_smart(), None, None)
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Complete);
        assert_eq!(
            kinds(&result),
            vec![
                UtteranceKind::Opening,
                UtteranceKind::Opinion,
                UtteranceKind::Opinion,
                UtteranceKind::Summary,
            ]
        );
        assert_eq!(result.transcript[1].agent_id, "fundamental");
        assert_eq!(result.transcript[2].agent_id, "sentiment");
    }

    #[tokio::test(start_paused = true)]
    async fn moderator_timeout_is_a_hard_distinct_failure() {
        let model = Arc::new(MockModel::new(vec![MockScript::delayed(
            Duration::from_secs(30),
            MockScript::complete_only("{}"),
        )]));
        let service = service_with(model).with_timeouts(DeliberationTimeouts {
            deliberation: Duration::from_secs(60),
            moderator: Duration::from_secs(5),
            agent: Duration::from_secs(10),
            model_creation: Duration::from_secs(1),
        });

        let err = service
            .run_smart(Some(&config()), request_smart(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliberationError::ModeratorTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn deliberation_deadline_returns_partial_transcript() {
        let mut all_agents = roster();
        all_agents.push(AgentProfile::new("macro", "Top Down", "macro analyst"));
        all_agents.push(AgentProfile::new("risk", "Downside First", "risk analyst"));
        let request = DeliberationRequest {
            stock: StockContext::new("sh600519", "Kweichow Moutai"),
            query: "q".into(),
            all_agents,
            ..Default::default()
        };

        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&[
                "fundamental",
                "technical",
                "sentiment",
                "macro",
                "risk",
            ])),
            MockScript::delayed(Duration::from_secs(4), MockScript::text("one")),
            MockScript::delayed(Duration::from_secs(4), MockScript::text("two")),
            MockScript::delayed(Duration::from_secs(10), MockScript::text("never lands")),
            MockScript::text("unused"),
            MockScript::text("unused"),
        ]));
        let service = service_with(model).with_timeouts(DeliberationTimeouts {
            deliberation: Duration::from_secs(9),
            moderator: Duration::from_secs(8),
            agent: Duration::from_secs(6),
            model_creation: Duration::from_secs(1),
        });

        let result = service
            .run_smart(Some(&config()), request, None, None)
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(result.is_partial());
        assert_eq!(
            kinds(&result),
            vec![UtteranceKind::Opening, UtteranceKind::Opinion, UtteranceKind::Opinion]
        );
        assert_eq!(result.transcript[1].content, "one");
        assert_eq!(result.transcript[2].content, "two");
    }

    #[tokio::test]
    async fn summary_failure_degrades_to_no_summary() {
        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental"])),
            MockScript::text("lone view"),
            MockScript::Error(ProviderError::Network("summary endpoint down".into())),
        ]));
        let service = service_with(model);

        let result = service
            .run_smart(Some(&config()), request_smart(), None, None)
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Complete);
        assert_eq!(kinds(&result), vec![UtteranceKind::Opening, UtteranceKind::Opinion]);
    }

    #[tokio::test]
    async fn configuration_errors_abort_with_no_transcript() {
        let model = Arc::new(MockModel::new(vec![]));
        let service = service_with(model);

        let err = service
            .run_smart(None, request_smart(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliberationError::NoProviderConfig));

        let mut request = request_smart();
        request.all_agents.clear();
        let err = service
            .run_smart(Some(&config()), request, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliberationError::NoAgents));
    }

    #[tokio::test]
    async fn progress_events_bracket_each_speaker() {
        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental"])),
            MockScript::text("short take"),
            MockScript::complete_only("wrap"),
        ]));
        let service = service_with(model);

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&seen);
        let on_progress: ProgressSink = Arc::new(move |event| {
            sink_store.lock().push(format!("{}:{}", event.event_type(), event.agent_id()));
        });

        service
            .run_smart(Some(&config()), request_smart(), None, Some(on_progress))
            .await
            .unwrap();

        let events = seen.lock().clone();
        assert_eq!(events[0], "agent_start:moderator");
        assert_eq!(events[1], "agent_done:moderator");
        assert!(events.contains(&"agent_start:fundamental".to_string()));
        assert!(events.contains(&"streaming:fundamental".to_string()));
        assert!(events.contains(&"agent_done:fundamental".to_string()));
        assert_eq!(events.last().unwrap(), "agent_done:moderator");
    }

    #[tokio::test(start_paused = true)]
    async fn panel_mode_collects_in_completion_order() {
        let base = Arc::new(MockModel::new(vec![]));
        let slow = Arc::new(MockModel::new(vec![MockScript::delayed(
            Duration::from_secs(3),
            MockScript::text("slow take"),
        )]));
        let fast = Arc::new(MockModel::new(vec![MockScript::text("fast take")]));

        let provisioner = ScriptedProvisioner::new(vec![base, slow, fast]);
        let service = DeliberationService::new(Arc::new(provisioner), Arc::new(ToolRegistry::new()));

        let mut slow_profile = AgentProfile::new("slow", "Slow Hand", "researcher");
        slow_profile.model_override = Some("slow-model".into());
        let mut fast_profile = AgentProfile::new("fast", "Quick Draw", "researcher");
        fast_profile.model_override = Some("fast-model".into());

        let request = DeliberationRequest {
            stock: StockContext::new("sz000001", "Ping An Bank"),
            query: "q".into(),
            agents: vec![slow_profile, fast_profile],
            ..Default::default()
        };

        let result = service.run_panel(Some(&config()), request).await.unwrap();

        assert_eq!(result.outcome, Outcome::Complete);
        assert_eq!(result.transcript.len(), 2);
        assert_eq!(result.transcript[0].agent_id, "fast", "finish order, not launch order");
        assert_eq!(result.transcript[1].agent_id, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn panel_agent_timeout_skipped() {
        let base = Arc::new(MockModel::new(vec![]));
        let stuck = Arc::new(MockModel::new(vec![MockScript::delayed(
            Duration::from_secs(500),
            MockScript::text("never"),
        )]));
        let quick = Arc::new(MockModel::new(vec![MockScript::text("made it")]));

        let provisioner = ScriptedProvisioner::new(vec![base, stuck, quick]);
        let service = DeliberationService::new(Arc::new(provisioner), Arc::new(ToolRegistry::new()));

        let mut stuck_profile = AgentProfile::new("stuck", "Stuck", "researcher");
        stuck_profile.model_override = Some("m1".into());
        let mut quick_profile = AgentProfile::new("quick", "Quick", "researcher");
        quick_profile.model_override = Some("m2".into());

        let request = DeliberationRequest {
            stock: StockContext::new("sz000001", "Ping An Bank"),
            query: "q".into(),
            agents: vec![stuck_profile, quick_profile],
            ..Default::default()
        };

        let result = service.run_panel(Some(&config()), request).await.unwrap();
        assert_eq!(result.transcript.len(), 1);
        assert_eq!(result.transcript[0].agent_id, "quick");
    }

    #[tokio::test]
    async fn panel_requires_addressed_agents() {
        let service = service_with(Arc::new(MockModel::new(vec![])));
        let request = DeliberationRequest {
            stock: StockContext::new("sz000001", "Ping An Bank"),
            query: "q".into(),
            ..Default::default()
        };
        let err = service.run_panel(Some(&config()), request).await.unwrap_err();
        assert!(matches!(err, DeliberationError::NoAgents));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_safe_with_nothing_in_flight() {
        let service = service_with(Arc::new(MockModel::new(vec![])));
        service.cancel("sh600519");
        service.cancel("sh600519");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_inflight_deliberation_returns_partial() {
        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental"])),
            MockScript::delayed(Duration::from_secs(3600), MockScript::text("never")),
        ]));
        let service = Arc::new(service_with(model));

        let heard: Arc<Mutex<Vec<Utterance>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&heard);
        let on_utterance: UtteranceSink = Arc::new(move |u| sink_store.lock().push(u));

        let runner = Arc::clone(&service);
        let handle = tokio::spawn(async move {
            runner
                .run_smart(Some(&config()), request_smart(), Some(on_utterance), None)
                .await
        });

        // let the run reach the stalled agent, then cancel it
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        service.cancel("sh600519");

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert_eq!(kinds(&result), vec![UtteranceKind::Opening]);

        // no further callbacks after cancellation
        assert_eq!(heard.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_deliberation_for_same_topic_cancels_prior() {
        let first_model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental"])),
            MockScript::delayed(Duration::from_secs(3600), MockScript::text("never")),
        ]));
        let second_model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental"])),
            MockScript::text("fresh take"),
            MockScript::complete_only("wrap"),
        ]));
        let provisioner = ScriptedProvisioner::new(vec![first_model, second_model]);
        let service = Arc::new(DeliberationService::new(
            Arc::new(provisioner),
            Arc::new(ToolRegistry::new()),
        ));

        let first = Arc::clone(&service);
        let first_handle = tokio::spawn(async move {
            first.run_smart(Some(&config()), request_smart(), None, None).await
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let second = service
            .run_smart(Some(&config()), request_smart(), None, None)
            .await
            .unwrap();
        assert_eq!(second.outcome, Outcome::Complete);

        let first_result = first_handle.await.unwrap().unwrap();
        assert_eq!(first_result.outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn memory_context_reaches_agents_and_round_is_saved() {
        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental"])),
            MockScript::text("with history in mind"),
            MockScript::complete_only("Summary with memory."),
        ]));
        let memory = Arc::new(RecordingMemory::new("[Memory] prior rounds leaned cautious"));
        let service = DeliberationService::new(
            Arc::new(ScriptedProvisioner::new(vec![Arc::clone(&model)])),
            Arc::new(ToolRegistry::new()),
        )
        .with_memory(Arc::clone(&memory) as Arc<dyn MemoryStore>);

        let result = service
            .run_smart(Some(&config()), request_smart(), None, None)
            .await
            .unwrap();
        assert_eq!(result.transcript.last().unwrap().kind, UtteranceKind::Summary);

        let agent_request = &model.requests()[1];
        assert!(agent_request.messages[0]
            .text_content()
            .contains("prior rounds leaned cautious"));

        // the save task is detached; give it a chance to run
        for _ in 0..50 {
            if !memory.rounds.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let rounds = memory.rounds.lock();
        assert_eq!(rounds.len(), 1);
        let (symbol, _query, summary, key_points) = &rounds[0];
        assert_eq!(symbol, "sh600519");
        assert_eq!(summary, "Summary with memory.");
        assert_eq!(key_points, &vec!["point from Ledger Reader".to_string()]);
    }

    #[tokio::test]
    async fn failed_extraction_falls_back_to_excerpts() {
        let model = Arc::new(MockModel::new(vec![
            MockScript::complete_only(&decision_json(&["fundamental"])),
            MockScript::text("a short but pointed view"),
            MockScript::complete_only("Closing words."),
        ]));
        let mut memory = RecordingMemory::new("");
        memory.extraction_fails = true;
        let memory = Arc::new(memory);
        let service = DeliberationService::new(
            Arc::new(ScriptedProvisioner::new(vec![model])),
            Arc::new(ToolRegistry::new()),
        )
        .with_memory(Arc::clone(&memory) as Arc<dyn MemoryStore>);

        service
            .run_smart(Some(&config()), request_smart(), None, None)
            .await
            .unwrap();

        for _ in 0..50 {
            if !memory.rounds.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let rounds = memory.rounds.lock();
        assert_eq!(rounds.len(), 1);
        assert_eq!(
            rounds[0].3,
            vec!["Ledger Reader: a short but pointed view".to_string()]
        );
    }
}
