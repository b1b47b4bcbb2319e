//! Agent loop implementation

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::client::{GenerationParams, ModelClient, ModelResponse, StopReason};
use crate::conversation::{ConversationStore, Session};
use crate::error::{is_retryable_error, retry_after_hint, AgentError, StoreError};
use crate::message::{extract_text, extract_tool_uses, ContentBlock, ToolInvocationRequest, Turn};
use crate::metrics::{self, MetricsObserver, MetricsSnapshot, NoopMetrics};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::with_retry_hinted;
use crate::tools::router::RouteResult;
use crate::tools::{ToolContext, ToolRegistry, ToolRouter};

use super::state::{AgentConfig, AgentReply, LoopState, Outcome, RunState};

/// The agent loop orchestrator.
///
/// One instance serves many sessions concurrently. Each `process_message` call
/// drives the model until it answers, the iteration budget runs out, or it
/// stops for a reason the loop cannot act on.
pub struct AgentLoop {
    client: Arc<dyn ModelClient>,
    store: Arc<dyn ConversationStore>,
    router: ToolRouter,
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsObserver>,
    params: GenerationParams,
    config: AgentConfig,
    tool_context: ToolContext,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentLoop {
    /// Create a new agent loop with the default rate limit and no metrics
    pub fn new(
        client: Arc<dyn ModelClient>,
        store: Arc<dyn ConversationStore>,
        registry: Arc<ToolRegistry>,
        params: GenerationParams,
        config: AgentConfig,
    ) -> Self {
        let tool_context =
            ToolContext::new(config.working_dir.clone()).with_timeout(config.tool_timeout);
        Self {
            client,
            store,
            router: ToolRouter::new(registry),
            limiter: Arc::new(RateLimiter::from_config(&RateLimitConfig::default())),
            metrics: Arc::new(NoopMetrics),
            params,
            config,
            tool_context,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Share a rate limiter, e.g. across loops hitting the same account
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsObserver>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.router.registry()
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsObserver> {
        &self.metrics
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Handle one user message and return the model's answer.
    ///
    /// Upstream failures propagate after the retry policy gives up; the turns
    /// appended before the failure stay in the session. Tool failures never
    /// propagate, they are fed back to the model as error results.
    #[instrument(skip(self, user_text), fields(model = %self.params.model))]
    pub async fn process_message(
        &self,
        session_key: &str,
        user_text: &str,
    ) -> Result<AgentReply, AgentError> {
        self.metrics.increment(metrics::MESSAGES_PROCESSED);

        let _guard = match self.session_lock(session_key) {
            Some(lock) => Some(lock.lock_owned().await),
            None => None,
        };

        self.run(session_key, user_text).await
    }

    async fn run(&self, session_key: &str, user_text: &str) -> Result<AgentReply, AgentError> {
        self.store.create(session_key, BTreeMap::new()).await?;
        self.store.append_turn(session_key, Turn::user(user_text)).await?;

        info!(
            session = %session_key,
            max_iterations = self.config.max_iterations,
            "Starting agent loop"
        );

        let mut run = RunState::new();
        while run.iteration < self.config.max_iterations {
            run.iteration += 1;
            run.transition(LoopState::AwaitingModel);
            debug!(iteration = run.iteration, "Awaiting model");

            self.limiter.acquire().await?;
            let ModelResponse {
                stop_reason,
                content,
                usage,
            } = self.call_model(session_key).await?;

            debug!(
                stop_reason = %stop_reason,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Model responded"
            );

            run.last_text = extract_text(&content);
            let requests = extract_tool_uses(&content);

            if stop_reason.is_natural_end() {
                if !content.is_empty() {
                    self.store.append_turn(session_key, Turn::assistant(content)).await?;
                }
                run.transition(LoopState::Done);
                info!(iterations = run.iteration, "Agent completed");
                return Ok(run.into_reply(Outcome::Final));
            }

            if stop_reason != StopReason::ToolUse || requests.is_empty() {
                warn!(
                    stop_reason = %stop_reason,
                    tool_requests = requests.len(),
                    "Unexpected stop condition, aborting"
                );
                // Unanswered tool requests would leave the history unusable
                if requests.is_empty() && !content.is_empty() {
                    self.store.append_turn(session_key, Turn::assistant(content)).await?;
                }
                run.transition(LoopState::Aborted);
                return Ok(run.into_reply(Outcome::unexpected(&stop_reason)));
            }

            self.store.append_turn(session_key, Turn::assistant(content)).await?;
            run.transition(LoopState::ExecutingTools);
            run.tool_calls += requests.len();

            let results = self.dispatch_tools(&requests).await;
            self.store.append_turn(session_key, Turn::tool_results(results)).await?;
        }

        self.metrics.increment(metrics::MAX_ITERATIONS_REACHED);
        warn!(
            session = %session_key,
            iterations = run.iteration,
            "Max iterations reached"
        );
        Ok(run.into_reply(Outcome::IterationLimit))
    }

    /// One model call through the retry executor, against the current history
    async fn call_model(&self, session_key: &str) -> Result<ModelResponse, AgentError> {
        let session = self.load_session(session_key).await?;
        let tools = self.router.registry().list_definitions();
        let turns = session.turns.as_slice();
        let tools = tools.as_slice();

        let policy = &self.config.retry;
        let response = with_retry_hinted(policy, is_retryable_error, retry_after_hint, |attempt| {
            async move {
                self.metrics.increment(metrics::API_CALLS);
                let started = Instant::now();
                let result = self.client.complete(turns, tools, &self.params).await;
                self.metrics
                    .record(metrics::API_LATENCY_MS, started.elapsed().as_millis() as f64);

                if let Err(e) = &result {
                    self.metrics.increment(metrics::API_ERRORS);
                    debug!(attempt, kind = ?e.kind, error = %e, "Model call failed");
                }
                result
            }
        })
        .await?;

        Ok(response)
    }

    /// Execute tool requests in order, one result block per request
    async fn dispatch_tools(&self, requests: &[ToolInvocationRequest]) -> Vec<ContentBlock> {
        let results = self.router.route_all(requests, &self.tool_context).await;

        requests
            .iter()
            .zip(results)
            .map(|(request, result)| {
                self.record_tool_metrics(request, &result);
                result.into_block(request)
            })
            .collect()
    }

    fn record_tool_metrics(&self, request: &ToolInvocationRequest, result: &RouteResult) {
        self.metrics.increment(&metrics::tool_executions(&request.name));
        match result {
            RouteResult::Completed(outcome) => {
                self.metrics.record(
                    &metrics::tool_latency(&request.name),
                    outcome.duration.as_millis() as f64,
                );
                if !outcome.success {
                    self.metrics.increment(&metrics::tool_errors(&request.name));
                }
            }
            RouteResult::NotFound(_) => {
                self.metrics.increment(&metrics::tool_errors(&request.name));
            }
        }
    }

    async fn load_session(&self, session_key: &str) -> Result<Session, StoreError> {
        self.store
            .get(session_key)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_key.to_string()))
    }

    fn session_lock(&self, session_key: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        if !self.config.serialize_sessions {
            return None;
        }
        let mut locks = self.session_locks.lock();
        Some(Arc::clone(locks.entry(session_key.to_string()).or_default()))
    }

    /// Turn history of a session, empty if it does not exist
    pub async fn history(&self, session_key: &str) -> Result<Vec<Turn>, AgentError> {
        Ok(self
            .store
            .get(session_key)
            .await?
            .map(|session| session.turns)
            .unwrap_or_default())
    }

    /// Drop a session, waiting for any in-flight call on it to finish.
    ///
    /// The serialization lock is forgotten only when no other call holds or
    /// awaits it.
    pub async fn clear_session(&self, session_key: &str) -> Result<(), AgentError> {
        let lock = self.session_lock(session_key);
        let guard = match &lock {
            Some(lock) => Some(Arc::clone(lock).lock_owned().await),
            None => None,
        };

        self.store.clear(session_key).await?;

        drop(guard);
        if let Some(lock) = lock {
            let mut locks = self.session_locks.lock();
            let current = locks.get(session_key).map_or(false, |l| Arc::ptr_eq(l, &lock));
            // one reference in the map, one here
            if current && Arc::strong_count(&lock) == 2 {
                locks.remove(session_key);
            }
        }
        Ok(())
    }

    /// Counters and gauges plus rate limiter and session state
    pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot, AgentError> {
        Ok(MetricsSnapshot {
            counters: self.metrics.counters(),
            gauges: self.metrics.gauges(),
            rate_limit: self.limiter.stats().await,
            active_sessions: self.store.session_count().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::conversation::InMemoryConversationStore;
    use crate::error::UpstreamError;
    use crate::message::{Role, TurnContent};
    use crate::metrics::InMemoryMetrics;
    use crate::rate_limit::RateLimitError;
    use crate::retry::{RetryError, RetryPolicy};
    use crate::tools::{ParameterProperty, ParameterSchema, Tool, ToolDefinition};

    /// Replays scripted responses, then repeats the fallback
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<ModelResponse, UpstreamError>>>,
        fallback: Option<Result<ModelResponse, UpstreamError>>,
        calls: Mutex<Vec<Vec<Turn>>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<ModelResponse, UpstreamError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn repeating(response: Result<ModelResponse, UpstreamError>) -> Self {
            Self {
                fallback: Some(response),
                ..Self::new(Vec::new())
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(
            &self,
            turns: &[Turn],
            _tools: &[ToolDefinition],
            _params: &GenerationParams,
        ) -> Result<ModelResponse, UpstreamError> {
            self.calls.lock().push(turns.to_vec());
            let next = self.script.lock().pop_front();
            match next.or_else(|| self.fallback.clone()) {
                Some(response) => response,
                None => Err(UpstreamError::unknown("script exhausted")),
            }
        }
    }

    /// Answers "re: <last user text>" after a delay
    struct SlowEchoClient;

    #[async_trait]
    impl ModelClient for SlowEchoClient {
        async fn complete(
            &self,
            turns: &[Turn],
            _tools: &[ToolDefinition],
            _params: &GenerationParams,
        ) -> Result<ModelResponse, UpstreamError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let last = turns.last().map(Turn::text).unwrap_or_default();
            Ok(ModelResponse::text(format!("re: {}", last)))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its input"
        }

        fn parameters_schema(&self) -> ParameterSchema {
            ParameterSchema::new().with_required("msg", ParameterProperty::string("Text to echo"))
        }

        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
            let msg = args
                .get("msg")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("Missing required parameter: msg"))?;
            Ok(json!({ "echoed": msg }))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters_schema(&self) -> ParameterSchema {
            ParameterSchema::new()
        }

        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<Value> {
            anyhow::bail!("Access denied")
        }
    }

    fn echo_request(id: &str) -> ModelResponse {
        ModelResponse::tool_use(vec![ContentBlock::tool_use(id, "echo", json!({"msg": "x"}))])
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, 10, 100)
    }

    fn build(
        client: Arc<dyn ModelClient>,
        config: AgentConfig,
    ) -> (AgentLoop, Arc<InMemoryMetrics>) {
        let registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FailingTool);

        let metrics = Arc::new(InMemoryMetrics::new());
        let agent = AgentLoop::new(
            client,
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(registry),
            GenerationParams::new("test-model"),
            config.with_retry(fast_retry()),
        )
        .with_metrics(metrics.clone());
        (agent, metrics)
    }

    fn result_block(turn: &Turn, index: usize) -> (String, String, bool) {
        match &turn.content {
            TurnContent::Blocks(blocks) => match &blocks[index] {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => (tool_use_id.clone(), content.clone(), *is_error),
                other => panic!("expected tool result, got {:?}", other),
            },
            other => panic!("expected blocks, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(ModelResponse::text("Hello"))]));
        let (agent, metrics) = build(client, AgentConfig::default());

        let reply = agent.process_message("s1", "Hi").await.unwrap();
        assert_eq!(reply.text, "Hello");
        assert_eq!(reply.outcome, Outcome::Final);
        assert_eq!(reply.iterations, 1);

        let history = agent.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], Turn::user("Hi"));
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].text(), "Hello");

        assert_eq!(metrics.counter(metrics::MESSAGES_PROCESSED), 1);
        assert_eq!(metrics.counter(metrics::API_CALLS), 1);
        assert!(metrics.gauge(metrics::API_LATENCY_MS).is_some());
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(echo_request("t1")),
            Ok(ModelResponse::text("done")),
        ]));
        let (agent, metrics) = build(client.clone(), AgentConfig::default());

        let reply = agent.process_message("s1", "Echo x").await.unwrap();
        assert_eq!(reply.text, "done");
        assert_eq!(reply.iterations, 2);
        assert_eq!(reply.tool_calls, 1);

        let history = agent.history("s1").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].tool_uses()[0].name, "echo");
        assert!(history[2].is_tool_results());
        assert_eq!(
            result_block(&history[2], 0),
            ("t1".to_string(), r#"{"echoed":"x"}"#.to_string(), false)
        );
        assert_eq!(history[3].text(), "done");

        // The second call saw the tool result
        assert_eq!(client.calls.lock()[1].len(), 3);
        assert_eq!(metrics.counter(&metrics::tool_executions("echo")), 1);
        assert_eq!(metrics.counter(&metrics::tool_errors("echo")), 0);
    }

    #[tokio::test]
    async fn test_iteration_limit_is_not_an_error() {
        let client = Arc::new(ScriptedClient::repeating(Ok(echo_request("t1"))));
        let config = AgentConfig::default().with_max_iterations(1);
        let (agent, metrics) = build(client.clone(), config);

        let reply = agent.process_message("s1", "loop forever").await.unwrap();
        assert_eq!(reply.outcome, Outcome::IterationLimit);
        assert_eq!(reply.iterations, 1);
        assert_eq!(reply.text, "");
        assert_eq!(client.call_count(), 1);
        assert_eq!(metrics.counter(metrics::MAX_ITERATIONS_REACHED), 1);
        assert_eq!(agent.history("s1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_reported_to_model() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(ModelResponse::tool_use(vec![
                ContentBlock::tool_use("a", "missing_tool", json!({})),
                ContentBlock::tool_use("b", "echo", json!({"msg": "x"})),
            ])),
            Ok(ModelResponse::text("recovered")),
        ]));
        let (agent, metrics) = build(client, AgentConfig::default());

        let reply = agent.process_message("s1", "go").await.unwrap();
        assert_eq!(reply.text, "recovered");

        let history = agent.history("s1").await.unwrap();
        let (id, content, is_error) = result_block(&history[2], 0);
        assert_eq!(id, "a");
        assert!(is_error);
        assert!(content.contains("missing_tool"));

        let (id, _, is_error) = result_block(&history[2], 1);
        assert_eq!(id, "b");
        assert!(!is_error);

        assert_eq!(metrics.counter(&metrics::tool_errors("missing_tool")), 1);
    }

    #[tokio::test]
    async fn test_tool_failure_fed_back() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(ModelResponse::tool_use(vec![ContentBlock::tool_use("f1", "fail", json!({}))])),
            Ok(ModelResponse::text("sorry")),
        ]));
        let (agent, metrics) = build(client, AgentConfig::default());

        let reply = agent.process_message("s1", "try it").await.unwrap();
        assert_eq!(reply.text, "sorry");

        let history = agent.history("s1").await.unwrap();
        let (_, content, is_error) = result_block(&history[2], 0);
        assert!(is_error);
        assert!(content.contains("Access denied"));
        assert_eq!(metrics.counter(&metrics::tool_errors("fail")), 1);
    }

    #[tokio::test]
    async fn test_terminal_upstream_error_propagates() {
        let client = Arc::new(ScriptedClient::repeating(Err(UpstreamError::auth(401, "bad key"))));
        let (agent, metrics) = build(client.clone(), AgentConfig::default());

        let err = agent.process_message("s1", "Hi").await.unwrap_err();
        assert!(matches!(err, AgentError::Upstream(RetryError::Terminal { attempts: 1, .. })));
        assert!(!err.is_transient());
        assert_eq!(client.call_count(), 1);
        assert_eq!(metrics.counter(metrics::API_ERRORS), 1);

        // No rollback of the user turn
        assert_eq!(agent.history("s1").await.unwrap(), vec![Turn::user("Hi")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(UpstreamError::server_error(503, "overloaded")),
            Ok(ModelResponse::text("ok")),
        ]));
        let (agent, metrics) = build(client.clone(), AgentConfig::default());

        let reply = agent.process_message("s1", "Hi").await.unwrap();
        assert_eq!(reply.text, "ok");
        assert_eq!(client.call_count(), 2);
        assert_eq!(metrics.counter(metrics::API_CALLS), 2);
        assert_eq!(metrics.counter(metrics::API_ERRORS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_surfaces_last_error() {
        let throttled = UpstreamError::rate_limit("slow down");
        let client = Arc::new(ScriptedClient::repeating(Err(throttled)));
        let (agent, _) = build(client.clone(), AgentConfig::default());

        let err = agent.process_message("s1", "Hi").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.upstream().map(|e| e.status), Some(Some(429)));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unexpected_stop_aborts_with_partial_text() {
        let truncated = ModelResponse {
            stop_reason: StopReason::MaxTokens,
            content: vec![ContentBlock::text("partial ans")],
            usage: Default::default(),
        };
        let client = Arc::new(ScriptedClient::new(vec![Ok(truncated)]));
        let (agent, _) = build(client, AgentConfig::default());

        let reply = agent.process_message("s1", "write a lot").await.unwrap();
        assert_eq!(reply.outcome, Outcome::UnexpectedStop("max_tokens".into()));
        assert_eq!(reply.text, "partial ans");
        assert_eq!(agent.history("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_use_without_requests_aborts() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(ModelResponse::tool_use(vec![
            ContentBlock::text("thinking"),
        ]))]));
        let (agent, _) = build(client, AgentConfig::default());

        let reply = agent.process_message("s1", "go").await.unwrap();
        assert_eq!(reply.outcome, Outcome::UnexpectedStop("tool_use".into()));
        assert_eq!(reply.text, "thinking");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_calls_are_serialized() {
        let (agent, _) = build(Arc::new(SlowEchoClient), AgentConfig::default());

        let (a, b) = tokio::join!(
            agent.process_message("shared", "first"),
            agent.process_message("shared", "second"),
        );
        assert_eq!(a.unwrap().text, "re: first");
        assert_eq!(b.unwrap().text, "re: second");

        let history = agent.history("shared").await.unwrap();
        let texts: Vec<String> = history.iter().map(Turn::text).collect();
        assert_eq!(texts, vec!["first", "re: first", "second", "re: second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_sessions_run_concurrently() {
        let (agent, _) = build(Arc::new(SlowEchoClient), AgentConfig::default());
        let started = tokio::time::Instant::now();

        let (a, b) = tokio::join!(
            agent.process_message("one", "a"),
            agent.process_message("two", "b"),
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let client = Arc::new(ScriptedClient::repeating(Ok(ModelResponse::text("Hello"))));
        let (agent, metrics) = build(client, AgentConfig::default());

        agent.process_message("a", "Hi").await.unwrap();
        agent.process_message("b", "Hi").await.unwrap();

        let snapshot = agent.metrics_snapshot().await.unwrap();
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.counter(metrics::MESSAGES_PROCESSED), 2);
        assert_eq!(snapshot.rate_limit.current, 2);
        assert_eq!(snapshot.rate_limit.max, 50);

        agent.clear_session("a").await.unwrap();
        metrics.reset();
        let snapshot = agent.metrics_snapshot().await.unwrap();
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.counter(metrics::MESSAGES_PROCESSED), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_limiter_fails_the_call() {
        let client = Arc::new(ScriptedClient::repeating(Ok(ModelResponse::text("Hello"))));
        let (agent, _) = build(client.clone(), AgentConfig::default());
        let agent = agent.with_rate_limiter(Arc::new(RateLimiter::per_minute(0)));

        let err = agent.process_message("s1", "Hi").await.unwrap_err();
        assert!(matches!(err, AgentError::RateLimit(RateLimitError::ZeroCapacity)));
        assert_eq!(client.call_count(), 0);
        assert_eq!(agent.history("s1").await.unwrap(), vec![Turn::user("Hi")]);
    }

    #[tokio::test]
    async fn test_empty_final_answer_is_not_recorded() {
        let empty = ModelResponse {
            stop_reason: StopReason::EndTurn,
            content: Vec::new(),
            usage: Default::default(),
        };
        let client = Arc::new(ScriptedClient::new(vec![Ok(empty)]));
        let (agent, _) = build(client, AgentConfig::default());

        let reply = agent.process_message("s1", "Hi").await.unwrap();
        assert_eq!(reply.outcome, Outcome::Final);
        assert_eq!(reply.text, "");
        assert_eq!(agent.history("s1").await.unwrap(), vec![Turn::user("Hi")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_retry_after_delays_next_attempt() {
        let throttled =
            UpstreamError::rate_limit("slow down").with_retry_after(Duration::from_secs(20));
        let client = Arc::new(ScriptedClient::new(vec![
            Err(throttled),
            Ok(ModelResponse::text("ok")),
        ]));
        let (agent, _) = build(client.clone(), AgentConfig::default());
        let started = tokio::time::Instant::now();

        let reply = agent.process_message("s1", "Hi").await.unwrap();
        assert_eq!(reply.text, "ok");
        assert_eq!(client.call_count(), 2);
        // 20s hint, capped by the policy's 100ms max delay
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_waits_for_in_flight_call() {
        let (agent, _) = build(Arc::new(SlowEchoClient), AgentConfig::default());

        let (first, second) = tokio::join!(agent.process_message("s", "first"), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            agent.clear_session("s").await.unwrap();
            agent.process_message("s", "second").await
        });
        assert_eq!(first.unwrap().text, "re: first");
        assert_eq!(second.unwrap().text, "re: second");

        let history = agent.history("s").await.unwrap();
        let texts: Vec<String> = history.iter().map(Turn::text).collect();
        assert_eq!(texts, vec!["second", "re: second"]);
    }

    #[tokio::test]
    async fn test_clear_forgets_idle_session_lock() {
        let client = Arc::new(ScriptedClient::repeating(Ok(ModelResponse::text("Hello"))));
        let (agent, _) = build(client, AgentConfig::default());

        agent.process_message("s", "Hi").await.unwrap();
        assert!(agent.session_locks.lock().contains_key("s"));

        agent.clear_session("s").await.unwrap();
        assert!(!agent.session_locks.lock().contains_key("s"));
        assert!(agent.history("s").await.unwrap().is_empty());
    }
}
