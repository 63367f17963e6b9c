//! 回合管线：规划 -> 计划校验 -> 执行 -> 校验 -> （至多一次）重试 -> 记忆写入
//!
//! 每个回合开始时清零 CallBudget；规划与校验各记一次调用，预算耗尽立即收尾。
//! 记忆图的计划否决与校验 FAIL 都转成 hindsight 交给下一次规划。
//! 每次实际执行过的步骤都记为动作，回合结束时运行一次记忆维护。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, BudgetMetadata, CallBudget, RecoveryAction, RecoveryEngine};
use crate::execution::{ExecutionLoop, ExecutionResult, FallbackTable, OutputGovernor};
use crate::llm::LlmClient;
use crate::memory::{MaintenanceReport, SharedGraph};
use crate::react::events::TurnEvent;
use crate::react::planner::{Plan, PlanRequest, Planner};
use crate::react::verifier::{Verdict, Verifier};
use crate::tools::{EphemeralStore, QueryEphemeralTool, ToolRegistry, ToolRunner};

/// 规划器上下文的字符上限
const PLANNER_CONTEXT_CHARS: usize = 1500;
const EVENT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// 执行完成且校验通过
    Passed,
    /// 重试后仍未通过（或计划始终被否决）
    Failed,
    /// 推理调用预算耗尽
    BudgetExhausted,
    /// 超时或被取消，返回部分结果
    Interrupted,
    /// 规划器给出空计划，无需工具
    NoAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// 需要直接展示给用户的说明（预算耗尽、超时）
    pub message: Option<String>,
    pub execution: Option<ExecutionResult>,
    pub verdict: Option<Verdict>,
    pub attempts: usize,
    /// 本回合写入记忆图的动作 id
    pub actions: Vec<String>,
    pub budget: BudgetMetadata,
    pub maintenance: Option<MaintenanceReport>,
    /// 回合结束时清理掉的过期转存文档数
    pub ephemeral_removed: usize,
}

struct TurnState {
    execution: Option<ExecutionResult>,
    verdict: Option<Verdict>,
    attempts: usize,
    actions: Vec<String>,
}

pub struct TurnPipeline {
    planner: Arc<dyn Planner>,
    executor: ExecutionLoop,
    verifier: Verifier,
    graph: SharedGraph,
    recovery: RecoveryEngine,
    max_iterations: usize,
    max_retries: usize,
    turn_timeout: Duration,
    ephemeral: Option<Arc<dyn EphemeralStore>>,
    ephemeral_max_age: Duration,
    event_tx: Option<UnboundedSender<TurnEvent>>,
}

impl TurnPipeline {
    pub fn new(planner: Arc<dyn Planner>, executor: ExecutionLoop, verifier: Verifier, graph: SharedGraph) -> Self {
        let defaults = AppConfig::default();
        Self {
            planner,
            executor,
            verifier,
            graph,
            recovery: RecoveryEngine::new(),
            max_iterations: defaults.execution.max_iterations,
            max_retries: defaults.budget.max_retries,
            turn_timeout: Duration::from_secs(defaults.execution.turn_timeout_secs),
            ephemeral: None,
            ephemeral_max_age: Duration::from_secs(defaults.governor.ephemeral_max_age_secs),
            event_tx: None,
        }
    }

    /// 按配置组装：工具运行器、输出管控（可选临时内容库）、校验器
    pub fn from_config(
        cfg: &AppConfig,
        planner: Arc<dyn Planner>,
        mut registry: ToolRegistry,
        verifier_llm: Arc<dyn LlmClient>,
        graph: SharedGraph,
        ephemeral: Option<Arc<dyn EphemeralStore>>,
    ) -> Self {
        let mut governor = OutputGovernor::from_config(&cfg.governor);
        if let Some(store) = &ephemeral {
            registry.register(QueryEphemeralTool::new(store.clone()));
            governor = governor.with_store(store.clone());
        }
        let runner = ToolRunner::new(
            Arc::new(registry),
            cfg.execution.tool_timeout_secs,
            FallbackTable::new(cfg.execution.fallbacks.clone()),
        );
        let executor = ExecutionLoop::new(Arc::new(runner), governor);
        let verifier = Verifier::from_config(verifier_llm, &cfg.verifier);
        let mut pipeline = Self::new(planner, executor, verifier, graph)
            .with_limits(cfg.execution.max_iterations, cfg.budget.max_retries)
            .with_turn_timeout(Duration::from_secs(cfg.execution.turn_timeout_secs));
        if let Some(store) = ephemeral {
            pipeline = pipeline
                .with_ephemeral_cleanup(store, Duration::from_secs(cfg.governor.ephemeral_max_age_secs));
        }
        pipeline
    }

    pub fn with_limits(mut self, max_iterations: usize, max_retries: usize) -> Self {
        self.max_iterations = max_iterations;
        self.max_retries = max_retries;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// 回合结束时清理 store 中早于 max_age 的转存文档
    pub fn with_ephemeral_cleanup(mut self, store: Arc<dyn EphemeralStore>, max_age: Duration) -> Self {
        self.ephemeral = Some(store);
        self.ephemeral_max_age = max_age;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    /// 回复发出前用记忆图核对；Err 中是需要纠正的原因
    pub async fn check_reply(&self, reply: &str) -> Result<(), String> {
        let result = self.graph.read().await.self_check(reply);
        if let Err(reason) = &result {
            tracing::warn!(reason = %reason, "reply contradicts memory graph");
        }
        result
    }

    fn emit(&self, ev: TurnEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 运行一个回合。只有规划器后端故障会以 Err 返回，其余情况都折叠进 TurnOutcome
    pub async fn run_turn(
        &self,
        user_input: &str,
        budget: &mut CallBudget,
        cancel: Option<&CancellationToken>,
    ) -> Result<TurnOutcome, AgentError> {
        budget.reset();
        let deadline = Instant::now() + self.turn_timeout;
        let mut state = TurnState {
            execution: None,
            verdict: None,
            attempts: 0,
            actions: Vec::new(),
        };

        let result = self.drive(user_input, budget, deadline, cancel, &mut state).await;
        let (status, message) = match result {
            Ok(status) => (status, None),
            Err(e) => match self.recovery.handle(&e) {
                RecoveryAction::Finalize(msg) => {
                    let status = if matches!(e, AgentError::BudgetExceeded { .. }) {
                        self.emit(TurnEvent::BudgetExhausted { calls: budget.call_count() });
                        TurnStatus::BudgetExhausted
                    } else {
                        TurnStatus::Interrupted
                    };
                    (status, Some(msg))
                }
                _ => {
                    // 规划后端故障：先完成回合维护，再上抛
                    self.end_of_turn().await;
                    return Err(e);
                }
            },
        };

        let (maintenance, ephemeral_removed) = self.end_of_turn().await;
        self.emit(TurnEvent::Done {
            status: format!("{status:?}"),
        });
        tracing::info!(
            status = ?status,
            attempts = state.attempts,
            calls = budget.call_count(),
            actions = state.actions.len(),
            "turn finished"
        );
        Ok(TurnOutcome {
            status,
            message,
            execution: state.execution,
            verdict: state.verdict,
            attempts: state.attempts,
            actions: state.actions,
            budget: budget.to_metadata(),
            maintenance: Some(maintenance),
            ephemeral_removed,
        })
    }

    /// 记忆图维护 + 过期转存清理
    async fn end_of_turn(&self) -> (MaintenanceReport, usize) {
        let maintenance = self.graph.advance_turn().await;
        let removed = match &self.ephemeral {
            Some(store) => store.cleanup_older_than(self.ephemeral_max_age).await,
            None => 0,
        };
        (maintenance, removed)
    }

    async fn drive(
        &self,
        user_input: &str,
        budget: &mut CallBudget,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
        state: &mut TurnState,
    ) -> Result<TurnStatus, AgentError> {
        let context = self
            .graph
            .read()
            .await
            .context_for_planner(user_input, PLANNER_CONTEXT_CHARS);

        for attempt in 0..=self.max_retries {
            let last_attempt = attempt == self.max_retries;
            state.attempts = attempt + 1;
            self.emit(TurnEvent::Planning { attempt: attempt + 1 });

            budget.record_call("planning")?;
            let request = PlanRequest {
                user_input: user_input.to_string(),
                context: context.clone(),
                hindsight: budget.hindsight().map(str::to_string),
            };
            let plan = match self.planner.plan(&request).await {
                Ok(plan) => plan,
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::RetryWithHindsight(h) if !last_attempt => {
                        tracing::warn!(error = %e, "plan unusable, retrying");
                        self.retry(budget, h);
                        continue;
                    }
                    RecoveryAction::RetryWithHindsight(_) => return Ok(TurnStatus::Failed),
                    _ => return Err(e),
                },
            };

            if let Err(rejection) = self.graph.read().await.validate_plan(&plan.steps) {
                tracing::warn!(step = rejection.step_id, reason = %rejection.reason, "plan vetoed by memory");
                self.emit(TurnEvent::PlanRejected {
                    step_id: rejection.step_id,
                    reason: rejection.reason.clone(),
                });
                if last_attempt {
                    return Ok(TurnStatus::Failed);
                }
                self.retry(budget, rejection.to_string());
                continue;
            }

            if plan.is_empty() {
                return Ok(TurnStatus::NoAction);
            }
            self.emit(TurnEvent::PlanReady {
                tools: plan.tools().map(str::to_string).collect(),
            });

            let execution = self
                .executor
                .execute_plan_until(&plan.steps, self.max_iterations, user_input, budget, Some(deadline), cancel)
                .await;
            self.record_actions(&execution, state).await;
            let interrupted = execution.interrupted;
            let outputs = execution.outputs.clone();
            state.execution = Some(execution);
            if interrupted {
                return Err(AgentError::TurnTimeout);
            }

            let verdict = self.verify(user_input, &plan, &outputs, budget).await?;
            let passed = verdict.passed;
            let reason = verdict.reason.clone();
            state.verdict = Some(verdict);
            if passed {
                return Ok(TurnStatus::Passed);
            }
            if last_attempt {
                return Ok(TurnStatus::Failed);
            }
            self.retry(budget, reason);
        }
        Ok(TurnStatus::Failed)
    }

    async fn verify(
        &self,
        user_input: &str,
        plan: &Plan,
        outputs: &str,
        budget: &mut CallBudget,
    ) -> Result<Verdict, AgentError> {
        let verdict = self.verifier.evaluate(user_input, plan, outputs, budget).await?;
        self.emit(TurnEvent::Verdict {
            passed: verdict.passed,
            reason: verdict.reason.clone(),
        });
        Ok(verdict)
    }

    fn retry(&self, budget: &mut CallBudget, hindsight: String) {
        self.emit(TurnEvent::Retry {
            hindsight: hindsight.clone(),
        });
        budget.set_hindsight(hindsight);
    }

    async fn record_actions(&self, execution: &ExecutionResult, state: &mut TurnState) {
        let mut graph = self.graph.write().await;
        for step in &execution.steps {
            let action = graph.record_action(&step.tool, step.args.clone(), &step.output, step.success);
            state.actions.push(action.id);
            self.emit(TurnEvent::ToolResult {
                tool: step.tool.clone(),
                success: step.success,
                preview: step.output.chars().take(EVENT_PREVIEW_CHARS).collect(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::{MemoryGraph, MemoryPolicy};
    use crate::react::planner::LlmPlanner;
    use crate::tools::{EchoTool, InMemoryEphemeralStore};

    fn pipeline(planner_llm: Arc<MockLlmClient>, verifier_llm: Arc<MockLlmClient>) -> TurnPipeline {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let planner = Arc::new(LlmPlanner::new(planner_llm, &registry.to_schema_json()));
        let graph = SharedGraph::in_memory(MemoryGraph::new("Ada", MemoryPolicy::default()));
        TurnPipeline::from_config(&AppConfig::default(), planner, registry, verifier_llm, graph, None)
    }

    const ECHO_PLAN: &str = r#"{"plan": [{"id": 1, "tool": "echo", "args": {"text": "Reminder set for 5pm"}}]}"#;

    #[tokio::test]
    async fn test_turn_passes_and_records_action() {
        let planner_llm = Arc::new(MockLlmClient::with_responses([ECHO_PLAN]));
        let verifier_llm = Arc::new(MockLlmClient::new());
        let p = pipeline(planner_llm, verifier_llm.clone());
        let mut budget = CallBudget::new(8);

        let out = p.run_turn("remind me at 5", &mut budget, None).await.unwrap();
        assert_eq!(out.status, TurnStatus::Passed);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.actions.len(), 1);
        assert_eq!(out.budget.llm_calls, 2);
        assert_eq!(verifier_llm.call_count(), 1);
        assert_eq!(p.graph().read().await.current_turn(), 1);
    }

    #[tokio::test]
    async fn test_fail_then_retry_with_hindsight() {
        let planner_llm = Arc::new(MockLlmClient::with_responses([ECHO_PLAN, ECHO_PLAN]));
        let verifier_llm = Arc::new(MockLlmClient::with_responses([
            r#"{"verdict": "FAIL", "reason": "wrong time"}"#,
            r#"{"verdict": "FAIL", "reason": "still wrong"}"#,
        ]));
        let p = pipeline(planner_llm.clone(), verifier_llm);
        let mut budget = CallBudget::new(8);

        let out = p.run_turn("remind me at 6", &mut budget, None).await.unwrap();
        assert_eq!(out.status, TurnStatus::Failed);
        assert_eq!(out.attempts, 2);
        assert_eq!(out.budget.retries, 1);
        assert_eq!(out.verdict.unwrap().reason, "still wrong");
        assert!(planner_llm.last_messages()[0].content.contains("wrong time"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_finalizes() {
        let planner_llm = Arc::new(MockLlmClient::with_responses([ECHO_PLAN]));
        let p = pipeline(planner_llm, Arc::new(MockLlmClient::new()));
        let mut budget = CallBudget::new(1);

        let out = p.run_turn("remind me", &mut budget, None).await.unwrap();
        assert_eq!(out.status, TurnStatus::BudgetExhausted);
        assert!(out.message.unwrap().contains("couldn't finish within my limits"));
        assert_eq!(out.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_is_no_action() {
        let planner_llm = Arc::new(MockLlmClient::with_responses([r#"{"plan": []}"#]));
        let p = pipeline(planner_llm, Arc::new(MockLlmClient::new()));
        let mut budget = CallBudget::new(8);
        let out = p.run_turn("hello", &mut budget, None).await.unwrap();
        assert_eq!(out.status, TurnStatus::NoAction);
        assert_eq!(out.budget.llm_calls, 1);
    }

    #[tokio::test]
    async fn test_turn_end_drops_expired_ephemeral_docs() {
        let store = Arc::new(InMemoryEphemeralStore::new());
        store.ingest("old page body", "fetch_page").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let planner_llm = Arc::new(MockLlmClient::with_responses([r#"{"plan": []}"#]));
        let planner = Arc::new(LlmPlanner::new(planner_llm, "[]"));
        let graph = SharedGraph::in_memory(MemoryGraph::new("Ada", MemoryPolicy::default()));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let p = TurnPipeline::from_config(
            &AppConfig::default(),
            planner,
            registry,
            Arc::new(MockLlmClient::new()),
            graph,
            Some(store.clone() as Arc<dyn EphemeralStore>),
        )
        .with_ephemeral_cleanup(store.clone(), Duration::from_millis(1));

        let mut budget = CallBudget::new(8);
        let out = p.run_turn("hello", &mut budget, None).await.unwrap();
        assert_eq!(out.ephemeral_removed, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_check_reply_uses_graph_facts() {
        let p = pipeline(Arc::new(MockLlmClient::new()), Arc::new(MockLlmClient::new()));
        p.graph()
            .write()
            .await
            .add_not_claim("the actress", crate::memory::EntitySource::UserStated);

        assert!(p.check_reply("You are the actress, right?").await.is_err());
        assert!(p.check_reply("Reminder set for 5pm.").await.is_ok());
    }

    #[tokio::test]
    async fn test_planner_backend_error_surfaces() {
        let planner_llm = Arc::new(MockLlmClient::new());
        planner_llm.push_error("connection reset");
        let p = pipeline(planner_llm, Arc::new(MockLlmClient::new()));
        let mut budget = CallBudget::new(8);
        let err = p.run_turn("hello", &mut budget, None).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmError(_)));
    }
}
