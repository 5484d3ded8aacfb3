//! 编排集成测试：Dispatcher → Planner → Actor 全流程

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::config::{OrchestratorConfig, SandboxSection};
    use hive::core::{OrchestratorError, SessionStatus, TerminalReason};
    use hive::human::HumanInterventionGate;
    use hive::plan::{Postcondition, StepDraft, StepId, StepState, Task};
    use hive::planner::FixedPlanStrategy;
    use hive::recorder::{RecordEntry, RecordEvent};
    use hive::tools::{EchoTool, SleepTool, Tool, ToolError, ToolRegistry};
    use hive::{SessionOutcome, TaskDispatcher};
    use serde_json::{json, Value};

    /// 按脚本依次返回结果的工具，脚本耗尽后返回 fallback
    struct ScriptedTool {
        name: &'static str,
        script: Mutex<VecDeque<Result<Value, ToolError>>>,
        fallback: Value,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedTool {
        fn new(name: &'static str, fallback: Value) -> Self {
            Self {
                name,
                script: Mutex::new(VecDeque::new()),
                fallback,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn then(self, result: Result<Value, ToolError>) -> Self {
            self.script.lock().unwrap().push_back(result);
            self
        }

        fn calls(&self) -> Arc<AtomicUsize> {
            self.calls.clone()
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "scripted test tool"
        }

        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    /// 记录同时执行的最大数量
    struct GaugeTool {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for GaugeTool {
        fn name(&self) -> &str {
            "gauge"
        }

        fn description(&self) -> &str {
            "concurrency gauge"
        }

        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({"done": true}))
        }
    }

    fn dispatcher(
        registry: ToolRegistry,
        strategy: FixedPlanStrategy,
        config: OrchestratorConfig,
    ) -> TaskDispatcher {
        TaskDispatcher::builder(Arc::new(registry), Arc::new(strategy))
            .with_config(config)
            .build()
    }

    /// echo + sleep，再加上测试专用工具
    fn registry_with(extra: impl FnOnce(&mut ToolRegistry)) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SleepTool);
        extra(&mut registry);
        registry
    }

    fn step_changes(trace: &[RecordEntry], to: StepState) -> usize {
        trace
            .iter()
            .filter(|e| matches!(&e.event, RecordEvent::StepStateChanged { to: t, .. } if *t == to))
            .count()
    }

    fn terminals(trace: &[RecordEntry]) -> usize {
        trace
            .iter()
            .filter(|e| matches!(e.event, RecordEvent::SessionTerminal { .. }))
            .count()
    }

    fn state_of(outcome: &SessionOutcome, label: &str) -> StepState {
        outcome
            .state
            .plan
            .as_ref()
            .and_then(|p| p.step_by_label(label))
            .map(|s| s.state)
            .unwrap()
    }

    fn step_id(outcome: &SessionOutcome, label: &str) -> StepId {
        outcome
            .state
            .plan
            .as_ref()
            .and_then(|p| p.step_by_label(label))
            .map(|s| s.id().clone())
            .unwrap()
    }

    /// 终态计划全部落定，且回放结果与现场终态逐字节一致
    fn assert_replay_matches(dispatcher: &TaskDispatcher, outcome: &SessionOutcome) {
        assert!(outcome.state.plan.as_ref().unwrap().is_settled());
        let replayed = dispatcher.recorder().replay(&outcome.session_id).unwrap();
        assert_eq!(
            serde_json::to_vec(&replayed).unwrap(),
            serde_json::to_vec(&outcome.state).unwrap()
        );
    }

    #[tokio::test]
    async fn test_weather_scenario_completes() {
        let weather = ScriptedTool::new("weather", json!({"city": "Paris", "forecast": "sunny"}));
        let registry = registry_with(move |r| r.register(weather));
        let plan = vec![
            StepDraft::new("fetch", "weather")
                .goal("fetch the forecast")
                .param("city", "Paris"),
            StepDraft::new("summarize", "echo")
                .goal("summarize the forecast")
                .bind_field("text", "fetch", Some("forecast"))
                .expect(Postcondition::ResultContains("sunny".into())),
        ];
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(plan),
            OrchestratorConfig::default(),
        );

        let outcome = dispatcher
            .submit(Task::new("What is the weather in Paris?", ["weather", "echo"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.reason, None);
        assert_eq!(step_changes(&outcome.trace, StepState::Succeeded), 2);
        assert_eq!(terminals(&outcome.trace), 1);
        let summary = outcome
            .state
            .plan
            .as_ref()
            .and_then(|p| p.step_by_label("summarize"))
            .and_then(|s| s.output.clone());
        assert_eq!(summary, Some(json!("sunny")));

        // 已结束的会话通过回放提供 status
        let snapshot = dispatcher.status(&outcome.session_id).await.unwrap();
        assert_eq!(snapshot.state, outcome.state);
        assert_eq!(snapshot.tail.last(), outcome.trace.last());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_fatal_and_skips_dependents() {
        let registry = registry_with(|_| {});
        let plan = vec![
            StepDraft::new("s1", "sleep").param("millis", 120_000),
            StepDraft::new("s2", "echo").bind("text", "s1"),
        ];
        let dispatcher = TaskDispatcher::builder(Arc::new(registry), Arc::new(FixedPlanStrategy::new(plan)))
            .with_sandbox(SandboxSection {
                timeout_secs: 1,
                ..SandboxSection::default()
            })
            .build();

        let outcome = dispatcher
            .submit(Task::new("slow task", ["sleep", "echo"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.reason, Some(TerminalReason::ToolFatal));
        assert_eq!(
            outcome.reason.unwrap().to_string(),
            "ToolExecutionFailure:Fatal"
        );
        assert_eq!(state_of(&outcome, "s1"), StepState::Failed);
        assert_eq!(state_of(&outcome, "s2"), StepState::Skipped);
        assert_eq!(dispatcher.sandbox().stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_human_request_times_out() {
        let ask = ScriptedTool::new("ask", json!(null))
            .then(Err(ToolError::ambiguous("Which Paris do you mean?")));
        let registry = registry_with(move |r| r.register(ask));
        let plan = vec![
            StepDraft::new("clarify", "ask"),
            StepDraft::new("after", "echo").bind("text", "clarify"),
            StepDraft::new("independent", "echo").param("text", "still runs"),
        ];
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(plan),
            OrchestratorConfig::default(),
        );

        let started = tokio::time::Instant::now();
        let outcome = dispatcher
            .submit(Task::new("weather in Paris", ["ask", "echo"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.reason, Some(TerminalReason::HumanTimeout));
        assert_eq!(state_of(&outcome, "clarify"), StepState::Failed);
        assert_eq!(state_of(&outcome, "after"), StepState::Skipped);
        assert_eq!(state_of(&outcome, "independent"), StepState::Succeeded);

        let requested = outcome
            .trace
            .iter()
            .position(|e| matches!(e.event, RecordEvent::HumanRequested { .. }))
            .unwrap();
        let answered = outcome
            .trace
            .iter()
            .position(|e| {
                matches!(
                    &e.event,
                    RecordEvent::HumanAnswered { outcome, .. }
                        if *outcome == hive::human::HumanOutcome::TimedOut
                )
            })
            .unwrap();
        assert!(requested < answered);
        assert_replay_matches(&dispatcher, &outcome);

        // 超时后的迟到回答
        let request_id = outcome.state.human_requests.keys().next().cloned().unwrap();
        assert!(matches!(
            dispatcher.answer(&request_id, json!("the one in Texas")),
            Err(OrchestratorError::RequestClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_answered_human_request_completes_step() {
        let ask = ScriptedTool::new("ask", json!(null))
            .then(Err(ToolError::ambiguous("Celsius or Fahrenheit?")));
        let registry = registry_with(move |r| r.register(ask));
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(vec![StepDraft::new("clarify", "ask")]),
            OrchestratorConfig::default(),
        );

        let handle = dispatcher
            .submit(Task::new("temperature", ["ask"]))
            .unwrap();
        let session_id = handle.session_id().to_string();

        let request = loop {
            let pending = dispatcher.pending_requests(&session_id).unwrap();
            if let Some(request) = pending.into_iter().next() {
                break request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(request.question, "Celsius or Fahrenheit?");
        dispatcher
            .answer(&request.request_id, json!({"unit": "celsius"}))
            .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        let output = outcome
            .state
            .plan
            .as_ref()
            .and_then(|p| p.step_by_label("clarify"))
            .and_then(|s| s.output.clone())
            .unwrap();
        assert_eq!(output["human"]["unit"], "celsius");

        // 会话结束后再应答视为已关闭
        assert!(matches!(
            dispatcher.answer(&request.request_id, json!({"unit": "kelvin"})),
            Err(OrchestratorError::RequestClosed(_))
        ));
        assert!(matches!(
            dispatcher.answer("human_missing", json!({"unit": "kelvin"})),
            Err(OrchestratorError::UnknownRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_for_same_step_conflicts() {
        let gate = HumanInterventionGate::new();
        let step = StepId::new("step_clarify");
        let first = gate
            .request("sess_a", &step, String::from("first?"), Duration::from_secs(60))
            .unwrap();
        let second = gate.request("sess_a", &step, String::from("second?"), Duration::from_secs(60));
        assert!(matches!(second, Err(OrchestratorError::RequestConflict(_))));

        gate.answer(&first.request_id, json!("yes")).unwrap();
        assert!(matches!(
            gate.answer(&first.request_id, json!("again")),
            Err(OrchestratorError::RequestClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_launch_runs_nothing() {
        let registry = registry_with(|_| {});
        let plan = vec![
            StepDraft::new("a", "echo").param("text", 1),
            StepDraft::new("b", "echo").bind("text", "a"),
        ];
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(plan),
            OrchestratorConfig::default(),
        );

        let handle = dispatcher.submit(Task::new("count", ["echo"])).unwrap();
        dispatcher.cancel(handle.session_id()).unwrap();
        let session_id = handle.session_id().to_string();
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.status, SessionStatus::Aborted);
        assert_eq!(outcome.reason, Some(TerminalReason::Cancelled));
        assert_eq!(dispatcher.sandbox().stats().total, 0);
        assert_eq!(state_of(&outcome, "a"), StepState::Skipped);
        assert_eq!(state_of(&outcome, "b"), StepState::Skipped);

        // 终态会话上的取消是空操作；未知会话报错
        dispatcher.cancel(&session_id).unwrap();
        assert!(matches!(
            dispatcher.cancel("sess_missing"),
            Err(OrchestratorError::UnknownSession(_))
        ));
        assert!(matches!(
            dispatcher.status("sess_missing").await,
            Err(OrchestratorError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_withdraws_open_human_request() {
        let ask = ScriptedTool::new("ask", json!(null))
            .then(Err(ToolError::ambiguous("Proceed?")));
        let registry = registry_with(move |r| r.register(ask));
        let plan = vec![
            StepDraft::new("confirm", "ask"),
            StepDraft::new("act", "echo").bind("text", "confirm"),
        ];
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(plan),
            OrchestratorConfig::default(),
        );

        let handle = dispatcher
            .submit(Task::new("confirm then act", ["ask", "echo"]))
            .unwrap();
        let session_id = handle.session_id().to_string();
        while dispatcher.pending_requests(&session_id).unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        dispatcher.cancel(&session_id).unwrap();
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.status, SessionStatus::Aborted);
        assert_eq!(state_of(&outcome, "confirm"), StepState::Skipped);
        assert_eq!(state_of(&outcome, "act"), StepState::Skipped);
        assert_eq!(dispatcher.sandbox().stats().total, 1);
        let withdrawn = outcome.state.human_requests.values().all(|r| {
            r.outcome == hive::human::HumanOutcome::Withdrawn
        });
        assert!(withdrawn);
        assert_replay_matches(&dispatcher, &outcome);
    }

    #[tokio::test]
    async fn test_succeeded_steps_survive_refinement() {
        let fetch = ScriptedTool::new("fetch", json!({"body": "data"}));
        let fetch_calls = fetch.calls();
        let parse = ScriptedTool::new("parse", json!({"parsed": true}))
            .then(Err(ToolError::replannable("unexpected format")));
        let parse_calls = parse.calls();
        let registry = registry_with(move |r| {
            r.register(fetch);
            r.register(parse);
        });
        let plan = vec![
            StepDraft::new("fetch", "fetch"),
            StepDraft::new("parse", "parse").bind("input", "fetch"),
        ];
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(plan),
            OrchestratorConfig::default(),
        );

        let outcome = dispatcher
            .submit(Task::new("fetch and parse", ["fetch", "parse"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.state.revision(), Some(1));
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(parse_calls.load(Ordering::SeqCst), 2);

        let fetch_id = step_id(&outcome, "fetch");
        let runs = outcome
            .trace
            .iter()
            .filter(|e| {
                matches!(
                    &e.event,
                    RecordEvent::StepStateChanged { step_id, to: StepState::Running, .. }
                        if *step_id == fetch_id
                )
            })
            .count();
        assert_eq!(runs, 1);
        assert_replay_matches(&dispatcher, &outcome);
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried_in_place() {
        let flaky = ScriptedTool::new("flaky", json!({"ok": true}))
            .then(Err(ToolError::retryable("rate limited")))
            .then(Err(ToolError::retryable("rate limited")));
        let registry = registry_with(move |r| r.register(flaky));
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(vec![StepDraft::new("call", "flaky")]),
            OrchestratorConfig::default(),
        );

        let outcome = dispatcher
            .submit(Task::new("call flaky api", ["flaky"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.state.revision(), Some(0));
        let step = outcome
            .state
            .plan
            .as_ref()
            .and_then(|p| p.step_by_label("call"))
            .unwrap();
        assert_eq!(step.attempts, 3);
        assert_eq!(step_changes(&outcome.trace, StepState::Failed), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_until_refinement_budget() {
        let registry = registry_with(|r| r.register(AlwaysFails("broken")));
        let config = OrchestratorConfig {
            max_retries: 1,
            max_refinements: 1,
            ..OrchestratorConfig::default()
        };
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(vec![StepDraft::new("call", "broken")]),
            config,
        );

        let outcome = dispatcher
            .submit(Task::new("call broken api", ["broken"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.reason, Some(TerminalReason::PlanningExhausted));
        // 两个修订各执行 max_retries + 1 次
        assert_eq!(dispatcher.sandbox().stats().total, 4);
    }

    struct AlwaysFails(&'static str);

    #[async_trait]
    impl Tool for AlwaysFails {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "always fails with a retryable error"
        }

        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            Err(ToolError::retryable("service unavailable"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let gauge = GaugeTool {
            current: current.clone(),
            peak: peak.clone(),
        };
        let registry = registry_with(move |r| r.register(gauge));
        let plan = (0..6)
            .map(|i| StepDraft::new(format!("p{i}"), "gauge").param("n", i))
            .collect();
        let config = OrchestratorConfig {
            max_parallelism: 2,
            ..OrchestratorConfig::default()
        };
        let dispatcher = dispatcher(registry, FixedPlanStrategy::new(plan), config);

        let outcome = dispatcher
            .submit(Task::new("gauge concurrency", ["gauge"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_postcondition_violation_triggers_refinement() {
        let forecast = ScriptedTool::new("forecast", json!("sunny and warm"))
            .then(Ok(json!("")));
        let registry = registry_with(move |r| r.register(forecast));
        let plan = vec![StepDraft::new("forecast", "forecast").expect(Postcondition::NonEmpty)];
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(plan),
            OrchestratorConfig::default(),
        );

        let outcome = dispatcher
            .submit(Task::new("forecast", ["forecast"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.state.revisions.len(), 2);
        assert!(outcome.state.revisions[1]
            .reason
            .as_deref()
            .unwrap()
            .contains("postcondition"));
    }

    #[tokio::test]
    async fn test_invalid_tasks_are_rejected() {
        let dispatcher = dispatcher(
            registry_with(|_| {}),
            FixedPlanStrategy::new(vec![StepDraft::new("a", "echo").param("text", 1)]),
            OrchestratorConfig::default(),
        );

        assert!(matches!(
            dispatcher.submit(Task::new("  ", ["echo"])),
            Err(OrchestratorError::InvalidTask(_))
        ));
        assert!(matches!(
            dispatcher.submit(Task::new("run shell", ["shell"])),
            Err(OrchestratorError::InvalidTask(_))
        ));
        let past = chrono::Utc::now() - chrono::Duration::seconds(5);
        assert!(matches!(
            dispatcher.submit(Task::new("late", ["echo"]).with_deadline(past)),
            Err(OrchestratorError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn test_disallowed_tool_fails_planning() {
        let dispatcher = dispatcher(
            registry_with(|_| {}),
            FixedPlanStrategy::new(vec![StepDraft::new("nap", "sleep").param("millis", 1)]),
            OrchestratorConfig::default(),
        );

        let outcome = dispatcher
            .submit(Task::new("echo only", ["echo"]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.reason, Some(TerminalReason::PlanningFailure));
        assert!(outcome.state.plan.is_none());
        assert_eq!(dispatcher.sandbox().stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_new_launches() {
        let registry = registry_with(|_| {});
        let plan = vec![
            StepDraft::new("nap", "sleep").param("millis", 5_000),
            StepDraft::new("after", "echo").bind("text", "nap"),
        ];
        let dispatcher = dispatcher(
            registry,
            FixedPlanStrategy::new(plan),
            OrchestratorConfig::default(),
        );
        let deadline = chrono::Utc::now() + chrono::Duration::seconds(2);

        let outcome = dispatcher
            .submit(Task::new("nap then echo", ["sleep", "echo"]).with_deadline(deadline))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.reason, Some(TerminalReason::DeadlineExceeded));
        // 在途步骤自然结束，后续步骤不再派发
        assert_eq!(state_of(&outcome, "nap"), StepState::Succeeded);
        assert_eq!(state_of(&outcome, "after"), StepState::Skipped);
        assert_replay_matches(&dispatcher, &outcome);
    }
}
