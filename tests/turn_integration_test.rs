//! 回合管线集成测试：回退、记忆否决、指代消解、超大输出转存与跨会话持久化

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bee_core::config::{AppConfig, GraphSection};
    use bee_core::core::CallBudget;
    use bee_core::llm::MockLlmClient;
    use bee_core::memory::{ActionTag, GraphStore, MemoryGraph, MemoryPolicy, SharedGraph};
    use bee_core::react::{LlmPlanner, TurnPipeline, TurnStatus};
    use bee_core::tools::{EchoTool, InMemoryEphemeralStore, QueryEphemeralTool, Tool, ToolRegistry};
    use serde_json::{json, Value};

    struct FakeSpotify;

    #[async_trait]
    impl Tool for FakeSpotify {
        fn name(&self) -> &str {
            "spotify_control"
        }
        fn description(&self) -> &str {
            "Control Spotify playback"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("Track not found on Spotify".to_string())
        }
    }

    struct FakeYoutube;

    #[async_trait]
    impl Tool for FakeYoutube {
        fn name(&self) -> &str {
            "play_youtube"
        }
        fn description(&self) -> &str {
            "Play a video on YouTube"
        }
        async fn execute(&self, args: Value) -> Result<String, String> {
            let topic = args.get("topic").and_then(|v| v.as_str()).unwrap_or("?");
            Ok(format!("Playing '{topic}' on YouTube"))
        }
    }

    struct BigPage;

    #[async_trait]
    impl Tool for BigPage {
        fn name(&self) -> &str {
            "fetch_page"
        }
        fn description(&self) -> &str {
            "Fetch a long page"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            let mut paras: Vec<String> = (0..40)
                .map(|i| format!("Section {i} describes the garden layout and soil {}", "text ".repeat(20)))
                .collect();
            paras.push("The opening ceremony starts at nine sharp.".to_string());
            Ok(paras.join("\n\n"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(FakeSpotify);
        reg.register(FakeYoutube);
        reg.register(BigPage);
        reg
    }

    fn pipeline(
        plans: &[&str],
        verifier: Arc<MockLlmClient>,
        graph: SharedGraph,
        ephemeral: Option<Arc<InMemoryEphemeralStore>>,
    ) -> (TurnPipeline, Arc<MockLlmClient>) {
        let reg = registry();
        let planner_llm = Arc::new(MockLlmClient::with_responses(plans.iter().copied()));
        let planner = Arc::new(LlmPlanner::new(planner_llm.clone(), &reg.to_schema_json()));
        let ephemeral = ephemeral.map(|s| s as Arc<dyn bee_core::tools::EphemeralStore>);
        let p = TurnPipeline::from_config(&AppConfig::default(), planner, reg, verifier, graph, ephemeral);
        (p, planner_llm)
    }

    fn fresh_graph() -> SharedGraph {
        SharedGraph::in_memory(MemoryGraph::new("Ada Lovelace", MemoryPolicy::default()))
    }

    #[tokio::test]
    async fn test_fallback_turn_then_play_it_again() {
        let plan = r#"{"plan": [{"id": 1, "tool": "spotify_control", "args": {"action": "play", "song_name": "Numb"}}]}"#;
        let (p, _) = pipeline(&[plan], Arc::new(MockLlmClient::new()), fresh_graph(), None);
        let mut budget = CallBudget::new(8);

        let out = p.run_turn("play numb", &mut budget, None).await.unwrap();
        assert_eq!(out.status, TurnStatus::Passed);
        let exec = out.execution.unwrap();
        assert!(exec.steps[0].fallback_used);
        assert!(exec.outputs.contains("[Fallback: play_youtube] Playing 'Numb' on YouTube"));

        let graph = p.graph().read().await;
        let resolution = graph.resolve_reference("play it again");
        assert_eq!(resolution.action_tag, Some(ActionTag::Repeat));
        assert!(resolution.confidence >= 0.9);
        let (tool, args) = resolution.reinvocation().unwrap();
        assert_eq!(tool, "play_youtube");
        assert_eq!(args, json!({"topic": "Numb"}));
    }

    #[tokio::test]
    async fn test_self_search_vetoed_then_replanned() {
        let search = r#"{"plan": [{"id": 1, "tool": "web_search", "args": {"query": "tell me about Ada Lovelace"}}]}"#;
        let echo = r#"{"plan": [{"id": 1, "tool": "echo", "args": {"text": "You are Ada, you like music."}}]}"#;
        let verifier = Arc::new(MockLlmClient::new());
        let (p, planner_llm) = pipeline(&[search, echo], verifier.clone(), fresh_graph(), None);
        let mut budget = CallBudget::new(8);

        let out = p.run_turn("tell me about Ada Lovelace", &mut budget, None).await.unwrap();
        assert_eq!(out.status, TurnStatus::Passed);
        assert_eq!(out.attempts, 2);
        assert_eq!(out.budget.retries, 1);
        assert_eq!(planner_llm.call_count(), 2);
        assert_eq!(verifier.call_count(), 1);
        assert!(planner_llm.last_messages()[0]
            .content
            .contains("appears to be about the user"));
        // 被否决的计划从未执行
        assert_eq!(p.graph().read().await.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_large_output_diverted_and_queryable() {
        let plan = r#"{"plan": [{"id": 1, "tool": "fetch_page", "args": {"url": "https://example.org"}}]}"#;
        let store = Arc::new(InMemoryEphemeralStore::new());
        let (p, _) = pipeline(&[plan], Arc::new(MockLlmClient::new()), fresh_graph(), Some(store.clone()));
        let mut budget = CallBudget::new(8);

        let out = p.run_turn("what's on that page", &mut budget, None).await.unwrap();
        let exec = out.execution.unwrap();
        let id = exec.steps[0].ephemeral_id.clone().unwrap();
        assert!(exec.outputs.contains(&id));
        assert!(exec.outputs.len() < 2000);

        let tool = QueryEphemeralTool::new(store);
        let hit = tool
            .execute(json!({"ephemeral_id": id, "query": "when does the opening ceremony start"}))
            .await
            .unwrap();
        assert!(hit.contains("nine sharp"));
    }

    #[tokio::test]
    async fn test_graph_survives_session_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world_graph.json");
        let cfg = GraphSection {
            user_name: "Ada".to_string(),
            ..GraphSection::default()
        };
        let plan = r#"{"plan": [{"id": 1, "tool": "echo", "args": {"text": "Reminder set for 5pm"}}]}"#;

        {
            let graph = SharedGraph::open(GraphStore::new(&path), &cfg).unwrap();
            let (p, _) = pipeline(&[plan], Arc::new(MockLlmClient::new()), graph, None);
            let mut budget = CallBudget::new(8);
            let out = p.run_turn("remind me at 5", &mut budget, None).await.unwrap();
            assert_eq!(out.status, TurnStatus::Passed);
            p.graph().save().await.unwrap();
        }

        let reopened = SharedGraph::open(GraphStore::new(&path), &cfg).unwrap();
        let graph = reopened.read().await;
        assert_eq!(graph.current_turn(), 1);
        assert_eq!(graph.actions().len(), 1);
        assert_eq!(graph.actions()[0].tool, "echo");
        assert_eq!(graph.user().name, "Ada");
    }

    #[tokio::test]
    async fn test_hard_limit_four_blocks_fifth_call() {
        let mut budget = CallBudget::new(4);
        for _ in 0..4 {
            budget.record_call("planning").unwrap();
        }
        assert!(budget.record_call("verifying").is_err());
        assert_eq!(budget.call_count(), 4);
        budget.reset();
        assert!(budget.record_call("planning").is_ok());
    }
}
