//! 会话编排集成测试：修订号协议、quit 抢占、失败上报、日志重放与恢复

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::mpsc;

use rag0::ask::{AskAnswer, AskEvent, AskOutcome, AskPhase, AskRequest};
use rag0::cli::{wait_for_prompt, wait_for_result};
use rag0::config::AppConfig;
use rag0::core::commands::parse_command;
use rag0::core::{
    ActivityError, EventJournal, MemoryJournal, Orchestrator, ResultStatus, SessionError, SessionEvent, SessionExit,
    SessionOptions, SessionState, SqliteJournal,
};
use rag0::index::{IndexStats, VectorStore};
use rag0::ingest::{fingerprint, IngestReport, IngestRequest};
use rag0::llm::{LlmClient, MockLlmClient};
use rag0::workflow::{ChildWorkflows, WorkflowHost};

/// 可编排的子执行：ask 可挂起，ingest 固定失败，记录收到的 child_id
#[derive(Default)]
struct ScriptedChildren {
    hang_ask: bool,
    launched: Mutex<Vec<String>>,
}

impl ScriptedChildren {
    fn hanging() -> Self {
        Self {
            hang_ask: true,
            ..Self::default()
        }
    }

    fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChildWorkflows for ScriptedChildren {
    async fn ingest(&self, child_id: &str, request: IngestRequest) -> Result<IngestReport, ActivityError> {
        self.launched.lock().unwrap().push(child_id.to_string());
        Err(ActivityError::Rejected(format!(
            "document not found: {}",
            request.payload_reference
        )))
    }

    async fn ask(
        &self,
        child_id: &str,
        request: AskRequest,
        events: Option<mpsc::UnboundedSender<AskEvent>>,
    ) -> Result<AskAnswer, ActivityError> {
        self.launched.lock().unwrap().push(child_id.to_string());
        if let Some(tx) = &events {
            let _ = tx.send(AskEvent::Step {
                step: 1,
                state: AskPhase::Retrieve,
                query: request.question.clone(),
                detail: "0 new chunk(s), 0 retrieved in total".into(),
            });
        }
        if self.hang_ask {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(AskAnswer {
            answer: format!("answer to {}", request.question),
            citations: Vec::new(),
            reasoning_trace: Vec::new(),
            reflections_done: 0,
            outcome: AskOutcome::Satisfied,
        })
    }

    async fn stats(&self) -> Result<IndexStats, ActivityError> {
        Ok(IndexStats::default())
    }
}

fn orchestrator(journal: Arc<dyn EventJournal>, children: Arc<dyn ChildWorkflows>) -> Orchestrator {
    Orchestrator::new(journal, children, SessionOptions::default())
}

async fn wait_for_progress(handle: &rag0::SessionHandle) {
    for _ in 0..200 {
        if !handle.get_progress().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no progress reported");
}

#[tokio::test]
async fn test_initial_prompt_is_revision_one() {
    let orch = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(ScriptedChildren::default()));
    let handle = orch.start().unwrap();

    let prompt = handle.get_next_prompt(0).unwrap();
    assert_eq!(prompt.revision, 1);
    assert!(prompt.prompt.contains("/ingest <path-to-document>"));
    assert!(handle.get_next_prompt(1).is_none());
    assert!(handle.get_last_result(0).is_none());
    assert!(!handle.is_closed());
}

#[tokio::test]
async fn test_empty_input_refreshes_prompt_only() {
    let orch = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(ScriptedChildren::default()));
    let handle = orch.start().unwrap();
    let first = handle.get_next_prompt(0).unwrap();

    assert!(handle.submit_input("   "));
    let second = wait_for_prompt(&handle, 1).await.unwrap();
    assert_eq!(second.revision, 2);
    assert_eq!(second.prompt, first.prompt);
    assert!(handle.get_last_result(0).is_none());
}

#[tokio::test]
async fn test_parse_error_and_unknown_command_are_error_results() {
    let orch = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(ScriptedChildren::default()));
    let handle = orch.start().unwrap();

    handle.submit_input("/ingest");
    let result = wait_for_result(&handle, 0).await.unwrap();
    assert_eq!(result.revision, 1);
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(result.command, "parse");
    assert!(result.payload.contains("/ingest <path-to-document>"));

    handle.submit_input("/frobnicate now");
    let result = wait_for_result(&handle, 1).await.unwrap();
    assert_eq!(result.revision, 2);
    assert_eq!(result.command, "unknown");
    assert_eq!(result.payload, "Unknown command: frobnicate");

    // 每个结果之后刷新一次菜单
    let prompt = wait_for_prompt(&handle, 2).await.unwrap();
    assert_eq!(prompt.revision, 3);
}

#[tokio::test]
async fn test_stats_is_local_activity() {
    let children = Arc::new(ScriptedChildren::default());
    let orch = orchestrator(Arc::new(MemoryJournal::new()), children.clone());
    let handle = orch.start().unwrap();

    handle.submit_input("stats");
    let result = wait_for_result(&handle, 0).await.unwrap();
    assert_eq!(result.status, ResultStatus::Ok);
    assert_eq!(result.command, "stats");
    assert!(result.payload.contains("Documents: 0"));
    assert!(children.launched().is_empty());
}

#[tokio::test]
async fn test_quit_while_ask_in_flight_discards_child() {
    let journal = Arc::new(MemoryJournal::new());
    let children = Arc::new(ScriptedChildren::hanging());
    let orch = orchestrator(journal.clone(), children.clone());
    let handle = orch.start().unwrap();
    let id = handle.id().to_string();

    handle.submit_input("/ask What is the refund window?");
    wait_for_progress(&handle).await;
    assert_eq!(children.launched().len(), 1);

    handle.submit_input("/stats");
    handle.submit_input("/quit");
    let result = wait_for_result(&handle, 0).await.unwrap();
    assert_eq!(result.revision, 1);
    assert_eq!(result.status, ResultStatus::Quit);
    assert_eq!(result.payload, "Goodbye.");
    assert!(handle.is_closed());
    assert!(handle.get_progress().is_empty());

    let exit = handle.finished().await.unwrap();
    assert!(matches!(exit, SessionExit::Closed(Some(r)) if r.status == ResultStatus::Quit));

    let kinds: Vec<&str> = journal.load(&id).unwrap().iter().map(|e| e.kind()).collect();
    assert_eq!(
        &kinds[kinds.len() - 3..],
        ["input_signalled", "child_abandoned", "result_recorded"]
    );
    // 排在 quit 前面的 /stats 不会被执行
    assert!(!kinds[..kinds.len() - 3].contains(&"result_recorded"));
}

#[tokio::test]
async fn test_child_failure_is_reported_as_error_result() {
    let orch = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(ScriptedChildren::default()));
    let handle = orch.start().unwrap();

    handle.submit_input("/ingest /missing/policy.md");
    let result = wait_for_result(&handle, 0).await.unwrap();
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(result.command, "ingest");
    assert!(result.payload.contains("document not found: /missing/policy.md"));

    // 失败不影响会话继续
    handle.submit_input("/ask anything");
    let result = wait_for_result(&handle, 1).await.unwrap();
    assert_eq!(result.status, ResultStatus::Ok);
    assert_eq!(result.command, "ask");
}

#[tokio::test]
async fn test_commands_are_processed_in_arrival_order() {
    let orch = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(ScriptedChildren::default()));
    let handle = orch.start().unwrap();

    handle.submit_input("/ask first");
    handle.submit_input("/stats");
    handle.submit_input("/ask second");

    let mut commands = Vec::new();
    for after in 0..3 {
        let result = wait_for_result(&handle, after).await.unwrap();
        assert_eq!(result.revision, after + 1);
        commands.push((result.command.clone(), result.payload.clone()));
    }
    assert_eq!(commands[0].0, "ask");
    assert!(commands[0].1.contains("answer to first"));
    assert_eq!(commands[1].0, "stats");
    assert_eq!(commands[2].0, "ask");
    assert!(commands[2].1.contains("answer to second"));
}

#[tokio::test]
async fn test_results_finished_between_polls_are_not_skipped() {
    let orch = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(ScriptedChildren::default()));
    let handle = orch.start().unwrap();

    handle.submit_input("/stats");
    handle.submit_input("/bogus");
    handle.submit_input("/ask late");
    // 三条输入全部处理完才开始读结果
    wait_for_prompt(&handle, 3).await.unwrap();
    assert_eq!(handle.latest_result().unwrap().revision, 3);

    let commands: Vec<(u64, String)> = (0..3)
        .map(|after| {
            let r = handle.get_last_result(after).unwrap();
            (r.revision, r.command)
        })
        .collect();
    assert_eq!(
        commands,
        vec![(1, "stats".to_string()), (2, "unknown".to_string()), (3, "ask".to_string())]
    );
    assert!(handle.get_last_result(3).is_none());
}

#[tokio::test]
async fn test_resume_replays_without_duplicate_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.db");
    let children: Arc<dyn ChildWorkflows> = Arc::new(ScriptedChildren::default());

    let id = {
        let journal: Arc<dyn EventJournal> = Arc::new(SqliteJournal::open(&path).unwrap());
        let handle = orchestrator(journal, children.clone()).start().unwrap();
        handle.submit_input("/stats");
        wait_for_result(&handle, 0).await.unwrap();
        wait_for_prompt(&handle, 1).await.unwrap();
        let id = handle.id().to_string();
        handle.detach();
        assert_eq!(handle.finished().await.unwrap(), SessionExit::Detached);
        id
    };

    let journal: Arc<dyn EventJournal> = Arc::new(SqliteJournal::open(&path).unwrap());
    let before = journal.load(&id).unwrap();
    let replayed = SessionState::replay(&before).unwrap();
    assert_eq!(replayed.prompt.revision, 2);
    assert_eq!(replayed.last_result.as_ref().unwrap().revision, 1);

    let handle = orchestrator(journal.clone(), children).resume(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.get_next_prompt(0).unwrap().revision, 2);
    assert!(handle.get_next_prompt(2).is_none());
    assert_eq!(handle.get_last_result(0).unwrap().revision, 1);
    assert_eq!(journal.load(&id).unwrap().len(), before.len());

    handle.submit_input("/quit");
    let result = wait_for_result(&handle, 1).await.unwrap();
    assert_eq!(result.revision, 2);
    assert_eq!(result.status, ResultStatus::Quit);
}

#[tokio::test]
async fn test_resume_relaunches_pending_child() {
    let journal = Arc::new(MemoryJournal::new());
    let events = vec![
        SessionEvent::Started {
            started_at: "2026-01-01T00:00:00Z".into(),
        },
        SessionEvent::PromptRendered {
            prompt: rag0::core::render_menu(),
        },
        SessionEvent::InputSignalled {
            raw: "/ask pending question".into(),
        },
        SessionEvent::InputDequeued,
        SessionEvent::ChildStarted {
            child_id: "s1-ask-4".into(),
            request: parse_command("/ask pending question").unwrap(),
        },
    ];
    for event in &events {
        journal.append("s1", event).unwrap();
    }

    let children = Arc::new(ScriptedChildren::default());
    let handle = orchestrator(journal, children.clone()).resume("s1").unwrap();
    let result = wait_for_result(&handle, 0).await.unwrap();
    assert_eq!(result.status, ResultStatus::Ok);
    assert!(result.payload.contains("answer to pending question"));
    assert_eq!(children.launched(), vec!["s1-ask-4".to_string()]);
    assert_eq!(wait_for_prompt(&handle, 1).await.unwrap().revision, 2);
}

#[tokio::test]
async fn test_resume_pending_quit_abandons_child() {
    let journal = Arc::new(MemoryJournal::new());
    let events = vec![
        SessionEvent::Started {
            started_at: "2026-01-01T00:00:00Z".into(),
        },
        SessionEvent::PromptRendered {
            prompt: rag0::core::render_menu(),
        },
        SessionEvent::InputSignalled { raw: "/ask q".into() },
        SessionEvent::InputDequeued,
        SessionEvent::ChildStarted {
            child_id: "s2-ask-4".into(),
            request: parse_command("/ask q").unwrap(),
        },
        SessionEvent::InputSignalled { raw: "/quit".into() },
    ];
    for event in &events {
        journal.append("s2", event).unwrap();
    }

    let children = Arc::new(ScriptedChildren::hanging());
    let handle = orchestrator(journal, children.clone()).resume("s2").unwrap();
    let exit = handle.finished().await.unwrap();
    assert!(matches!(exit, SessionExit::Closed(Some(r)) if r.payload == "Goodbye."));
    assert!(children.launched().is_empty());
}

#[tokio::test]
async fn test_resume_unknown_session_is_not_found() {
    let orch = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(ScriptedChildren::default()));
    assert!(matches!(orch.resume("nope"), Err(SessionError::NotFound(id)) if id == "nope"));
}

#[tokio::test]
async fn test_ingest_then_ask_uses_start_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("refunds.md");
    let content = "Refunds are accepted within 30 days of delivery.";
    std::fs::write(&doc, content).unwrap();

    let mut cfg = AppConfig::default();
    cfg.app.parsed_dir = dir.path().join("parsed");
    let store = Arc::new(VectorStore::open_in_memory(None).unwrap());
    let before = store.retriever().unwrap();
    let host = WorkflowHost::from_config(
        &cfg,
        store.clone(),
        Some(Arc::new(MockLlmClient) as Arc<dyn LlmClient>),
    );
    let handle = orchestrator(Arc::new(MemoryJournal::new()), Arc::new(host))
        .start()
        .unwrap();

    handle.submit_input(format!("/ingest {}", doc.display()));
    handle.submit_input("/ask How many days do refunds take?");

    let ingested = wait_for_result(&handle, 0).await.unwrap();
    assert_eq!(ingested.status, ResultStatus::Ok);
    assert!(ingested.payload.contains("Chunks: 1"));
    let answered = wait_for_result(&handle, 1).await.unwrap();
    assert_eq!(answered.status, ResultStatus::Ok);
    assert!(answered.payload.contains("30 days"));

    // 导入之前取得的快照看不到新文档
    let fp = fingerprint(content.as_bytes());
    assert!(!before.snapshot().contains(&fp));
    assert!(store.snapshot().unwrap().contains(&fp));
}

fn scripted_input() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just(""),
        Just("   "),
        Just("/stats"),
        Just("/ingest"),
        Just("/bogus"),
        Just("/ingest \"unbalanced"),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_revisions_advance_by_one(inputs in prop::collection::vec(scripted_input(), 0..12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let orch = orchestrator(journal.clone(), Arc::new(ScriptedChildren::default()));

        let exit = rt.block_on(async {
            let handle = orch.start().unwrap();
            for raw in &inputs {
                handle.submit_input(*raw);
            }
            handle.submit_input("/quit");
            let id = handle.id().to_string();
            (id, handle.finished().await.unwrap())
        });
        let (id, exit) = exit;
        prop_assert!(matches!(exit, SessionExit::Closed(_)));

        let events = journal.load(&id).unwrap();
        let mut state = SessionState::default();
        let mut prompt_rev = 0;
        let mut result_rev = 0;
        for event in &events {
            state.apply(event).unwrap();
            if state.prompt.revision != prompt_rev {
                prop_assert_eq!(state.prompt.revision, prompt_rev + 1);
                prompt_rev = state.prompt.revision;
            }
            let current = state.last_result.as_ref().map_or(0, |r| r.revision);
            if current != result_rev {
                prop_assert_eq!(current, result_rev + 1);
                result_rev = current;
            }
        }

        let non_empty = inputs.iter().filter(|raw| !raw.trim().is_empty()).count() as u64;
        prop_assert_eq!(prompt_rev, 1 + inputs.len() as u64);
        prop_assert_eq!(result_rev, non_empty + 1);
    }
}
