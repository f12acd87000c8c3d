//! End-to-end tests driving the full runtime: queue, planner, executor,
//! router, and monitor wired together with scripted capability handlers
//! standing in for a model provider.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::capability::{
    CapabilityBinding, CapabilityConfig, CapabilityError, CapabilityHandler,
};
use crate::context_chain::ContextChain;
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorSink};
use crate::plugin::{ActionDescriptor, Plugin, PluginError};
use crate::queue::QueueConfig;
use crate::runtime::MaestroRuntime;
use crate::types::{
    ContextItem, Event, ItemBody, PlatformMetadata, ResponseHandler, RunOutcome, RunStatus,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Planning capability scripted per request shape: plan requests pop from
/// one queue, replan requests from another. Missing script entries fall back
/// to "empty plan" / "continue".
struct ScriptedPlanner {
    plans: Mutex<VecDeque<JsonValue>>,
    replans: Mutex<VecDeque<JsonValue>>,
    plan_calls: AtomicUsize,
    replan_calls: AtomicUsize,
}

impl ScriptedPlanner {
    fn new(plans: Vec<JsonValue>, replans: Vec<JsonValue>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into()),
            replans: Mutex::new(replans.into()),
            plan_calls: AtomicUsize::new(0),
            replan_calls: AtomicUsize::new(0),
        })
    }

    /// Same fixed plan for every request; replans always continue.
    fn fixed(plan: JsonValue) -> Arc<FixedPlanner> {
        Arc::new(FixedPlanner { plan })
    }
}

#[async_trait]
impl CapabilityHandler for ScriptedPlanner {
    async fn execute(
        &self,
        input: JsonValue,
        _config: &CapabilityConfig,
    ) -> Result<JsonValue, CapabilityError> {
        match input["schema"]["title"].as_str() {
            Some("pipeline_plan") => {
                self.plan_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self
                    .plans
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| json!({ "steps": [] })))
            }
            Some("replan_decision") => {
                self.replan_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self
                    .replans
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| json!({ "revise": false })))
            }
            other => Err(CapabilityError::handler(
                "planning",
                format!("unexpected request shape: {:?}", other),
            )),
        }
    }
}

struct FixedPlanner {
    plan: JsonValue,
}

#[async_trait]
impl CapabilityHandler for FixedPlanner {
    async fn execute(
        &self,
        input: JsonValue,
        _config: &CapabilityConfig,
    ) -> Result<JsonValue, CapabilityError> {
        match input["schema"]["title"].as_str() {
            Some("pipeline_plan") => Ok(self.plan.clone()),
            _ => Ok(json!({ "revise": false })),
        }
    }
}

/// Plugin with a succeeding and a failing action, logging executions.
struct TestPlugin {
    executed: Arc<Mutex<Vec<String>>>,
}

impl TestPlugin {
    fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let executed = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                executed: executed.clone(),
            }),
            executed,
        )
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn id(&self) -> &str {
        "p-test"
    }

    fn actions(&self) -> Vec<ActionDescriptor> {
        vec![
            ActionDescriptor::new("reply", "append a reply").with_effect("sends_reply"),
            ActionDescriptor::new("fail", "always fails"),
        ]
    }

    async fn execute(
        &self,
        action: &str,
        _chain: &ContextChain,
    ) -> Result<Vec<ContextItem>, PluginError> {
        self.executed.lock().unwrap().push(action.to_string());
        match action {
            "reply" => Ok(vec![ContextItem::new(
                "p-test",
                "reply",
                ItemBody::StepOutput {
                    content: json!({ "text": "done" }),
                },
            )]),
            "fail" => Err(anyhow::anyhow!("simulated handler failure").into()),
            other => Err(anyhow::anyhow!("unknown action {other}").into()),
        }
    }
}

/// Records one execution window per run for concurrency assertions.
#[derive(Debug, Clone)]
struct WorkRecord {
    event_id: String,
    start: Instant,
    end: Instant,
}

struct WorkPlugin {
    records: Arc<Mutex<Vec<WorkRecord>>>,
    delay: Duration,
}

#[async_trait]
impl Plugin for WorkPlugin {
    fn id(&self) -> &str {
        "p-work"
    }

    fn actions(&self) -> Vec<ActionDescriptor> {
        vec![ActionDescriptor::new("work", "do slow work")]
    }

    async fn execute(
        &self,
        _action: &str,
        chain: &ContextChain,
    ) -> Result<Vec<ContextItem>, PluginError> {
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.records.lock().unwrap().push(WorkRecord {
            event_id: chain.event_id().to_string(),
            start,
            end: Instant::now(),
        });
        Ok(vec![ContextItem::new(
            "p-work",
            "work",
            ItemBody::StepOutput {
                content: json!({ "worked": true }),
            },
        )])
    }
}

/// Response handler capturing the outcome and counting invocations.
struct Responder {
    calls: AtomicUsize,
    captured: Mutex<Option<(RunStatus, Vec<ContextItem>)>>,
    notify: Notify,
}

impl Responder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            captured: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    async fn wait(&self) -> (RunStatus, Vec<ContextItem>) {
        timeout(Duration::from_secs(5), self.notify.notified())
            .await
            .expect("run did not terminate in time");
        self.captured.lock().unwrap().clone().expect("no outcome captured")
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseHandler for Responder {
    async fn on_complete(&self, outcome: &RunOutcome) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.captured.lock().unwrap() =
            Some((outcome.status.clone(), outcome.chain.items().to_vec()));
        self.notify.notify_one();
    }
}

struct RecordingSink {
    kinds: Arc<Mutex<Vec<MonitorEventKind>>>,
}

#[async_trait]
impl MonitorSink for RecordingSink {
    async fn on_event(&self, event: &MonitorEvent) -> anyhow::Result<()> {
        self.kinds.lock().unwrap().push(event.kind);
        Ok(())
    }
}

fn user_event(id: &str, responder: &Arc<Responder>) -> Event {
    Event::new(id, "p-text", "receive", "user_input", "hello")
        .with_user("alice")
        .with_platform(PlatformMetadata::new("cli"))
        .with_response_handler(responder.clone())
}

fn step(plugin_id: &str, action: &str) -> JsonValue {
    json!({ "plugin_id": plugin_id, "action": action })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_fails_without_planning_capability() {
    let (plugin, _) = TestPlugin::new();
    let runtime = MaestroRuntime::builder()
        .with_plugin(plugin)
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    let event = Event::new("e1", "p-text", "receive", "user_input", "hello")
        .with_timestamp(1000)
        .with_response_handler(responder.clone());
    runtime.submit(event).unwrap();

    let (status, items) = responder.wait().await;
    assert!(matches!(status, RunStatus::Failure { .. }));
    assert_eq!(responder.call_count(), 1);
    // Seed plus one planning-error item.
    assert_eq!(items.len(), 2);
    match &items[1].body {
        ItemBody::StepError { detail, .. } => {
            assert!(detail.contains("planning"), "unexpected detail: {detail}")
        }
        other => panic!("expected step_error item, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_step_plan_succeeds_with_three_item_chain() {
    let (plugin, executed) = TestPlugin::new();
    let planner = ScriptedPlanner::new(
        vec![json!({ "steps": [step("p-test", "reply"), step("p-test", "reply")] })],
        vec![json!({ "revise": false })],
    );
    let runtime = MaestroRuntime::builder()
        .with_plugin(plugin)
        .with_capability(CapabilityBinding::new(
            "planning",
            "scripted planner",
            planner.clone(),
        ))
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    runtime.submit(user_event("e1", &responder)).unwrap();

    let (status, items) = responder.wait().await;
    assert_eq!(status, RunStatus::Success);
    assert_eq!(responder.call_count(), 1);
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].kind(), "user_input");
    assert_eq!(items[1].kind(), "step_output");
    assert_eq!(items[2].kind(), "step_output");
    assert_eq!(executed.lock().unwrap().as_slice(), &["reply", "reply"]);
    // One replan judgement between the two steps; none after the last.
    assert_eq!(planner.replan_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_plan_referencing_unregistered_action_fails_run() {
    let (plugin, executed) = TestPlugin::new();
    let planner = ScriptedPlanner::new(
        vec![json!({ "steps": [step("p-test", "missing"), step("p-test", "reply")] })],
        vec![],
    );
    let runtime = MaestroRuntime::builder()
        .with_plugin(plugin)
        .with_capability(CapabilityBinding::new("planning", "scripted", planner))
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    runtime.submit(user_event("e1", &responder)).unwrap();

    let (status, items) = responder.wait().await;
    assert!(matches!(status, RunStatus::Failure { .. }));
    assert_eq!(responder.call_count(), 1);
    // Seed plus the error item; no steps executed.
    assert_eq!(items.len(), 2);
    assert!(executed.lock().unwrap().is_empty());
    match &items[1].body {
        ItemBody::StepError { detail, .. } => {
            assert!(detail.contains("p-test/missing"), "detail: {detail}")
        }
        other => panic!("expected step_error item, got {:?}", other),
    }
}

#[tokio::test]
async fn test_step_failure_halts_run_with_error_item() {
    let (plugin, executed) = TestPlugin::new();
    let planner = ScriptedPlanner::new(
        vec![json!({ "steps": [
            step("p-test", "reply"),
            step("p-test", "fail"),
            step("p-test", "reply"),
        ] })],
        vec![json!({ "revise": false }), json!({ "revise": false })],
    );
    let runtime = MaestroRuntime::builder()
        .with_plugin(plugin)
        .with_capability(CapabilityBinding::new("planning", "scripted", planner))
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    runtime.submit(user_event("e1", &responder)).unwrap();

    let (status, items) = responder.wait().await;
    assert!(matches!(status, RunStatus::Failure { .. }));
    // Seed, first reply output, error item; third step never ran.
    assert_eq!(items.len(), 3);
    assert_eq!(items[2].kind(), "step_error");
    assert_eq!(executed.lock().unwrap().as_slice(), &["reply", "fail"]);
}

#[tokio::test]
async fn test_replan_replaces_remaining_steps() {
    let (plugin, executed) = TestPlugin::new();
    let planner = ScriptedPlanner::new(
        vec![json!({ "steps": [step("p-test", "reply"), step("p-test", "fail")] })],
        vec![json!({
            "revise": true,
            "reason": "failure step no longer needed",
            "steps": [step("p-test", "reply")],
        })],
    );
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let runtime = MaestroRuntime::builder()
        .with_plugin(plugin)
        .with_capability(CapabilityBinding::new("planning", "scripted", planner))
        .with_monitor_sink(Arc::new(RecordingSink {
            kinds: kinds.clone(),
        }))
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    runtime.submit(user_event("e1", &responder)).unwrap();

    let (status, items) = responder.wait().await;
    assert_eq!(status, RunStatus::Success);
    // The discarded "fail" step never executed; the substitution itself
    // appended nothing to the chain.
    assert_eq!(executed.lock().unwrap().as_slice(), &["reply", "reply"]);
    assert_eq!(items.len(), 3);

    // The replacement is surfaced to the monitor.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(kinds
        .lock()
        .unwrap()
        .contains(&MonitorEventKind::PipelineReplaced));
}

#[tokio::test]
async fn test_invalid_replan_falls_back_to_continue() {
    let (plugin, executed) = TestPlugin::new();
    let planner = ScriptedPlanner::new(
        vec![json!({ "steps": [step("p-test", "reply"), step("p-test", "reply")] })],
        // Replace referencing an unknown plugin: must not drop the pipeline.
        vec![json!({
            "revise": true,
            "reason": "bogus",
            "steps": [step("p-ghost", "haunt")],
        })],
    );
    let runtime = MaestroRuntime::builder()
        .with_plugin(plugin)
        .with_capability(CapabilityBinding::new("planning", "scripted", planner))
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    runtime.submit(user_event("e1", &responder)).unwrap();

    let (status, items) = responder.wait().await;
    assert_eq!(status, RunStatus::Success);
    assert_eq!(items.len(), 3);
    assert_eq!(executed.lock().unwrap().as_slice(), &["reply", "reply"]);
}

#[tokio::test]
async fn test_empty_plan_terminates_immediately_with_success() {
    let planner = ScriptedPlanner::new(vec![json!({ "steps": [] })], vec![]);
    let runtime = MaestroRuntime::builder()
        .with_capability(CapabilityBinding::new("planning", "scripted", planner))
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    runtime.submit(user_event("e1", &responder)).unwrap();

    let (status, items) = responder.wait().await;
    assert_eq!(status, RunStatus::Success);
    assert_eq!(items.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_runs_never_overlap_and_keep_fifo_order() {
    let records = Arc::new(Mutex::new(Vec::new()));
    let runtime = MaestroRuntime::builder()
        .with_plugin(Arc::new(WorkPlugin {
            records: records.clone(),
            delay: Duration::from_millis(40),
        }))
        .with_capability(CapabilityBinding::new(
            "planning",
            "fixed plan",
            ScriptedPlanner::fixed(json!({ "steps": [step("p-work", "work")] })),
        ))
        .with_config(crate::config::RuntimeConfig {
            queue: QueueConfig { workers: 4 },
            ..Default::default()
        })
        .start()
        .await
        .unwrap();

    let alice = ["a1", "a2", "a3"];
    let bob = ["b1", "b2"];
    for id in alice {
        runtime
            .submit(
                Event::new(id, "p-text", "receive", "user_input", "hi")
                    .with_user("alice")
                    .with_platform(PlatformMetadata::new("cli")),
            )
            .unwrap();
    }
    for id in bob {
        runtime
            .submit(
                Event::new(id, "p-text", "receive", "user_input", "hi")
                    .with_user("bob")
                    .with_platform(PlatformMetadata::new("cli")),
            )
            .unwrap();
    }

    // Drain: 5 work executions expected.
    for _ in 0..200 {
        if records.lock().unwrap().len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let records = records.lock().unwrap().clone();
    assert_eq!(records.len(), 5);

    let windows_for = |ids: &[&str]| -> Vec<WorkRecord> {
        let mut selected: Vec<WorkRecord> = records
            .iter()
            .filter(|r| ids.contains(&r.event_id.as_str()))
            .cloned()
            .collect();
        selected.sort_by_key(|r| r.start);
        selected
    };

    for ids in [&alice[..], &bob[..]] {
        let windows = windows_for(ids);
        // Strict FIFO per conversation key.
        let observed: Vec<&str> = windows.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(observed, ids.to_vec());
        // No two runs of one key ever overlap in time.
        for pair in windows.windows(2) {
            assert!(
                pair[0].end <= pair[1].start,
                "overlapping runs for key: {:?} then {:?}",
                pair[0],
                pair[1]
            );
        }
    }
}

#[tokio::test]
async fn test_memory_seeds_and_records_interactions() {
    let memory = Arc::new(crate::memory::InMemoryMemory::new());
    let planner = ScriptedPlanner::new(vec![json!({ "steps": [] })], vec![]);
    let runtime = MaestroRuntime::builder()
        .with_capability(CapabilityBinding::new("planning", "scripted", planner))
        .with_memory(memory.clone())
        .start()
        .await
        .unwrap();

    let responder = Responder::new();
    runtime.submit(user_event("e1", &responder)).unwrap();
    responder.wait().await;

    let history = crate::memory::MemoryProvider::recent_history(&*memory, "alice", "cli", 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[0].message_id.as_deref(), Some("e1"));
}
