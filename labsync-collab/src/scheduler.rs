//! Round-robin channel cycling with at most one channel powered at a time.
//!
//! ```text
//! start(doc) ──► spawn loop ──┐
//!                             ▼
//!             ┌──────────► tick ─────────────────────────────┐
//!             │   read doc │ plan = enabled flags, dwell, interval
//!             │            │ next = first enabled after cursor
//!             │            ├─ none: power off, wait idle_retry
//!             │            └─ some: off(prev) → on(next) → dwell(next)
//!             │                                              │
//!             └──── sleep(interval) ◄─────────────────────────┘
//!                       │
//! stop() ──► close ─────┘  join loop, power off last channel
//! ```
//!
//! Gateway failures inside a tick are logged and swallowed. The loop keeps
//! cycling through a flaky hardware server instead of halting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use labsync_core::{rpc, RunnerState};

use crate::gateway::{RpcCall, RpcGateway};
use crate::history::HistoryEngine;

/// Where the scheduler reads its inputs and which calls it issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Document used when `start` names none.
    pub default_document: String,
    /// JSON pointer to the per-channel enable flags.
    pub enabled_pointer: String,
    /// JSON pointer to per-channel dwell values in milliseconds.
    pub dwell_pointer: String,
    /// JSON pointer to the inter-channel interval in seconds.
    pub interval_pointer: String,
    pub min_interval_ms: u64,
    /// Lower bound of the scan modulus.
    pub min_channel_count: usize,
    /// Wait before re-checking when no channel is enabled.
    pub idle_retry_ms: u64,
    pub switch_endpoint: String,
    pub activate_command: String,
    pub deactivate_command: String,
    pub dwell_endpoint: String,
    pub dwell_command: String,
    /// Keyword carrying the dwell time in seconds.
    pub dwell_value_key: String,
    pub dwell_extra_kwargs: Map<String, Value>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut extra = Map::new();
        extra.insert("sensor".into(), json!(1));
        Self {
            default_document: "1".into(),
            enabled_pointer: "/HighFinesse/State".into(),
            dwell_pointer: "/HighFinesse/Sensor".into(),
            interval_pointer: "/repetition time".into(),
            min_interval_ms: 50,
            min_channel_count: 16,
            idle_retry_ms: 1000,
            switch_endpoint: "usb3104 digital".into(),
            activate_command: "set_digital_output".into(),
            deactivate_command: "set_digital_output".into(),
            dwell_endpoint: "Highfinesse wavemeter".into(),
            dwell_command: "set_exposure".into(),
            dwell_value_key: "exposure".into(),
            dwell_extra_kwargs: extra,
        }
    }
}

/// Per-tick inputs pulled from the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPlan {
    pub enabled: Vec<bool>,
    /// Dwell per channel in milliseconds.
    pub dwell_ms: Vec<f64>,
    pub interval: Duration,
}

impl ChannelPlan {
    pub fn from_document(doc: &Value, config: &SchedulerConfig) -> Self {
        let enabled = doc
            .pointer(&config.enabled_pointer)
            .and_then(Value::as_array)
            .map(|flags| flags.iter().map(is_enabled_flag).collect())
            .unwrap_or_default();

        let dwell_raw = doc.pointer(&config.dwell_pointer).and_then(Value::as_array);
        let dwell_row = match dwell_raw.and_then(|rows| rows.first()) {
            Some(Value::Array(inner)) => Some(inner),
            _ => dwell_raw,
        };
        let dwell_ms = dwell_row
            .map(|row| row.iter().map(|v| as_number(v).unwrap_or(1.0)).collect())
            .unwrap_or_default();

        let interval_secs = doc
            .pointer(&config.interval_pointer)
            .and_then(as_number)
            .unwrap_or(1.0);
        let interval_ms = (interval_secs * 1000.0)
            .round()
            .max(config.min_interval_ms as f64)
            .min(86_400_000.0);
        let interval = Duration::from_millis(interval_ms as u64);

        Self {
            enabled,
            dwell_ms,
            interval,
        }
    }

    /// Dwell of `channel` in seconds, never negative.
    pub fn dwell_secs(&self, channel: usize) -> f64 {
        let ms = self.dwell_ms.get(channel).copied().unwrap_or(1.0);
        (ms / 1000.0).max(0.0)
    }
}

/// First enabled channel strictly after `last`, scanning circularly over
/// `max(min_count, enabled.len())` slots. Starts at 0 when `last` is `None`.
pub fn next_enabled_channel(enabled: &[bool], last: Option<usize>, min_count: usize) -> Option<usize> {
    let modulus = min_count.max(enabled.len());
    if modulus == 0 {
        return None;
    }
    let start = last.map_or(0, |i| i + 1);
    (0..modulus)
        .map(|step| (start + step) % modulus)
        .find(|&idx| enabled.get(idx).copied().unwrap_or(false))
}

/// Numerically 1, including `true` and `"1"`.
fn is_enabled_flag(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        other => as_number(other) == Some(1.0),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotRunning,
    /// Another tick was still executing.
    Skipped,
    /// No channel enabled; previous channel powered off.
    Idle,
    Switched { channel: usize },
}

/// State owned by one run, from `start` until `stop`.
struct Run {
    state: StdMutex<RunnerState>,
    /// Channel currently powered on, if any.
    powered: StdMutex<Option<usize>>,
    in_tick: AtomicBool,
}

impl Run {
    fn new(document_id: String) -> Self {
        Self {
            state: StdMutex::new(RunnerState::started(document_id)),
            powered: StdMutex::new(None),
            in_tick: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> RunnerState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn powered(&self) -> Option<usize> {
        self.powered.lock().ok().and_then(|p| *p)
    }

    fn set_powered(&self, channel: Option<usize>) {
        if let Ok(mut p) = self.powered.lock() {
            *p = channel;
        }
    }
}

/// Clears the re-entrancy flag when a tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ActiveRun {
    run: Arc<Run>,
    /// Dropping the sender ends the loop.
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Shared by the scheduler handle and its loop task.
struct Driver {
    history: Arc<HistoryEngine>,
    gateway: Arc<RpcGateway>,
    config: SchedulerConfig,
}

impl Driver {
    async fn tick(&self, run: &Run) -> (TickOutcome, Duration) {
        let idle = Duration::from_millis(self.config.idle_retry_ms);
        let (running, document_id, last) = {
            let state = run.snapshot();
            (state.running, state.document_id, state.last_active_channel)
        };
        if !running {
            return (TickOutcome::NotRunning, idle);
        }
        if run.in_tick.swap(true, Ordering::AcqRel) {
            return (TickOutcome::Skipped, idle);
        }
        let _guard = TickGuard(&run.in_tick);

        let document_id = document_id.unwrap_or_else(|| self.config.default_document.clone());
        let snapshot = self.history.read(&document_id).await;
        let plan = ChannelPlan::from_document(&snapshot.state, &self.config);
        let powered = run.powered();

        let Some(next) = next_enabled_channel(&plan.enabled, last, self.config.min_channel_count) else {
            if let Some(prev) = powered {
                self.switch(prev, false).await;
                run.set_powered(None);
            }
            log::trace!("No enabled channel in doc {document_id}");
            return (TickOutcome::Idle, idle);
        };

        if let Some(prev) = powered.filter(|&p| p != next) {
            self.switch(prev, false).await;
        }
        self.switch(next, true).await;
        run.set_powered(Some(next));
        self.apply_dwell(next, plan.dwell_secs(next)).await;

        if let Ok(mut state) = run.state.lock() {
            state.last_active_channel = Some(next);
        }
        (TickOutcome::Switched { channel: next }, plan.interval)
    }

    async fn switch(&self, channel: usize, on: bool) {
        let command = if on {
            &self.config.activate_command
        } else {
            &self.config.deactivate_command
        };
        let call = RpcCall::new(&self.config.switch_endpoint, command)
            .with_args(vec![json!(channel), json!(u8::from(on))]);
        self.issue(&call).await;
    }

    async fn apply_dwell(&self, channel: usize, secs: f64) {
        let mut kwargs = self.config.dwell_extra_kwargs.clone();
        kwargs.insert(self.config.dwell_value_key.clone(), json!(secs));
        let call = RpcCall::new(&self.config.dwell_endpoint, &self.config.dwell_command).with_kwargs(kwargs);
        log::trace!("Channel {channel} dwell {secs}s");
        self.issue(&call).await;
    }

    /// Swallows every failure.
    async fn issue(&self, call: &RpcCall) {
        let reply = self.gateway.dispatch(call).await;
        if !rpc::is_ok(&reply) {
            log::warn!(
                "Scheduler call {} {} failed: {}",
                call.endpoint_key,
                call.command,
                rpc::error_message(&reply).unwrap_or_default()
            );
        }
    }
}

/// Start/stop handle for the channel cycling loop.
pub struct ChannelScheduler {
    driver: Arc<Driver>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl ChannelScheduler {
    pub fn new(history: Arc<HistoryEngine>, gateway: Arc<RpcGateway>, config: SchedulerConfig) -> Self {
        Self {
            driver: Arc::new(Driver {
                history,
                gateway,
                config,
            }),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.driver.config
    }

    /// Start cycling `document_id` (or the default document).
    ///
    /// Already running: returns the current state and changes nothing.
    pub async fn start(&self, document_id: Option<String>) -> RunnerState {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return current.run.snapshot();
        }

        let document_id = document_id.unwrap_or_else(|| self.driver.config.default_document.clone());
        let run = Arc::new(Run::new(document_id.clone()));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_loop(self.driver.clone(), run.clone(), shutdown_rx));

        log::info!("Scheduler started on doc {document_id}");
        let state = run.snapshot();
        *active = Some(ActiveRun {
            run,
            shutdown,
            task,
        });
        state
    }

    /// Stop the loop, then power off the last active channel.
    ///
    /// Waits for an in-flight tick, so the loop issues no call after this
    /// returns. The teardown runs on its own task holding the run lock, so
    /// it completes even if the caller stops waiting. Always returns the
    /// stopped state.
    pub async fn stop(&self) -> RunnerState {
        let active = self.active.clone();
        let driver = self.driver.clone();
        let teardown = tokio::spawn(async move {
            let mut active = active.lock().await;
            if let Some(current) = active.take() {
                shut_down(&driver, current).await;
            }
        });
        if let Err(e) = teardown.await {
            log::warn!("Scheduler teardown ended abnormally: {e}");
        }
        RunnerState::stopped()
    }

    pub async fn state(&self) -> RunnerState {
        match self.active.lock().await.as_ref() {
            Some(current) => current.run.snapshot(),
            None => RunnerState::stopped(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Run one tick now, outside the timer.
    pub async fn tick(&self) -> TickOutcome {
        let run = match self.active.lock().await.as_ref() {
            Some(current) => current.run.clone(),
            None => return TickOutcome::NotRunning,
        };
        self.driver.tick(&run).await.0
    }
}

async fn shut_down(driver: &Driver, ActiveRun { run, shutdown, task }: ActiveRun) {
    if let Ok(mut state) = run.state.lock() {
        state.running = false;
    }
    drop(shutdown);
    if let Err(e) = task.await {
        log::warn!("Scheduler loop ended abnormally: {e}");
    }
    // A manual tick may still hold the run
    while run.in_tick.load(Ordering::Acquire) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    if let Some(channel) = run.powered() {
        driver.switch(channel, false).await;
        run.set_powered(None);
    }
    log::info!("Scheduler stopped");
}

async fn run_loop(driver: Arc<Driver>, run: Arc<Run>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        let (outcome, delay) = driver.tick(&run).await;
        if outcome == TickOutcome::NotRunning {
            break;
        }
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use labsync_core::Endpoint;

    use crate::gateway::DEFAULT_RPC_TIMEOUT;
    use crate::storage::EndpointRegistry;
    use crate::test_support::MockHardware;

    const OK: &str = r#"{"ok": true, "result": null}"#;

    async fn setup(doc: Value, mock: &MockHardware) -> (Arc<HistoryEngine>, ChannelScheduler) {
        let history = Arc::new(HistoryEngine::in_memory());
        history.store().set("1", doc).await.unwrap();

        let mut map = BTreeMap::new();
        map.insert("usb3104 digital".to_string(), Endpoint::new(mock.addr.to_string(), "daq"));
        map.insert("Highfinesse wavemeter".to_string(), Endpoint::new(mock.addr.to_string(), "wm"));
        let gateway = Arc::new(RpcGateway::new(Arc::new(EndpointRegistry::from_map(map)), DEFAULT_RPC_TIMEOUT));

        let scheduler = ChannelScheduler::new(history.clone(), gateway, SchedulerConfig::default());
        (history, scheduler)
    }

    /// `(channel, on)` for every switch call, in order.
    fn switches(mock: &MockHardware) -> Vec<(u64, u64)> {
        mock.bodies_for("daq")
            .iter()
            .map(|b| (b["args"][0].as_u64().unwrap(), b["args"][1].as_u64().unwrap()))
            .collect()
    }

    #[test]
    fn test_next_enabled_channel() {
        let e = [true, true];
        assert_eq!(next_enabled_channel(&e, None, 16), Some(0));
        assert_eq!(next_enabled_channel(&e, Some(0), 16), Some(1));
        assert_eq!(next_enabled_channel(&e, Some(1), 16), Some(0));
        assert_eq!(next_enabled_channel(&[false, false], None, 16), None);
        assert_eq!(next_enabled_channel(&[], Some(3), 0), None);

        let mut wide = vec![false; 20];
        wide[18] = true;
        assert_eq!(next_enabled_channel(&wide, Some(18), 16), Some(18));
        assert_eq!(next_enabled_channel(&[false, true, true], Some(20), 16), Some(1));
    }

    #[test]
    fn test_channel_plan_extraction() {
        let config = SchedulerConfig::default();
        let doc = json!({
            "HighFinesse": {"State": [1, 0, true, "1", 2], "Sensor": [[250, -40, "x"]]},
            "repetition time": 0.01
        });
        let plan = ChannelPlan::from_document(&doc, &config);
        assert_eq!(plan.enabled, vec![true, false, true, true, false]);
        assert_eq!(plan.dwell_secs(0), 0.25);
        assert_eq!(plan.dwell_secs(1), 0.0);
        assert_eq!(plan.dwell_secs(2), 0.001);
        assert_eq!(plan.dwell_secs(9), 0.001);
        assert_eq!(plan.interval, Duration::from_millis(50));

        let empty = ChannelPlan::from_document(&Value::Null, &config);
        assert!(empty.enabled.is_empty());
        assert_eq!(empty.interval, Duration::from_secs(1));

        let flat = ChannelPlan::from_document(&json!({"HighFinesse": {"Sensor": [10, 20]}}), &config);
        assert_eq!(flat.dwell_ms, vec![10.0, 20.0]);
    }

    #[tokio::test]
    async fn test_round_robin_never_overlaps() {
        let mock = MockHardware::start(200, OK, Duration::ZERO).await;
        let doc = json!({
            "HighFinesse": {"State": [1, 1], "Sensor": [[100, 200]]},
            "repetition time": 0.1
        });
        let (_history, scheduler) = setup(doc, &mock).await;

        scheduler.start(None).await;
        tokio::time::sleep(Duration::from_millis(450)).await;
        let stopped = scheduler.stop().await;
        assert_eq!(stopped, RunnerState::stopped());

        let calls = switches(&mock);
        let mut powered: Option<u64> = None;
        let mut activations = Vec::new();
        for (channel, on) in &calls {
            if *on == 1 {
                assert!(powered.is_none(), "channel {channel} on while {powered:?} on: {calls:?}");
                powered = Some(*channel);
                activations.push(*channel);
            } else {
                assert_eq!(powered, Some(*channel), "{calls:?}");
                powered = None;
            }
        }
        assert!(powered.is_none(), "last channel left on: {calls:?}");
        assert!(activations.len() >= 3, "{calls:?}");
        assert_eq!(&activations[..3], &[0, 1, 0]);

        let exposures: Vec<Value> = mock.bodies_for("wm").iter().map(|b| b["kwargs"].clone()).collect();
        assert_eq!(exposures[0], json!({"sensor": 1, "exposure": 0.1}));
        assert_eq!(exposures[1], json!({"sensor": 1, "exposure": 0.2}));
    }

    #[tokio::test]
    async fn test_no_tick_after_stop() {
        let mock = MockHardware::start(200, OK, Duration::ZERO).await;
        let doc = json!({"HighFinesse": {"State": [1, 1]}, "repetition time": 0.05});
        let (_history, scheduler) = setup(doc, &mock).await;

        scheduler.start(Some("1".into())).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;
        let count = mock.requests().len();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mock.requests().len(), count);
        assert_eq!(switches(&mock).last().map(|c| c.1), Some(0));
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_idle_powers_off_previous_channel() {
        let mock = MockHardware::start(200, OK, Duration::ZERO).await;
        let doc = json!({"HighFinesse": {"State": [0, 0, 1]}, "repetition time": 30});
        let (history, scheduler) = setup(doc, &mock).await;

        scheduler.start(None).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(switches(&mock), vec![(2, 1)]);
        assert_eq!(scheduler.state().await.last_active_channel, Some(2));

        let rev = history.read("1").await.revision;
        history
            .mutate("1", rev, json!({"HighFinesse": {"State": [0, 0, 0]}, "repetition time": 30}))
            .await
            .unwrap();
        assert_eq!(scheduler.tick().await, TickOutcome::Idle);
        assert_eq!(switches(&mock), vec![(2, 1), (2, 0)]);

        scheduler.stop().await;
        assert_eq!(switches(&mock), vec![(2, 1), (2, 0)]);
    }

    #[tokio::test]
    async fn test_nothing_enabled_issues_no_calls() {
        let mock = MockHardware::start(200, OK, Duration::ZERO).await;
        let (_history, scheduler) = setup(json!({"HighFinesse": {"State": [0, 0]}}), &mock).await;

        let state = scheduler.start(None).await;
        assert!(state.running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mock.requests().is_empty());
        assert!(scheduler.state().await.running);
        scheduler.stop().await;
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failures_are_swallowed() {
        let mock = MockHardware::start(500, "offline", Duration::ZERO).await;
        let doc = json!({"HighFinesse": {"State": [1, 1]}, "repetition time": 0.05});
        let (_history, scheduler) = setup(doc, &mock).await;

        scheduler.start(None).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.state().await.running);
        let activations = switches(&mock).iter().filter(|c| c.1 == 1).count();
        assert!(activations >= 3, "only {activations} activations");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let mock = MockHardware::start(200, OK, Duration::from_millis(400)).await;
        let (_history, scheduler) = setup(json!({"HighFinesse": {"State": [1]}}), &mock).await;

        scheduler.start(None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_resets() {
        let mock = MockHardware::start(200, OK, Duration::ZERO).await;
        let (_history, scheduler) = setup(json!({}), &mock).await;

        assert_eq!(scheduler.stop().await, RunnerState::stopped());
        assert_eq!(scheduler.tick().await, TickOutcome::NotRunning);

        let first = scheduler.start(Some("7".into())).await;
        let second = scheduler.start(Some("8".into())).await;
        assert_eq!(first.document_id.as_deref(), Some("7"));
        assert_eq!(second.document_id.as_deref(), Some("7"));
        assert_eq!(first.started_at, second.started_at);

        scheduler.stop().await;
        assert_eq!(scheduler.state().await, RunnerState::stopped());
        let again = scheduler.start(None).await;
        assert_eq!(again.document_id.as_deref(), Some("1"));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_abandoned_stop_still_powers_off() {
        let mock = MockHardware::start(200, OK, Duration::from_millis(300)).await;
        let doc = json!({"HighFinesse": {"State": [1, 1]}, "repetition time": 0.05});
        let (_history, scheduler) = setup(doc, &mock).await;

        scheduler.start(None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let abandoned = tokio::time::timeout(Duration::from_millis(50), scheduler.stop()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!scheduler.is_running().await);
        assert_eq!(scheduler.state().await, RunnerState::stopped());
        let calls = switches(&mock);
        assert_eq!(calls.last(), Some(&(0, 0)), "{calls:?}");

        let count = mock.requests().len();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(mock.requests().len(), count);
    }
}
