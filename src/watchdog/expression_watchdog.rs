//! Interlock that pauses, rewinds and resumes a scan on a live expression.
//!
//! # Lifecycle
//!
//! ```text
//! disarmed ──arm──▶ armed ◀──true / seek + resume──▶ paused
//!     ▲                │                                │
//!     └─────disarm─────┴────────────disarm──────────────┘
//! ```
//!
//! One task per source waits on the source's watch channel. Every change
//! rebinds only the changed variable and re-evaluates under a single async
//! mutex, so evaluations and the control calls they trigger never race. The
//! last completed point is published through an `ArcSwapOption` and read
//! whole by the evaluation tasks.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ScanError, ScanResult};
use crate::points::position::{Position, Scalar};
use crate::sequencer::{Controller, ListenerId, ScanListener};
use crate::watchdog::expression::{ExpressionEngine, ExpressionService};
use crate::watchdog::source::SourceRegistry;

/// Interlock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogModel {
    /// Boolean expression over live value names, e.g. `beamcurrent >= 1.0`.
    pub expression: String,
    /// Reason reported when the expression is false.
    pub message: String,
}

impl WatchdogModel {
    /// Create a model.
    pub fn new(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// The expression must not be blank.
    pub fn validate(&self) -> ScanResult<()> {
        if self.expression.trim().is_empty() {
            return Err(ScanError::validation(
                "expression",
                "watchdog expression must not be empty",
            ));
        }
        Ok(())
    }
}

/// Where the watchdog is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    Disarmed,
    Armed,
    /// Armed and currently holding a pause on the controller.
    Paused,
}

/// Runtime diagnostics published by an armed watchdog.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogEvent {
    /// Arming succeeded.
    Armed { id: String },
    /// The expression became false and this watchdog paused the scan.
    Tripped { id: String, source: String },
    /// The expression became true again and the scan was resumed.
    Resumed { id: String, seek_to: Option<usize> },
    /// Evaluation failed and was treated as false.
    EvaluationFailed { id: String, error: String },
    /// The controller refused a pause, seek or resume.
    ControlRejected { id: String, error: String },
    /// The watchdog stopped listening.
    Disarmed { id: String },
}

struct EvalState {
    engine: Option<Box<dyn ExpressionEngine>>,
    variables: Vec<String>,
    paused_by_us: bool,
    state: WatchdogState,
}

impl EvalState {
    fn release(&mut self) {
        self.engine = None;
        self.variables.clear();
        self.paused_by_us = false;
        self.state = WatchdogState::Disarmed;
    }
}

struct Inner {
    model: WatchdogModel,
    controller: Arc<dyn Controller>,
    service: Arc<dyn ExpressionService>,
    sources: SourceRegistry,
    eval: Mutex<EvalState>,
    armed: AtomicBool,
    generation: AtomicU64,
    last_completed: ArcSwapOption<Position>,
    shutdown: SyncMutex<Option<watch::Sender<()>>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    listener: SyncMutex<Option<ListenerId>>,
    events: broadcast::Sender<WatchdogEvent>,
}

/// Expression-driven interlock for one controller.
///
/// The watchdog id is the expression text. Several watchdogs may guard the
/// same controller; each one resumes only a pause it issued itself.
///
/// # Example
///
/// ```rust,ignore
/// let watchdog = ExpressionWatchdog::new(
///     WatchdogModel::new("beamcurrent >= 1.0", "Beam has been lost"),
///     controller.clone(),
///     Arc::new(RhaiExpressionService::default()),
///     sources,
/// )?;
/// watchdog.arm(None).await?;     // fails if the beam is already down
/// runner.run(&scan, &positioner).await?;
/// watchdog.disarm();
/// ```
pub struct ExpressionWatchdog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExpressionWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionWatchdog")
            .field("id", &self.id())
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl ExpressionWatchdog {
    /// Create a disarmed watchdog.
    pub fn new(
        model: WatchdogModel,
        controller: Arc<dyn Controller>,
        service: Arc<dyn ExpressionService>,
        sources: SourceRegistry,
    ) -> ScanResult<Self> {
        model.validate()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(Inner {
                model,
                controller,
                service,
                sources,
                eval: Mutex::new(EvalState {
                    engine: None,
                    variables: Vec::new(),
                    paused_by_us: false,
                    state: WatchdogState::Disarmed,
                }),
                armed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                last_completed: ArcSwapOption::from(None),
                shutdown: SyncMutex::new(None),
                tasks: SyncMutex::new(Vec::new()),
                listener: SyncMutex::new(None),
                events,
            }),
        })
    }

    /// Watchdog id (the expression text).
    pub fn id(&self) -> &str {
        &self.inner.model.expression
    }

    /// Configuration.
    pub fn model(&self) -> &WatchdogModel {
        &self.inner.model
    }

    /// Whether the watchdog is armed.
    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }

    /// Current lifecycle state. Waits for an in-flight evaluation.
    pub async fn state(&self) -> WatchdogState {
        self.inner.eval.lock().await.state
    }

    /// Subscribe to runtime diagnostics.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.inner.events.subscribe()
    }

    /// Last point reported complete since arming.
    pub fn last_completed(&self) -> Option<Arc<Position>> {
        self.inner.last_completed.load_full()
    }

    /// Arm at scan start.
    ///
    /// Parses the expression, resolves every variable to a source that can
    /// notify changes, binds the current values and evaluates once. A false
    /// expression rejects the scan with [`ScanError::WatchdogRejected`].
    /// On success the watchdog subscribes to every source, registers for
    /// point completions with the controller and finally processes
    /// `first_position` like a value change if it names a single value.
    pub async fn arm(&self, first_position: Option<&Position>) -> ScanResult<()> {
        let inner = &self.inner;
        let mut eval = inner.eval.lock().await;
        if eval.state != WatchdogState::Disarmed {
            if inner.armed.load(Ordering::SeqCst) {
                return Err(ScanError::Control(format!(
                    "watchdog '{}' is already armed",
                    inner.model.expression
                )));
            }
            // Left behind by an evaluation that outlived a disarm.
            eval.release();
        }
        debug!(
            "Expression watchdog arming on {}",
            inner.controller.name()
        );

        let mut engine = inner.service.create_engine();
        engine.parse(&inner.model.expression)?;
        let variables = engine.variable_names();

        let mut receivers = Vec::with_capacity(variables.len());
        for name in &variables {
            let source = inner.sources.resolve(name)?;
            let rx = source.subscribe().ok_or_else(|| ScanError::Source {
                name: name.clone(),
                message: "source cannot notify changes and may not be watched".to_string(),
            })?;
            engine.bind(name, &source.current_value());
            receivers.push((name.clone(), rx));
        }

        if !engine.evaluate()? {
            return Err(ScanError::WatchdogRejected {
                message: inner.model.message.clone(),
                expression: inner.model.expression.clone(),
            });
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, _) = watch::channel(());
        let mut handles = Vec::with_capacity(receivers.len());
        for (name, mut rx) in receivers {
            rx.borrow_and_update();
            let mut shutdown = shutdown_tx.subscribe();
            let task_inner = Arc::clone(inner);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let value = rx.borrow_and_update().clone();
                            task_inner.on_value_changed(generation, &name, value).await;
                        }
                    }
                }
            }));
        }

        let listener = inner.controller.add_listener(Arc::new(WatchdogListener {
            inner: Arc::downgrade(inner),
            generation,
        }));

        eval.engine = Some(engine);
        eval.variables = variables;
        eval.paused_by_us = false;
        eval.state = WatchdogState::Armed;
        *inner.shutdown.lock() = Some(shutdown_tx);
        *inner.tasks.lock() = handles;
        *inner.listener.lock() = Some(listener);
        inner.last_completed.store(None);
        inner.armed.store(true, Ordering::SeqCst);
        drop(eval);

        inner.emit(WatchdogEvent::Armed {
            id: inner.model.expression.clone(),
        });
        info!(
            "Expression watchdog '{}' armed on {}",
            inner.model.expression,
            inner.controller.name()
        );

        if let Some(position) = first_position {
            inner.on_position(generation, position).await;
        }
        Ok(())
    }

    /// Record a completed point as the rewind target.
    pub fn point_completed(&self, position: &Position) {
        self.inner.record_point(position);
    }

    /// Disarm at scan end.
    ///
    /// Unsubscribes from every source and from the controller, clears the
    /// last completed point and releases the engine. Never blocks on an
    /// in-flight evaluation: that evaluation finishes, issues no control
    /// call and releases the engine itself. Safe to call any number of
    /// times, including after a failed arm.
    pub fn disarm(&self) {
        let inner = &self.inner;
        let was_armed = inner.armed.swap(false, Ordering::SeqCst);
        inner.generation.fetch_add(1, Ordering::SeqCst);

        inner.shutdown.lock().take();
        inner.tasks.lock().clear();
        if let Some(id) = inner.listener.lock().take() {
            inner.controller.remove_listener(id);
        }
        inner.last_completed.store(None);

        match inner.eval.try_lock() {
            Ok(mut eval) => eval.release(),
            Err(_) => debug!(
                "Watchdog '{}' disarmed during an evaluation",
                inner.model.expression
            ),
        }

        if was_armed {
            inner.emit(WatchdogEvent::Disarmed {
                id: inner.model.expression.clone(),
            });
            info!(
                "Expression watchdog '{}' disarmed on {}",
                inner.model.expression,
                inner.controller.name()
            );
        }
    }
}

impl Drop for ExpressionWatchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl Inner {
    fn id(&self) -> &str {
        &self.model.expression
    }

    fn emit(&self, event: WatchdogEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.armed.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn record_point(&self, position: &Position) {
        if self.armed.load(Ordering::SeqCst) {
            self.last_completed.store(Some(Arc::new(position.clone())));
        }
    }

    async fn on_position(&self, generation: u64, position: &Position) {
        let mut names = position.names();
        if let (Some(name), None) = (names.next(), names.next()) {
            if let Some(value) = position.get(name) {
                self.on_value_changed(generation, name, value.clone()).await;
            }
        }
    }

    async fn on_value_changed(&self, generation: u64, name: &str, value: Scalar) {
        let mut eval = self.eval.lock().await;
        if !self.is_current(generation) {
            if !self.armed.load(Ordering::SeqCst) {
                eval.release();
            }
            return;
        }
        if !eval.variables.iter().any(|v| v == name) {
            return;
        }
        let Some(engine) = eval.engine.as_mut() else {
            return;
        };

        engine.bind(name, &value);
        let ok = match engine.evaluate() {
            Ok(ok) => ok,
            Err(e) => {
                warn!(
                    "Watchdog '{}' cannot evaluate after {}={}: {}; treating as false",
                    self.id(),
                    name,
                    value,
                    e
                );
                self.emit(WatchdogEvent::EvaluationFailed {
                    id: self.id().to_string(),
                    error: e.to_string(),
                });
                false
            }
        };

        if !self.is_current(generation) {
            eval.release();
            return;
        }
        if ok {
            self.release_pause(&mut eval).await;
        } else {
            self.hold_pause(&mut eval, name).await;
        }

        if !self.is_current(generation) {
            self.withdraw_pause(&mut eval).await;
            eval.release();
        }
    }

    /// Undo a pause that landed after the watchdog was disarmed.
    async fn withdraw_pause(&self, eval: &mut EvalState) {
        if !eval.paused_by_us {
            return;
        }
        match self.controller.resume(self.id()).await {
            Ok(_) => debug!(
                "Watchdog '{}' disarmed during pause; released {}",
                self.id(),
                self.controller.name()
            ),
            Err(e) => warn!(
                "Watchdog '{}' cannot release {} after disarm: {}",
                self.id(),
                self.controller.name(),
                e
            ),
        }
        eval.paused_by_us = false;
    }

    async fn hold_pause(&self, eval: &mut EvalState, trigger: &str) {
        if eval.paused_by_us {
            return;
        }
        match self.controller.pause(self.id(), &self.model).await {
            Ok(true) => {
                eval.paused_by_us = true;
                eval.state = WatchdogState::Paused;
                info!(
                    "Watchdog '{}' paused {}: {}",
                    self.id(),
                    self.controller.name(),
                    self.model.message
                );
                self.emit(WatchdogEvent::Tripped {
                    id: self.id().to_string(),
                    source: trigger.to_string(),
                });
            }
            Ok(false) => debug!(
                "Watchdog '{}': {} was already paused",
                self.id(),
                self.controller.name()
            ),
            Err(e) => self.control_rejected("pause", e),
        }
    }

    async fn release_pause(&self, eval: &mut EvalState) {
        if !eval.paused_by_us {
            return;
        }
        let seek_to = self.last_completed.load_full().map(|p| p.step_index());
        if let Some(step) = seek_to {
            if let Err(e) = self.controller.seek(self.id(), step).await {
                self.control_rejected("seek", e);
                return;
            }
        }
        match self.controller.resume(self.id()).await {
            Ok(resumed) => {
                eval.paused_by_us = false;
                eval.state = WatchdogState::Armed;
                if resumed {
                    info!(
                        "Watchdog '{}' resumed {} from step {:?}",
                        self.id(),
                        self.controller.name(),
                        seek_to
                    );
                    self.emit(WatchdogEvent::Resumed {
                        id: self.id().to_string(),
                        seek_to,
                    });
                } else {
                    debug!(
                        "Watchdog '{}': pause on {} was already released",
                        self.id(),
                        self.controller.name()
                    );
                }
            }
            Err(e) => self.control_rejected("resume", e),
        }
    }

    fn control_rejected(&self, action: &str, e: ScanError) {
        error!(
            "Watchdog '{}': {} rejected by {}: {}",
            self.id(),
            action,
            self.controller.name(),
            e
        );
        self.emit(WatchdogEvent::ControlRejected {
            id: self.id().to_string(),
            error: e.to_string(),
        });
    }
}

/// Controller listener registered while armed.
///
/// Holds a weak reference so the controller never keeps a dropped watchdog
/// alive.
struct WatchdogListener {
    inner: Weak<Inner>,
    generation: u64,
}

#[async_trait]
impl ScanListener for WatchdogListener {
    async fn point_completed(&self, position: &Position) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.is_current(self.generation) {
                inner.record_point(position);
            }
        }
    }

    async fn value_changed(&self, source: &str, value: &Scalar) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .on_value_changed(self.generation, source, value.clone())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{
        ControlCall, ControllerState, ListenerRegistry, RecordingController,
    };
    use crate::watchdog::expression::{ExpressionError, ScriptedExpressionEngine};
    use crate::watchdog::source::{ObservableValue, PolledValue};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Fixture {
        controller: Arc<RecordingController>,
        script: ScriptedExpressionEngine,
        x: Arc<ObservableValue>,
        watchdog: ExpressionWatchdog,
    }

    fn fixture() -> Fixture {
        let controller = Arc::new(RecordingController::new("recorder"));
        let script = ScriptedExpressionEngine::new(&["x"]);
        let x = Arc::new(ObservableValue::new("x", 2.0));
        let watchdog = ExpressionWatchdog::new(
            WatchdogModel::new("x >= 1", "x dropped"),
            controller.clone(),
            Arc::new(script.clone()),
            SourceRegistry::new().with(x.clone()),
        )
        .unwrap();
        Fixture {
            controller,
            script,
            x,
            watchdog,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<WatchdogEvent>) -> WatchdogEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_arm_binds_current_values() {
        let f = fixture();
        f.watchdog.arm(None).await.unwrap();
        assert!(f.watchdog.is_armed());
        assert_eq!(f.watchdog.state().await, WatchdogState::Armed);
        assert_eq!(f.script.bindings(), vec![("x".into(), Scalar::Number(2.0))]);
        assert_eq!(f.script.parsed().as_deref(), Some("x >= 1"));
        assert_eq!(f.controller.listener_count(), 1);
        assert!(f.watchdog.arm(None).await.is_err());
    }

    #[tokio::test]
    async fn test_false_at_arm_rejects_scan() {
        let f = fixture();
        f.script.push_result(Ok(false));
        let err = f.watchdog.arm(None).await.unwrap_err();
        assert!(matches!(err, ScanError::WatchdogRejected { .. }));
        assert!(err.to_string().contains("a scan may not be run"));
        assert!(!f.watchdog.is_armed());
        assert_eq!(f.controller.pause_count(), 0);
        f.watchdog.disarm();
    }

    #[tokio::test]
    async fn test_parse_error_rejects_scan() {
        let f = fixture();
        f.script.fail_parse("unexpected end");
        let err = f.watchdog.arm(None).await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::Expression(ExpressionError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_unlistenable_source_rejects_scan() {
        let controller = Arc::new(RecordingController::new("recorder"));
        let watchdog = ExpressionWatchdog::new(
            WatchdogModel::new("portshutter", "Shutter closed"),
            controller,
            Arc::new(ScriptedExpressionEngine::new(&["portshutter"])),
            SourceRegistry::new().with(Arc::new(PolledValue::new("portshutter", "Open"))),
        )
        .unwrap();
        let err = watchdog.arm(None).await.unwrap_err();
        assert!(matches!(err, ScanError::Source { .. }));
    }

    #[tokio::test]
    async fn test_trip_and_resume_with_seek() {
        let f = fixture();
        let mut events = f.watchdog.subscribe_events();
        f.watchdog.arm(None).await.unwrap();
        assert!(matches!(next_event(&mut events).await, WatchdogEvent::Armed { .. }));

        f.controller
            .complete_point(&Position::new(vec![], vec![4], 4))
            .await;
        assert_eq!(f.watchdog.last_completed().map(|p| p.step_index()), Some(4));

        f.script.push_result(Ok(false));
        f.x.set(0.0).unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            WatchdogEvent::Tripped { .. }
        ));
        assert_eq!(f.watchdog.state().await, WatchdogState::Paused);

        f.x.set(2.0).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            WatchdogEvent::Resumed {
                id: "x >= 1".into(),
                seek_to: Some(4)
            }
        );
        assert_eq!(
            f.controller.calls(),
            vec![
                ControlCall::Pause("x >= 1".into()),
                ControlCall::Seek("x >= 1".into(), 4),
                ControlCall::Resume("x >= 1".into()),
            ]
        );
        assert_eq!(f.controller.state(), ControllerState::Running);
    }

    #[tokio::test]
    async fn test_evaluation_error_pauses() {
        let f = fixture();
        let mut events = f.watchdog.subscribe_events();
        f.watchdog.arm(None).await.unwrap();
        next_event(&mut events).await;

        f.script
            .push_result(Err(ExpressionError::Evaluation("sensor glitch".into())));
        f.x.set(5.0).unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            WatchdogEvent::EvaluationFailed { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            WatchdogEvent::Tripped { .. }
        ));
        assert_eq!(f.controller.pause_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_pause_is_retried_on_next_change() {
        let f = fixture();
        let mut events = f.watchdog.subscribe_events();
        f.watchdog.arm(None).await.unwrap();
        next_event(&mut events).await;

        f.controller.set_reject(true);
        f.script.set_default(false);
        f.x.set(0.0).unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            WatchdogEvent::ControlRejected { .. }
        ));
        assert!(f.watchdog.is_armed());

        f.controller.set_reject(false);
        f.x.set(0.5).unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            WatchdogEvent::Tripped { .. }
        ));
        assert_eq!(f.controller.pause_count(), 2);
    }

    #[tokio::test]
    async fn test_first_position_is_processed() {
        let f = fixture();
        f.script.push_result(Ok(true));
        f.script.push_result(Ok(false));
        f.watchdog
            .arm(Some(&Position::single("x", 0.0)))
            .await
            .unwrap();
        assert_eq!(f.controller.pause_count(), 1);
        assert_eq!(
            f.script.bindings().last(),
            Some(&("x".to_string(), Scalar::Number(0.0)))
        );
    }

    #[tokio::test]
    async fn test_disarm_is_idempotent_and_unsubscribes() {
        let f = fixture();
        f.watchdog.disarm();
        f.watchdog.arm(None).await.unwrap();
        assert_eq!(f.x.subscriber_count(), 1);

        f.watchdog.disarm();
        f.watchdog.disarm();
        assert!(!f.watchdog.is_armed());
        assert_eq!(f.watchdog.state().await, WatchdogState::Disarmed);
        assert_eq!(f.controller.listener_count(), 0);
        assert!(f.watchdog.last_completed().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.x.subscriber_count(), 0);

        f.script.set_default(false);
        f.x.set(0.0).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.controller.pause_count(), 0);

        f.script.set_default(true);
        f.watchdog.arm(None).await.unwrap();
        assert!(f.watchdog.is_armed());
    }

    // ===== Disarm while an evaluation is in flight =====

    /// Controller whose pause waits until the test lets it through.
    #[derive(Default)]
    struct GatedController {
        entered: Notify,
        release: Notify,
        pauses: AtomicUsize,
        resumes: AtomicUsize,
        listeners: ListenerRegistry,
    }

    #[async_trait]
    impl Controller for GatedController {
        fn name(&self) -> &str {
            "gated"
        }

        async fn pause(&self, _owner: &str, _model: &WatchdogModel) -> ScanResult<bool> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(true)
        }

        async fn resume(&self, _owner: &str) -> ScanResult<bool> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn seek(&self, _owner: &str, _step_index: usize) -> ScanResult<()> {
            Ok(())
        }

        fn state(&self) -> ControllerState {
            ControllerState::Running
        }

        fn add_listener(&self, listener: Arc<dyn ScanListener>) -> ListenerId {
            self.listeners.add(listener)
        }

        fn remove_listener(&self, id: ListenerId) -> bool {
            self.listeners.remove(id)
        }
    }

    /// Blocks the `gated_call`-th evaluation until released.
    struct EvaluationGate {
        gated_call: usize,
        evaluations: AtomicUsize,
        entered: Notify,
        release: SyncMutex<Option<mpsc::Receiver<()>>>,
    }

    impl EvaluationGate {
        fn new(gated_call: usize) -> (Arc<Self>, mpsc::Sender<()>) {
            let (tx, rx) = mpsc::channel();
            let gate = Arc::new(Self {
                gated_call,
                evaluations: AtomicUsize::new(0),
                entered: Notify::new(),
                release: SyncMutex::new(Some(rx)),
            });
            (gate, tx)
        }
    }

    struct GatedEngine {
        gate: Arc<EvaluationGate>,
        x: f64,
    }

    impl ExpressionEngine for GatedEngine {
        fn parse(&mut self, _expression: &str) -> Result<(), ExpressionError> {
            Ok(())
        }

        fn variable_names(&self) -> Vec<String> {
            vec!["x".to_string()]
        }

        fn bind(&mut self, _name: &str, value: &Scalar) {
            if let Scalar::Number(x) = value {
                self.x = *x;
            }
        }

        fn evaluate(&mut self) -> Result<bool, ExpressionError> {
            let call = self.gate.evaluations.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.gate.gated_call {
                self.gate.entered.notify_one();
                let release = self.gate.release.lock().take();
                if let Some(rx) = release {
                    let _ = rx.recv_timeout(Duration::from_secs(5));
                }
            }
            Ok(self.x >= 1.0)
        }
    }

    struct GatedService(Arc<EvaluationGate>);

    impl ExpressionService for GatedService {
        fn create_engine(&self) -> Box<dyn ExpressionEngine> {
            Box::new(GatedEngine {
                gate: Arc::clone(&self.0),
                x: 0.0,
            })
        }
    }

    async fn wait_disarmed(watchdog: &ExpressionWatchdog) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while watchdog.state().await != WatchdogState::Disarmed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_disarm_during_pause_call_releases_state() {
        let controller = Arc::new(GatedController::default());
        let script = ScriptedExpressionEngine::new(&["x"]);
        let x = Arc::new(ObservableValue::new("x", 2.0));
        let watchdog = ExpressionWatchdog::new(
            WatchdogModel::new("x >= 1", "x dropped"),
            controller.clone(),
            Arc::new(script.clone()),
            SourceRegistry::new().with(x.clone()),
        )
        .unwrap();
        watchdog.arm(None).await.unwrap();

        script.set_default(false);
        x.set(0.0).unwrap();
        tokio::time::timeout(Duration::from_secs(2), controller.entered.notified())
            .await
            .unwrap();

        watchdog.disarm();
        assert!(!watchdog.is_armed());
        controller.release.notify_one();
        wait_disarmed(&watchdog).await;

        assert_eq!(controller.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(controller.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(controller.listeners.len(), 0);

        script.set_default(true);
        watchdog.arm(None).await.unwrap();
        assert_eq!(watchdog.state().await, WatchdogState::Armed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disarm_mid_evaluation_skips_control_call() {
        let controller = Arc::new(RecordingController::new("recorder"));
        let (gate, release) = EvaluationGate::new(2);
        let x = Arc::new(ObservableValue::new("x", 2.0));
        let watchdog = ExpressionWatchdog::new(
            WatchdogModel::new("x >= 1", "x dropped"),
            controller.clone(),
            Arc::new(GatedService(Arc::clone(&gate))),
            SourceRegistry::new().with(x.clone()),
        )
        .unwrap();
        watchdog.arm(None).await.unwrap();

        x.set(0.0).unwrap();
        tokio::time::timeout(Duration::from_secs(2), gate.entered.notified())
            .await
            .unwrap();

        watchdog.disarm();
        release.send(()).unwrap();
        wait_disarmed(&watchdog).await;
        assert_eq!(controller.pause_count(), 0);
        assert!(controller.calls().is_empty());

        x.set(2.0).unwrap();
        watchdog.arm(None).await.unwrap();
        assert!(watchdog.is_armed());
        assert_eq!(gate.evaluations.load(Ordering::SeqCst), 3);
    }
}
