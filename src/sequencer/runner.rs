//! In-process controller driving a positioner through a trajectory.
//!
//! Control state lives in a `tokio::sync::watch` cell. Pause, resume and
//! seek are conditional updates of that cell (`send_if_modified`), and the
//! emission loop waits on it while paused. The loop checks the cell before
//! every point, so the point in flight when a pause arrives completes first.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{ScanError, ScanResult};
use crate::points::position::{Position, Scalar};
use crate::points::slice::slice_from;
use crate::points::PointGenerator;
use crate::sequencer::{
    Controller, ControllerState, ListenerId, ListenerRegistry, Positioner, ScanListener,
};
use crate::watchdog::WatchdogModel;

#[derive(Debug, Clone, PartialEq)]
struct RunControl {
    state: ControllerState,
    paused_by: Option<String>,
    seek_to: Option<usize>,
}

/// Counters reported when a run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Points moved to and completed, repeats after a seek included.
    pub points_completed: usize,
    /// Seeks applied during the run.
    pub seeks: usize,
    /// State the controller ended in.
    pub final_state: ControllerState,
}

/// Controller executing one scan at a time.
pub struct ScanRunner {
    name: String,
    control: watch::Sender<RunControl>,
    listeners: ListenerRegistry,
    active: AtomicBool,
    shape: Mutex<Option<Vec<usize>>>,
    completed: AtomicUsize,
}

impl std::fmt::Debug for ScanRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRunner")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ScanRunner {
    /// Idle runner.
    pub fn new(name: impl Into<String>) -> Self {
        let (control, _) = watch::channel(RunControl {
            state: ControllerState::Idle,
            paused_by: None,
            seek_to: None,
        });
        Self {
            name: name.into(),
            control,
            listeners: ListenerRegistry::new(),
            active: AtomicBool::new(false),
            shape: Mutex::new(None),
            completed: AtomicUsize::new(0),
        }
    }

    /// Owner of the current pause, if paused.
    pub fn paused_by(&self) -> Option<String> {
        self.control.borrow().paused_by.clone()
    }

    /// Points completed by the current or last run.
    pub fn points_completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Stop the run before its next point. Also releases a paused run.
    pub fn abort(&self) {
        self.control.send_modify(|c| {
            c.state = ControllerState::Aborted;
            c.paused_by = None;
            c.seek_to = None;
        });
        info!("{}: abort requested", self.name);
    }

    /// Publish a monitored value to listeners.
    pub async fn report_value(&self, source: &str, value: &Scalar) {
        self.listeners.notify_value(source, value).await;
    }

    /// Execute `generator` through `positioner` until the trajectory ends,
    /// the run is aborted, or an error occurs.
    ///
    /// A pause requested before the run starts holds the run at its first
    /// point.
    pub async fn run(
        &self,
        generator: &dyn PointGenerator,
        positioner: &dyn Positioner,
    ) -> ScanResult<RunSummary> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(ScanError::Control(format!(
                "{}: a scan is already running",
                self.name
            )));
        }
        let result = self.execute(generator, positioner).await;
        *self.shape.lock() = None;
        self.active.store(false, Ordering::SeqCst);

        let final_state = match &result {
            Ok(_) => ControllerState::Finished,
            Err(_) => ControllerState::Aborted,
        };
        self.control.send_modify(|c| {
            if c.state != ControllerState::Aborted {
                c.state = final_state;
            }
            c.paused_by = None;
            c.seek_to = None;
        });

        let seeks = result?;
        let summary = RunSummary {
            points_completed: self.points_completed(),
            seeks,
            final_state: self.state(),
        };
        info!(
            "{}: scan '{}' ended {} after {} point(s)",
            self.name,
            generator.name(),
            summary.final_state,
            summary.points_completed
        );
        Ok(summary)
    }

    async fn execute(
        &self,
        generator: &dyn PointGenerator,
        positioner: &dyn Positioner,
    ) -> ScanResult<usize> {
        let shape = generator.shape()?;
        *self.shape.lock() = Some(shape);
        self.completed.store(0, Ordering::SeqCst);
        self.control.send_modify(|c| {
            if c.state != ControllerState::Paused {
                c.state = ControllerState::Running;
                c.paused_by = None;
            }
            c.seek_to = None;
        });
        info!(
            "{}: running '{}' on {}",
            self.name,
            generator.name(),
            positioner.name()
        );

        let mut positions = generator.positions()?;
        let mut rx = self.control.subscribe();
        let mut seeks = 0;

        loop {
            let state = rx
                .wait_for(|c| c.state != ControllerState::Paused)
                .await
                .map_err(|_| ScanError::Control(format!("{}: control closed", self.name)))?
                .state;
            if state == ControllerState::Aborted {
                positioner.abort();
                return Ok(seeks);
            }

            let mut seek = None;
            self.control.send_if_modified(|c| {
                seek = c.seek_to.take();
                seek.is_some()
            });
            if let Some(target) = seek {
                positions = generator.positions()?;
                for _ in 0..target {
                    match positions.next() {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
                seeks += 1;
                debug!("{}: emission continues at step {}", self.name, target);
            }

            let position = match positions.next() {
                Some(position) => position?,
                None => return Ok(seeks),
            };
            positioner.set_position(&position).await?;
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.listeners.notify_point(&position).await;
        }
    }
}

#[async_trait]
impl Controller for ScanRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pause(&self, owner: &str, model: &WatchdogModel) -> ScanResult<bool> {
        let mut outcome = Ok(false);
        self.control.send_if_modified(|c| match c.state {
            ControllerState::Idle | ControllerState::Running => {
                c.state = ControllerState::Paused;
                c.paused_by = Some(owner.to_string());
                outcome = Ok(true);
                true
            }
            ControllerState::Paused => false,
            other => {
                outcome = Err(other);
                false
            }
        });
        match outcome {
            Ok(true) => {
                info!(
                    "{}: paused by '{}' ({})",
                    self.name, owner, model.message
                );
                Ok(true)
            }
            Ok(false) => {
                debug!("{}: pause by '{}' ignored, already paused", self.name, owner);
                Ok(false)
            }
            Err(state) => Err(ScanError::Control(format!(
                "{}: cannot pause a {} scan",
                self.name, state
            ))),
        }
    }

    async fn resume(&self, owner: &str) -> ScanResult<bool> {
        let running = if self.active.load(Ordering::SeqCst) {
            ControllerState::Running
        } else {
            ControllerState::Idle
        };
        let resumed = self.control.send_if_modified(|c| {
            if c.state == ControllerState::Paused && c.paused_by.as_deref() == Some(owner) {
                c.state = running;
                c.paused_by = None;
                true
            } else {
                false
            }
        });
        if resumed {
            info!("{}: resumed by '{}'", self.name, owner);
        } else {
            debug!("{}: resume by '{}' ignored", self.name, owner);
        }
        Ok(resumed)
    }

    async fn seek(&self, owner: &str, step_index: usize) -> ScanResult<()> {
        let shape = self.shape.lock().clone().ok_or_else(|| {
            ScanError::Control(format!("{}: no scan is running", self.name))
        })?;
        let remaining = slice_from(&shape, step_index)
            .map_err(|e| ScanError::Control(format!("{}: cannot seek: {}", self.name, e)))?;

        let mut rejected = None;
        self.control.send_if_modified(|c| {
            let allowed = match c.state {
                ControllerState::Running => true,
                ControllerState::Paused => c.paused_by.as_deref() == Some(owner),
                _ => false,
            };
            if allowed {
                c.seek_to = Some(step_index);
            } else {
                rejected = Some((c.state, c.paused_by.clone()));
            }
            allowed
        });

        match rejected {
            None => {
                info!("{}: '{}' seeks to {}", self.name, owner, remaining);
                Ok(())
            }
            Some((state, paused_by)) => {
                error!(
                    "{}: seek by '{}' rejected in state {} (paused by {:?})",
                    self.name, owner, state, paused_by
                );
                Err(ScanError::Control(format!(
                    "{}: '{}' may not seek a {} scan",
                    self.name, owner, state
                )))
            }
        }
    }

    fn state(&self) -> ControllerState {
        self.control.borrow().state
    }

    fn add_listener(&self, listener: Arc<dyn ScanListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::generator::Generator;
    use crate::points::models::StepModel;
    use crate::sequencer::MockPositioner;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn model() -> WatchdogModel {
        WatchdogModel::new("x >= 1", "x dropped")
    }

    fn line(points: usize) -> Generator {
        Generator::new(Box::new(StepModel::new(
            "x",
            0.0,
            (points - 1) as f64,
            1.0,
        )))
        .unwrap()
    }

    fn xs(positioner: &MockPositioner) -> Vec<f64> {
        positioner
            .visited()
            .iter()
            .filter_map(|p| p.get_f64("x"))
            .collect()
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let runner = ScanRunner::new("runner");
        let positioner = MockPositioner::new("stage");
        let summary = runner.run(&line(4), &positioner).await.unwrap();
        assert_eq!(summary.points_completed, 4);
        assert_eq!(summary.final_state, ControllerState::Finished);
        assert_eq!(runner.state(), ControllerState::Finished);
        assert_eq!(xs(&positioner), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_pause_is_owner_scoped() {
        let runner = ScanRunner::new("runner");
        assert!(runner.pause("operator", &model()).await.unwrap());
        assert!(!runner.pause("watchdog", &model()).await.unwrap());
        assert_eq!(runner.paused_by().as_deref(), Some("operator"));

        assert!(!runner.resume("watchdog").await.unwrap());
        assert_eq!(runner.state(), ControllerState::Paused);
        assert!(runner.resume("operator").await.unwrap());
        assert_eq!(runner.state(), ControllerState::Idle);
        assert!(!runner.resume("operator").await.unwrap());
    }

    #[tokio::test]
    async fn test_seek_requires_running_scan() {
        let runner = ScanRunner::new("runner");
        assert!(matches!(
            runner.seek("watchdog", 0).await,
            Err(ScanError::Control(_))
        ));
    }

    #[tokio::test]
    async fn test_pre_paused_run_waits_then_seeks() {
        let runner = Arc::new(ScanRunner::new("runner"));
        let positioner = Arc::new(MockPositioner::new("stage"));
        runner.pause("watchdog", &model()).await.unwrap();

        let task = {
            let runner = Arc::clone(&runner);
            let positioner = Arc::clone(&positioner);
            tokio::spawn(async move { runner.run(&line(5), positioner.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(positioner.move_count(), 0);

        runner.seek("watchdog", 3).await.unwrap();
        assert!(runner.resume("watchdog").await.unwrap());
        let summary = task.await.unwrap().unwrap();

        assert_eq!(summary.seeks, 1);
        assert_eq!(xs(&positioner), vec![3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_abort_releases_paused_run() {
        let runner = Arc::new(ScanRunner::new("runner"));
        let positioner = Arc::new(MockPositioner::new("stage"));
        runner.pause("operator", &model()).await.unwrap();

        let task = {
            let runner = Arc::clone(&runner);
            let positioner = Arc::clone(&positioner);
            tokio::spawn(async move { runner.run(&line(3), positioner.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.abort();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.final_state, ControllerState::Aborted);
        assert_eq!(summary.points_completed, 0);
        assert!(positioner.is_aborted());
        assert!(runner.pause("operator", &model()).await.is_err());
    }

    #[tokio::test]
    async fn test_positioner_fault_aborts_run() {
        let runner = ScanRunner::new("runner");
        let positioner = MockPositioner::new("stage").with_fault("x", 2.0);
        let err = runner.run(&line(4), &positioner).await.unwrap_err();
        assert!(matches!(err, ScanError::Positioner(_)));
        assert_eq!(runner.state(), ControllerState::Aborted);
        assert_eq!(positioner.move_count(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_pause_owner_is_logged() {
        let runner = ScanRunner::new("runner");
        runner.pause("operator", &model()).await.unwrap();
        runner.pause("watchdog", &model()).await.unwrap();

        assert!(logs_contain("paused by 'operator' (x dropped)"));
        assert!(logs_contain("pause by 'watchdog' ignored"));
    }
}
