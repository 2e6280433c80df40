//! Scheduling of harvester polling loops.
//!
//! Every running harvester owns one task. Passes from different harvesters
//! run concurrently up to the semaphore's limit; sleeps between passes hold
//! no permit.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::harvest::pipeline::IngestionPipeline;
use crate::harvest::traits::{
    HarvestContext, Harvester, HarvesterState, HarvesterStatus, PassReport, RunSignal,
};

struct RunToken {
    signal: Arc<RunSignal>,
    task: JoinHandle<()>,
}

/// A registered harvester plus its status surface and current run.
pub struct HarvesterHandle {
    harvester: Arc<dyn Harvester>,
    status: Mutex<HarvesterStatus>,
    run: Mutex<Option<RunToken>>,
    /// Held by the polling loop for its whole life
    exclusive: Arc<tokio::sync::Mutex<()>>,
}

impl HarvesterHandle {
    pub fn new(harvester: Arc<dyn Harvester>) -> Arc<Self> {
        let status = HarvesterStatus::new(harvester.settings());
        Arc::new(Self {
            harvester,
            status: Mutex::new(status),
            run: Mutex::new(None),
            exclusive: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn id(&self) -> &str {
        &self.harvester.settings().id
    }

    pub fn harvester(&self) -> &Arc<dyn Harvester> {
        &self.harvester
    }

    pub fn status(&self) -> HarvesterStatus {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|token| !token.task.is_finished())
    }

    /// Asks the current run to stop; false when nothing was running.
    ///
    /// The run stays attached until its task ends, which happens once the
    /// in-flight adapter call returns. Until then the harvester cannot be
    /// started again. Use [`join`](Self::join) to wait for it.
    pub fn stop(&self) -> bool {
        let run = self.run.lock();
        let Some(token) = run.as_ref() else {
            return false;
        };
        token.signal.stop();
        self.status.lock().active = false;
        true
    }

    /// Waits for the current run to end on its own.
    pub async fn join(&self) {
        let token = self.run.lock().take();
        if let Some(token) = token {
            if let Err(e) = token.task.await {
                error!(harvester = %self.id(), error = %e, "harvester task failed");
            }
        }
    }

    fn set_state(&self, state: HarvesterState) {
        self.status.lock().state = state;
    }

    /// Marks the run stopped unless a newer run has replaced it.
    fn finish_run(&self, signal: &Arc<RunSignal>) {
        let current = self
            .run
            .lock()
            .as_ref()
            .map_or(true, |token| Arc::ptr_eq(&token.signal, signal));
        if current {
            let mut status = self.status.lock();
            status.state = HarvesterState::Stopped;
            status.active = false;
        }
    }
}

pub struct HarvesterExecutor {
    semaphore: Arc<Semaphore>,
    pipeline: Arc<IngestionPipeline>,
    clock: Arc<dyn Clock>,
}

impl HarvesterExecutor {
    pub fn new(
        concurrency_limit: usize,
        pipeline: Arc<IngestionPipeline>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            pipeline,
            clock,
        }
    }

    /// Spawns the polling loop; false when the harvester is running or a
    /// stopped run is still finishing its pass.
    pub fn start(&self, handle: &Arc<HarvesterHandle>) -> bool {
        let mut run = handle.run.lock();
        let Ok(exclusive) = handle.exclusive.clone().try_lock_owned() else {
            return false;
        };
        let signal = Arc::new(RunSignal::new());
        {
            let mut status = handle.status.lock();
            status.state = HarvesterState::Running;
            status.active = true;
        }
        let task = tokio::spawn(run_loop(
            handle.clone(),
            exclusive,
            signal.clone(),
            self.semaphore.clone(),
            self.pipeline.clone(),
            self.clock.clone(),
        ));
        *run = Some(RunToken { signal, task });
        true
    }
}

#[instrument(skip_all, fields(harvester = %handle.id()))]
async fn run_loop(
    handle: Arc<HarvesterHandle>,
    _exclusive: OwnedMutexGuard<()>,
    signal: Arc<RunSignal>,
    semaphore: Arc<Semaphore>,
    pipeline: Arc<IngestionPipeline>,
    clock: Arc<dyn Clock>,
) {
    let settings = handle.harvester.settings().clone();
    let mut empty_polls = 0u32;

    while signal.is_active() {
        let result = {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "executor closed");
                    break;
                }
            };
            if !signal.is_active() {
                break;
            }
            handle.set_state(HarvesterState::Running);
            info!(class = %settings.class_name, "starting harvest pass");
            let ctx = HarvestContext::new(
                settings.id.clone(),
                signal.clone(),
                pipeline.clone(),
                clock.clone(),
            );
            handle.harvester.run_pass(&ctx).await
        };

        let ingested = record_pass(&handle, &result, clock.now());
        if ingested == 0 {
            empty_polls += 1;
        } else {
            empty_polls = 0;
        }

        if !settings.monitor {
            break;
        }
        if settings.max_empty_polls.is_some_and(|max| empty_polls >= max) {
            info!(empty_polls, "no new entries, stopping");
            break;
        }
        handle.set_state(HarvesterState::Sleeping);
        if !signal.sleep(settings.sleep).await {
            break;
        }
    }

    info!("harvester stopped");
    handle.finish_run(&signal);
}

/// Records a pass on the status surface; returns the number ingested.
fn record_pass(
    handle: &HarvesterHandle,
    result: &crate::error::Result<PassReport>,
    at: chrono::DateTime<chrono::Utc>,
) -> usize {
    let mut status = handle.status.lock();
    match result {
        Ok(report) => {
            info!(
                found = report.found,
                ingested = report.ingested,
                duplicates = report.duplicates,
                skipped = report.skipped_sources,
                "finished harvest pass"
            );
            status.record(report, at);
            report.ingested
        }
        Err(e) => {
            warn!(error = %e, "harvest pass failed");
            status.record_error(e, at);
            0
        }
    }
}
