// Periodic maintenance scheduler
//
// One task per maintenance job, each on its own interval from config. An
// interval of zero disables the job. A run that overlaps the next tick
// delays it rather than piling up.

use std::time::Duration;

use metrics::counter;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tasks::{run_task, MaintenanceTask};
use crate::AppState;

pub(crate) struct Scheduler {
    tasks: JoinSet<()>,
}

impl Scheduler {
    /// Wait for every job to observe cancellation and stop.
    pub(crate) async fn shutdown(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Scheduler task failed");
            }
        }
        debug!("Scheduler stopped");
    }
}

pub(crate) fn spawn(state: &AppState) -> Scheduler {
    let lifecycle = &state.config.lifecycle;
    let jobs = [
        (MaintenanceTask::Archive, lifecycle.archive_interval_secs),
        (MaintenanceTask::Clean, lifecycle.clean_interval_secs),
        (MaintenanceTask::Retention, lifecycle.retention_interval_secs),
        (
            MaintenanceTask::PruneSnapshots,
            state.config.snapshot.prune_interval_secs,
        ),
    ];

    let mut tasks = JoinSet::new();
    for (task, secs) in jobs {
        if secs == 0 {
            info!(task = task.as_str(), "Scheduled job disabled");
            continue;
        }
        let period = Duration::from_secs(secs);
        info!(task = task.as_str(), interval_secs = secs, "Scheduled job registered");
        tasks.spawn(run_periodic(
            state.clone(),
            task,
            period,
            state.shutdown.child_token(),
        ));
    }
    Scheduler { tasks }
}

async fn run_periodic(state: AppState, task: MaintenanceTask, period: Duration, cancel: CancellationToken) {
    // First run one full period after startup
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match run_task(&state, task).await {
            Ok(report) => {
                counter!("edgestat.scheduler.runs", "task" => task.as_str()).increment(1);
                debug!(task = task.as_str(), report = %report, "Scheduled job finished");
            }
            Err(e) => {
                counter!("edgestat.scheduler.failures", "task" => task.as_str()).increment(1);
                warn!(task = task.as_str(), error = %e, "Scheduled job failed");
            }
        }
    }
}
