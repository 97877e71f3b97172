use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::job::{AttemptOutcome, DispatchAttempt, DispatchJob, SkippedGroup};
use super::pacing::PacingConfig;
use super::state::{Command, RunState};
use crate::error::GroupMailError;
use crate::progress::{ProgressSnapshot, ProgressStore};
use crate::report::DispatchReport;
use crate::transport::Transport;

/// Operator request observed at the next job boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Pause,
    Cancel,
}

impl Request {
    fn command(self) -> Command {
        match self {
            Request::Pause => Command::Pause,
            Request::Cancel => Command::Cancel,
        }
    }
}

struct SchedulerState {
    snapshot: ProgressSnapshot,
    request: Option<Request>,
}

/// How a single job's delivery loop ended.
enum Delivery {
    /// The job reached a terminal attempt and `next_index` moved past it.
    Done,
    /// A pause or cancel arrived between retries of the same job.
    Interrupted,
}

/// Sends an ordered list of jobs through a [`Transport`], one attempt at a
/// time, persisting progress after every state change.
///
/// All commands take `&self`; share the scheduler through an `Arc` to pause
/// or cancel from another task while [`start`](Self::start) or
/// [`resume`](Self::resume) is driving the run.
pub struct DispatchScheduler<T, S> {
    jobs: Vec<DispatchJob>,
    pacing: PacingConfig,
    transport: T,
    store: S,
    state: Mutex<SchedulerState>,
    wake: Notify,
    status: watch::Sender<ProgressSnapshot>,
}

impl<T: Transport, S: ProgressStore> DispatchScheduler<T, S> {
    /// Fresh scheduler in IDLE. Any snapshot already in `store` is ignored
    /// and will be overwritten on start.
    pub fn new(
        jobs: Vec<DispatchJob>,
        pacing: PacingConfig,
        transport: T,
        store: S,
    ) -> Result<Self, GroupMailError> {
        pacing.validate()?;
        let snapshot = ProgressSnapshot::new(jobs.iter().map(|j| j.id.clone()).collect());
        Ok(Self::with_snapshot(jobs, pacing, transport, store, snapshot))
    }

    /// Scheduler continuing from the snapshot in `store`, or fresh when
    /// there is none.
    ///
    /// Fails with [`GroupMailError::StaleProgress`] when the saved job list
    /// differs from `jobs`.
    pub fn restore(
        jobs: Vec<DispatchJob>,
        pacing: PacingConfig,
        transport: T,
        store: S,
    ) -> Result<Self, GroupMailError> {
        pacing.validate()?;
        let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let snapshot = match store.load()? {
            Some(mut saved) => {
                if !saved.matches(&ids) || saved.next_index > ids.len() {
                    return Err(GroupMailError::StaleProgress {
                        saved: saved.job_ids.len(),
                        current: ids.len(),
                    });
                }
                saved.state = saved.state.on_restore();
                info!(
                    next_index = saved.next_index,
                    total = ids.len(),
                    state = %saved.state,
                    "Restored dispatch progress"
                );
                saved
            }
            None => ProgressSnapshot::new(ids),
        };
        Ok(Self::with_snapshot(jobs, pacing, transport, store, snapshot))
    }

    fn with_snapshot(
        jobs: Vec<DispatchJob>,
        pacing: PacingConfig,
        transport: T,
        store: S,
        snapshot: ProgressSnapshot,
    ) -> Self {
        let (status, _) = watch::channel(snapshot.clone());
        Self {
            jobs,
            pacing,
            transport,
            store,
            state: Mutex::new(SchedulerState {
                snapshot,
                request: None,
            }),
            wake: Notify::new(),
            status,
        }
    }

    pub fn run_state(&self) -> RunState {
        self.lock().snapshot.state
    }

    /// Read-only copy of the current progress.
    pub fn current_snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot.clone()
    }

    /// Receives a fresh snapshot after every persisted change.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.status.subscribe()
    }

    /// IDLE → RUNNING, then dispatch until completed, paused or aborted.
    pub async fn start(&self) -> Result<RunState, GroupMailError> {
        if self.jobs.is_empty() {
            return Err(GroupMailError::invalid_operation("no jobs to dispatch"));
        }
        self.transition(Command::Start)?;
        info!(jobs = self.jobs.len(), "Dispatch started");
        self.drive().await
    }

    /// PAUSED → RUNNING, then dispatch from the saved position.
    pub async fn resume(&self) -> Result<RunState, GroupMailError> {
        self.transition(Command::Resume)?;
        info!(
            next_index = self.lock().snapshot.next_index,
            "Dispatch resumed"
        );
        self.drive().await
    }

    /// Ask a running dispatch to stop at the next job boundary.
    pub fn pause(&self) -> Result<(), GroupMailError> {
        self.request(Request::Pause)
    }

    /// Abort the run: immediately when paused, at the next job boundary
    /// when running.
    pub fn cancel(&self) -> Result<(), GroupMailError> {
        {
            let mut state = self.lock();
            if state.snapshot.state == RunState::Paused {
                let next = state.snapshot.state.apply(Command::Cancel)?;
                self.commit(&mut state, |s| s.state = next)?;
                info!("Dispatch cancelled while paused");
                return Ok(());
            }
        }
        self.request(Request::Cancel)
    }

    /// Operator interrupt such as Ctrl-C: the first asks for a pause, any
    /// later one for a cancel.
    ///
    /// Unlike [`pause`](Self::pause) this is also accepted before the run
    /// reaches RUNNING; the request then takes effect at the first job
    /// boundary after `start` or `resume`.
    pub fn interrupt(&self) -> Result<Command, GroupMailError> {
        let mut state = self.lock();
        if state.snapshot.state.is_terminal() {
            return Err(GroupMailError::invalid_operation(format!(
                "cannot interrupt while {}",
                state.snapshot.state
            )));
        }
        let request = match state.request {
            None => Request::Pause,
            Some(_) => Request::Cancel,
        };
        state.request = Some(request);
        drop(state);
        debug!(?request, "Interrupt queued");
        self.wake.notify_waiters();
        Ok(request.command())
    }

    /// Operator summary for the run so far.
    pub fn report(&self, skipped: &[SkippedGroup]) -> DispatchReport {
        DispatchReport::compile(&self.jobs, &self.current_snapshot(), skipped)
    }

    fn request(&self, request: Request) -> Result<(), GroupMailError> {
        let mut state = self.lock();
        if state.snapshot.state != RunState::Running {
            return Err(GroupMailError::invalid_operation(format!(
                "cannot {} while {}",
                request.command(),
                state.snapshot.state
            )));
        }
        // Cancel wins over a pending pause.
        if state.request != Some(Request::Cancel) {
            state.request = Some(request);
        }
        drop(state);
        debug!(?request, "Run request queued");
        self.wake.notify_waiters();
        Ok(())
    }

    #[instrument(name = "dispatch_run", skip(self), fields(jobs = self.jobs.len()))]
    async fn drive(&self) -> Result<RunState, GroupMailError> {
        let result = self.drive_inner().await;
        if let Err(e) = &result {
            error!(error = %e, "Dispatch stopped on error");
            // Leave the run resumable in memory; the store keeps the last good snapshot.
            let mut state = self.lock();
            if state.snapshot.state == RunState::Running {
                state.snapshot.state = RunState::Paused;
                state.request = None;
                self.status.send_replace(state.snapshot.clone());
            }
        }
        result
    }

    async fn drive_inner(&self) -> Result<RunState, GroupMailError> {
        let total = self.jobs.len();
        loop {
            if let Some(state) = self.honor_request()? {
                return Ok(state);
            }

            let start = self.lock().snapshot.next_index;
            if start >= total {
                self.transition(Command::Finish)?;
                let snapshot = self.current_snapshot();
                info!(
                    total,
                    succeeded = snapshot.succeeded(),
                    "Dispatch completed"
                );
                return Ok(RunState::Completed);
            }

            let end = (start + self.pacing.batch_size).min(total);
            debug!(start, end, "Batch started");

            let mut interrupted = false;
            for index in start..end {
                if index > start && self.has_request() {
                    interrupted = true;
                    break;
                }
                if let Delivery::Interrupted = self.deliver(index).await? {
                    interrupted = true;
                    break;
                }
                if index + 1 < end {
                    self.wait(self.pacing.inter_job_delay).await;
                }
            }

            if !interrupted && end < total {
                debug!(next = end, "Batch finished, waiting before next batch");
                self.wait(self.pacing.inter_batch_delay).await;
            }
        }
    }

    /// Attempt `jobs[index]` until it reaches a terminal outcome or an
    /// operator request arrives between retries.
    async fn deliver(&self, index: usize) -> Result<Delivery, GroupMailError> {
        let job = &self.jobs[index];
        let max_attempts = self.pacing.max_attempts_per_job;

        // The limit may have been lowered since the saved attempt was made.
        let exhausted = matches!(
            self.lock().snapshot.latest_attempt(&job.id),
            Some(last) if last.is_terminal(max_attempts)
        );
        if exhausted {
            warn!(job_id = %job.id, recipient = %job.recipient, max_attempts, "Attempt limit already reached, not resending");
            let mut state = self.lock();
            self.commit(&mut state, |s| s.next_index = index + 1)?;
            return Ok(Delivery::Done);
        }

        loop {
            let attempt = self.next_attempt_number(&job.id);
            debug!(job_id = %job.id, recipient = %job.recipient, attempt, "Sending");

            let outcome = self.transport.send(&job.recipient, &job.payload).await;
            let record = DispatchAttempt::new(job.id.clone(), attempt, outcome);
            let terminal = record.is_terminal(max_attempts);

            match &record.outcome {
                AttemptOutcome::Success => {
                    info!(job_id = %job.id, group = %job.group_key, recipient = %job.recipient, attempt, "Delivered");
                }
                AttemptOutcome::TransientFailure(detail) if terminal => {
                    error!(job_id = %job.id, recipient = %job.recipient, attempt, %detail, "Giving up after transient failures");
                }
                AttemptOutcome::TransientFailure(detail) => {
                    warn!(job_id = %job.id, recipient = %job.recipient, attempt, max_attempts, %detail, "Transient failure, will retry");
                }
                AttemptOutcome::PermanentFailure(detail) => {
                    error!(job_id = %job.id, recipient = %job.recipient, attempt, %detail, "Permanent failure");
                }
            }

            {
                let mut state = self.lock();
                self.commit(&mut state, |s| {
                    s.attempts.insert(record.job_id.clone(), record);
                    if terminal {
                        s.next_index = index + 1;
                    }
                })?;
            }

            if terminal {
                return Ok(Delivery::Done);
            }
            if self.has_request() {
                return Ok(Delivery::Interrupted);
            }
            self.wait(self.pacing.retry_backoff.delay_for_attempt(attempt))
                .await;
            if self.has_request() {
                return Ok(Delivery::Interrupted);
            }
        }
    }

    /// Continue the attempt count of a job interrupted mid-retry.
    fn next_attempt_number(&self, job_id: &str) -> u32 {
        match self.lock().snapshot.latest_attempt(job_id) {
            Some(last) if matches!(last.outcome, AttemptOutcome::TransientFailure(_)) => {
                last.attempt + 1
            }
            _ => 1,
        }
    }

    fn honor_request(&self) -> Result<Option<RunState>, GroupMailError> {
        let mut state = self.lock();
        let Some(request) = state.request.take() else {
            return Ok(None);
        };
        let next = state.snapshot.state.apply(request.command())?;
        self.commit(&mut state, |s| s.state = next)?;
        info!(
            state = %next,
            next_index = state.snapshot.next_index,
            "Dispatch stopped at job boundary"
        );
        Ok(Some(next))
    }

    fn transition(&self, command: Command) -> Result<RunState, GroupMailError> {
        let mut state = self.lock();
        let next = state.snapshot.state.apply(command)?;
        self.commit(&mut state, |s| s.state = next)?;
        Ok(next)
    }

    fn has_request(&self) -> bool {
        self.lock().request.is_some()
    }

    /// Mutate the snapshot, persist it, and notify subscribers.
    fn commit(
        &self,
        state: &mut SchedulerState,
        change: impl FnOnce(&mut ProgressSnapshot),
    ) -> Result<(), GroupMailError> {
        change(&mut state.snapshot);
        state.snapshot.updated_at = Utc::now();
        self.store.save(&state.snapshot)?;
        self.status.send_replace(state.snapshot.clone());
        Ok(())
    }

    /// Sleep for `delay`, returning early if a pause or cancel arrives.
    async fn wait(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.has_request() {
            return;
        }
        tokio::select! {
            _ = sleep(delay) => {}
            _ = notified => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
