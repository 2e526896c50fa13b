//! Side-Effect Dispatcher
//!
//! Turns a completed transition into independent jobs (event attestation,
//! work attestation, notification, one email per counterparty) and runs them
//! on a fixed pool of worker tasks sharing one bounded queue.
//!
//! `dispatch` never waits on a job: a full queue sends the job straight to
//! the dead-letter log. Every job failure is logged and dead-lettered; nothing
//! is retried and nothing reaches the caller of the transition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::{
    attestation::AttestationPipeline,
    config::DispatcherConfig,
    email::{EmailGateway, EmailKind, EmailMessage},
    models::{CompletedTransition, EscrowEvent, Transaction},
    notification::{Notification, NotificationGateway},
};

/// Category of a side-effect job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Attestation,
    IpAttestation,
    Notification,
    Email,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Attestation => "attestation",
            Self::IpAttestation => "ip_attestation",
            Self::Notification => "notification",
            Self::Email => "email",
        };
        f.write_str(name)
    }
}

/// Work carried by one job; payloads are owned clones
#[derive(Debug, Clone)]
pub enum SideEffectJob {
    Attestation,
    IpAttestation(Arc<Transaction>),
    Notification(Notification),
    Email(EmailMessage),
}

impl SideEffectJob {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Attestation => JobKind::Attestation,
            Self::IpAttestation(_) => JobKind::IpAttestation,
            Self::Notification(_) => JobKind::Notification,
            Self::Email(_) => JobKind::Email,
        }
    }
}

struct QueuedJob {
    job: SideEffectJob,
    event: Arc<EscrowEvent>,
}

/// A failed side-effect job
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job_kind: JobKind,
    pub event_type: String,
    pub transaction_id: String,
    pub actor: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded in-memory record of failed jobs, oldest dropped first
pub struct DeadLetterLog {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    async fn push(&self, kind: JobKind, event: &EscrowEvent, error: String) {
        error!(
            job_kind = %kind,
            event_type = %event.event_type,
            transaction_id = %event.escrow_id,
            actor = %event.actor,
            error = %error,
            "Side effect failed"
        );

        let mut entries = self.entries.lock().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            job_kind: kind,
            event_type: event.event_type.as_str().to_string(),
            transaction_id: event.escrow_id.clone(),
            actor: event.actor.clone(),
            error,
            failed_at: Utc::now(),
        });
    }

    pub async fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

/// Collaborators shared by every worker
struct WorkerContext {
    pipeline: Arc<AttestationPipeline>,
    notifications: Arc<dyn NotificationGateway>,
    email: Arc<dyn EmailGateway>,
    job_timeout: Duration,
    dead_letters: Arc<DeadLetterLog>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerContext {
    async fn run(&self, queued: &QueuedJob) -> anyhow::Result<()> {
        let event = queued.event.as_ref();
        match &queued.job {
            SideEffectJob::Attestation => {
                self.bounded(self.pipeline.attest_event(event)).await?;
            }
            SideEffectJob::IpAttestation(transaction) => {
                self.bounded(self.pipeline.attest_work(event, transaction)).await?;
            }
            SideEffectJob::Notification(notification) => {
                self.bounded(self.notifications.publish(notification)).await?;
            }
            SideEffectJob::Email(message) => {
                self.bounded(self.email.send(message)).await?;
            }
        }
        Ok(())
    }

    async fn bounded<T, E, F>(&self, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        match tokio::time::timeout(self.job_timeout, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(anyhow::anyhow!(
                "timed out after {} ms",
                self.job_timeout.as_millis()
            )),
        }
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Worker pool executing side effects of completed transitions
pub struct SideEffectDispatcher {
    job_tx: mpsc::Sender<QueuedJob>,
    dead_letters: Arc<DeadLetterLog>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    notification_prefix: String,
    worker_count: usize,
}

impl SideEffectDispatcher {
    /// Spawn the worker tasks. Must be called inside a Tokio runtime.
    pub fn start(
        config: &DispatcherConfig,
        pipeline: Arc<AttestationPipeline>,
        notifications: Arc<dyn NotificationGateway>,
        email: Arc<dyn EmailGateway>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<QueuedJob>(config.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));

        let dead_letters = Arc::new(DeadLetterLog::new(config.dead_letter_capacity));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let notification_prefix = notifications.channel_prefix().to_string();

        let context = Arc::new(WorkerContext {
            pipeline,
            notifications,
            email,
            job_timeout: config.job_timeout(),
            dead_letters: Arc::clone(&dead_letters),
            in_flight: Arc::clone(&in_flight),
            idle: Arc::clone(&idle),
        });

        let worker_count = config.workers.max(1);
        for worker_id in 0..worker_count {
            let job_rx = Arc::clone(&job_rx);
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                worker_task(worker_id, job_rx, context).await;
            });
        }

        info!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            "Side-effect dispatcher started"
        );

        Self {
            job_tx,
            dead_letters,
            in_flight,
            idle,
            notification_prefix,
            worker_count,
        }
    }

    /// Enqueue every side effect of `transition`; returns how many jobs were queued
    pub async fn dispatch(&self, transition: &CompletedTransition) -> usize {
        let event = Arc::new(transition.event.clone());
        let jobs = self.plan_jobs(&event, &transition.transaction);
        let total = jobs.len();

        let mut queued = 0;
        for job in jobs {
            if self.enqueue(job, Arc::clone(&event)).await {
                queued += 1;
            }
        }

        debug!(
            event_type = %event.event_type,
            transaction_id = %event.escrow_id,
            queued,
            total,
            "Side effects dispatched"
        );
        queued
    }

    /// Jobs produced by one event
    fn plan_jobs(&self, event: &EscrowEvent, transaction: &Transaction) -> Vec<SideEffectJob> {
        let mut jobs = vec![SideEffectJob::Attestation];

        if event.event_type.ip_attestation_type().is_some() {
            jobs.push(SideEffectJob::IpAttestation(Arc::new(transaction.clone())));
        }

        jobs.push(SideEffectJob::Notification(Notification::new(
            &self.notification_prefix,
            &event.escrow_id,
            event.event_type,
            serde_json::json!({
                "transaction_id": event.escrow_id,
                "milestone_id": event.milestone_id,
                "actor": event.actor,
                "status": transaction.effective_status(),
                "metadata": event.metadata,
            }),
        )));

        if let Some(kind) = EmailKind::for_event(event.event_type) {
            for party in transaction.parties() {
                if party == event.actor {
                    continue;
                }
                if let Some(address) = transaction.email_for(&party) {
                    jobs.push(SideEffectJob::Email(EmailMessage::compose(
                        kind,
                        address,
                        transaction,
                        event.milestone_id.as_deref(),
                        &event.actor,
                    )));
                }
            }
        }

        jobs
    }

    async fn enqueue(&self, job: SideEffectJob, event: Arc<EscrowEvent>) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let kind = job.kind();

        match self.job_tx.try_send(QueuedJob { job, event }) {
            Ok(()) => true,
            Err(rejected) => {
                let reason = match &rejected {
                    mpsc::error::TrySendError::Full(_) => "side-effect queue full",
                    mpsc::error::TrySendError::Closed(_) => "side-effect workers stopped",
                };
                let queued = rejected.into_inner();
                warn!(
                    job_kind = %kind,
                    transaction_id = %queued.event.escrow_id,
                    reason,
                    "Side effect not queued"
                );
                self.dead_letters.push(kind, &queued.event, reason.to_string()).await;
                if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.idle.notify_waiters();
                }
                false
            }
        }
    }

    /// Wait until no job is queued or running; `false` if `timeout` elapsed first
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// Snapshot of the dead-letter log
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.snapshot().await
    }

    /// Jobs queued or running right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

async fn worker_task(
    worker_id: usize,
    job_rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    context: Arc<WorkerContext>,
) {
    debug!(worker_id, "Side-effect worker started");

    loop {
        let queued = {
            let mut rx = job_rx.lock().await;
            match rx.recv().await {
                Some(job) => job,
                None => {
                    debug!(worker_id, "Side-effect worker shutting down (queue closed)");
                    return;
                }
            }
        };

        let kind = queued.job.kind();
        match context.run(&queued).await {
            Ok(()) => debug!(
                worker_id,
                job_kind = %kind,
                event_type = %queued.event.event_type,
                transaction_id = %queued.event.escrow_id,
                "Side effect completed"
            ),
            Err(e) => {
                context
                    .dead_letters
                    .push(kind, &queued.event, format!("{:#}", e))
                    .await;
            }
        }
        context.finish_one();
    }
}
