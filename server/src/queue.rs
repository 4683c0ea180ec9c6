//! Job queue — spec.md §4.F.
//!
//! A registry of jobs plus an ordered id list. A single worker task
//! dequeues the first pending job (respecting priority-aware,
//! insertion-stable ordering), runs it through a configured processor,
//! and cooperatively observes cancellation/pause between commands.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ebb_protocol::{JobKind, JobPriority, JobState};
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{info, warn};

use crate::facade::MiniCommand;

const HISTORY_CAP: usize = 100;

#[derive(Debug, Clone)]
pub enum JobPayload {
    Commands(Vec<MiniCommand>),
    Svg(String),
}

impl JobPayload {
    /// Small preview used in JSON projections so large payloads are
    /// never shipped wholesale (spec.md §4.F).
    fn preview(&self) -> String {
        match self {
            JobPayload::Commands(cmds) => format!("{} command(s)", cmds.len()),
            JobPayload::Svg(doc) => format!("{} byte SVG", doc.len()),
        }
    }

    fn kind(&self) -> JobKind {
        match self {
            JobPayload::Commands(_) => JobKind::Commands,
            JobPayload::Svg(_) => JobKind::Svg,
        }
    }
}

pub struct Job {
    pub id: u64,
    pub priority: JobPriority,
    pub state: JobState,
    pub progress: u8,
    pub payload: JobPayload,
    pub error: Option<String>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: u64,
    pub priority: JobPriority,
    pub state: JobState,
    pub progress: u8,
    pub kind: JobKind,
    pub preview: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    fn view(&self) -> JobView {
        JobView {
            id: self.id,
            priority: self.priority,
            state: self.state,
            progress: self.progress,
            kind: self.payload.kind(),
            preview: self.payload.preview(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

struct Registry {
    jobs: HashMap<u64, Job>,
    order: VecDeque<u64>,
    history: VecDeque<JobView>,
    paused: bool,
    running: Option<u64>,
}

impl Registry {
    fn new() -> Self {
        Self { jobs: HashMap::new(), order: VecDeque::new(), history: VecDeque::new(), paused: false, running: None }
    }

    /// `first index where existing.priority < new.priority`.
    fn insert_position(&self, priority: JobPriority) -> usize {
        self.order
            .iter()
            .position(|id| self.jobs.get(id).map(|j| j.priority < priority).unwrap_or(false))
            .unwrap_or(self.order.len())
    }

    fn push_history(&mut self, view: JobView) {
        self.history.push_back(view);
        if self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
    }
}

/// Called by the worker loop to progress a running job one command at a
/// time, observing cancellation and pause between each.
pub trait JobProcessor: Send + Sync {
    fn process<'a>(
        &'a self,
        payload: &'a JobPayload,
        is_cancelled: &'a (dyn Fn() -> bool + Send + Sync),
        is_paused: &'a (dyn Fn() -> bool + Send + Sync),
        progress: &'a (dyn Fn(u8) + Send + Sync),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>>;
}

pub struct JobQueue {
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicU64,
    wake: Arc<Notify>,
    update_tx: mpsc::UnboundedSender<()>,
}

impl JobQueue {
    pub fn spawn(processor: Arc<dyn JobProcessor>) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let registry = Arc::new(RwLock::new(Registry::new()));
        let wake = Arc::new(Notify::new());
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let queue = Arc::new(Self { registry: registry.clone(), next_id: AtomicU64::new(1), wake: wake.clone(), update_tx: update_tx.clone() });

        tokio::spawn(worker_loop(registry, wake, processor, update_tx));

        (queue, update_rx)
    }

    pub async fn add(&self, priority: JobPriority, payload: JobPayload) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut reg = self.registry.write().await;
        let pos = reg.insert_position(priority);
        reg.order.insert(pos, id);
        reg.jobs.insert(
            id,
            Job {
                id,
                priority,
                state: JobState::Pending,
                progress: 0,
                payload,
                error: None,
                cancelled: false,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );
        drop(reg);
        let _ = self.update_tx.send(());
        self.wake.notify_one();
        info!(id, ?priority, "job queued");
        id
    }

    pub async fn cancel(&self, id: u64) -> bool {
        let mut reg = self.registry.write().await;
        let result = if reg.running == Some(id) {
            if let Some(job) = reg.jobs.get_mut(&id) {
                job.cancelled = true;
                job.state = JobState::Cancelled;
                true
            } else {
                false
            }
        } else if let Some(pos) = reg.order.iter().position(|x| *x == id) {
            reg.order.remove(pos);
            if let Some(mut job) = reg.jobs.remove(&id) {
                job.state = JobState::Cancelled;
                job.completed_at = Some(Utc::now());
                let view = job.view();
                reg.push_history(view);
            }
            true
        } else {
            false
        };
        drop(reg);
        if result {
            let _ = self.update_tx.send(());
        }
        result
    }

    pub async fn pause(&self) {
        let mut reg = self.registry.write().await;
        reg.paused = true;
        if let Some(running) = reg.running {
            if let Some(job) = reg.jobs.get_mut(&running) {
                job.state = JobState::Paused;
            }
        }
        drop(reg);
        let _ = self.update_tx.send(());
    }

    pub async fn resume(&self) {
        let mut reg = self.registry.write().await;
        reg.paused = false;
        if let Some(running) = reg.running {
            if let Some(job) = reg.jobs.get_mut(&running) {
                if job.state == JobState::Paused {
                    job.state = JobState::Running;
                }
            }
        }
        drop(reg);
        self.wake.notify_one();
        let _ = self.update_tx.send(());
    }

    pub async fn clear(&self) {
        let mut reg = self.registry.write().await;
        let running = reg.running;
        reg.order.retain(|id| running == Some(*id));
        let pending: Vec<u64> = reg.jobs.keys().copied().filter(|id| Some(*id) != running).collect();
        for id in pending {
            reg.jobs.remove(&id);
        }
        drop(reg);
        let _ = self.update_tx.send(());
    }

    pub async fn list(&self) -> Vec<JobView> {
        let reg = self.registry.read().await;
        reg.order.iter().filter_map(|id| reg.jobs.get(id)).map(|j| j.view()).collect()
    }

    pub async fn history(&self) -> Vec<JobView> {
        self.registry.read().await.history.iter().cloned().collect()
    }

    pub async fn is_paused(&self) -> bool {
        self.registry.read().await.paused
    }
}

async fn worker_loop(
    registry: Arc<RwLock<Registry>>,
    wake: Arc<Notify>,
    processor: Arc<dyn JobProcessor>,
    update_tx: mpsc::UnboundedSender<()>,
) {
    loop {
        let next = {
            let reg = registry.read().await;
            if reg.paused {
                None
            } else {
                reg.order.iter().find(|id| reg.jobs.get(id).map(|j| j.state == JobState::Pending).unwrap_or(false)).copied()
            }
        };

        let Some(id) = next else {
            wake.notified().await;
            continue;
        };

        {
            let mut reg = registry.write().await;
            if let Some(job) = reg.jobs.get_mut(&id) {
                job.state = JobState::Running;
                job.started_at = Some(Utc::now());
            }
            reg.running = Some(id);
        }
        let _ = update_tx.send(());

        let payload = {
            let reg = registry.read().await;
            match reg.jobs.get(&id) {
                Some(job) => job.payload.clone(),
                None => continue,
            }
        };

        let cancel_registry = registry.clone();
        let is_cancelled = move || {
            cancel_registry
                .try_read()
                .map(|r| r.jobs.get(&id).map(|j| j.cancelled).unwrap_or(true))
                .unwrap_or(false)
        };

        let pause_registry = registry.clone();
        let is_paused = move || pause_registry.try_read().map(|r| r.paused).unwrap_or(false);

        let progress_registry = registry.clone();
        let progress_tx = update_tx.clone();
        let progress = move |pct: u8| {
            if let Ok(mut r) = progress_registry.try_write() {
                if let Some(job) = r.jobs.get_mut(&id) {
                    job.progress = pct;
                }
            }
            let _ = progress_tx.send(());
        };

        let result = processor.process(&payload, &is_cancelled, &is_paused, &progress).await;

        let mut reg = registry.write().await;
        reg.running = None;
        if let Some(pos) = reg.order.iter().position(|x| *x == id) {
            reg.order.remove(pos);
        }
        if let Some(mut job) = reg.jobs.remove(&id) {
            match (&job.state, &result) {
                (JobState::Cancelled, _) => {}
                (_, Ok(())) => {
                    job.state = JobState::Completed;
                    job.progress = 100;
                }
                (_, Err(message)) => {
                    warn!(id, %message, "job failed");
                    job.state = JobState::Failed;
                    job.error = Some(message.clone());
                }
            }
            job.completed_at = Some(Utc::now());
            let view = job.view();
            reg.push_history(view);
        }
        drop(reg);
        let _ = update_tx.send(());
    }
}

#[derive(Clone)]
pub struct CommandsProcessor<F>
where
    F: Fn(MiniCommand) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync,
{
    pub execute_one: Arc<F>,
}

impl<F> JobProcessor for CommandsProcessor<F>
where
    F: Fn(MiniCommand) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync + 'static,
{
    fn process<'a>(
        &'a self,
        payload: &'a JobPayload,
        is_cancelled: &'a (dyn Fn() -> bool + Send + Sync),
        is_paused: &'a (dyn Fn() -> bool + Send + Sync),
        progress: &'a (dyn Fn(u8) + Send + Sync),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            let JobPayload::Commands(cmds) = payload else {
                return Err("commands processor received non-commands payload".to_string());
            };
            let total = cmds.len().max(1);
            for (i, cmd) in cmds.iter().enumerate() {
                while is_paused() && !is_cancelled() {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                if is_cancelled() {
                    return Ok(());
                }
                (self.execute_one)(cmd.clone()).await?;
                progress(((i + 1) * 100 / total) as u8);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProcessor;
    impl JobProcessor for NoopProcessor {
        fn process<'a>(
            &'a self,
            _payload: &'a JobPayload,
            _is_cancelled: &'a (dyn Fn() -> bool + Send + Sync),
            _is_paused: &'a (dyn Fn() -> bool + Send + Sync),
            progress: &'a (dyn Fn(u8) + Send + Sync),
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>> {
            Box::pin(async move {
                progress(100);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn higher_priority_job_jumps_ahead_of_lower_priority_peers() {
        let (queue, _rx) = JobQueue::spawn(Arc::new(NoopProcessor));
        queue.pause().await;
        let j1 = queue.add(JobPriority::Normal, JobPayload::Commands(vec![])).await;
        let j2 = queue.add(JobPriority::Normal, JobPayload::Commands(vec![])).await;
        let j3 = queue.add(JobPriority::High, JobPayload::Commands(vec![])).await;

        let order: Vec<u64> = queue.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(order, vec![j3, j1, j2]);
    }

    #[tokio::test]
    async fn completed_job_lands_in_history() {
        let (queue, _rx) = JobQueue::spawn(Arc::new(NoopProcessor));
        let id = queue.add(JobPriority::Normal, JobPayload::Commands(vec![])).await;
        for _ in 0..20 {
            if queue.history().await.iter().any(|j| j.id == id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let history = queue.history().await;
        assert!(history.iter().any(|j| j.id == id && j.state == JobState::Completed));
    }
}
