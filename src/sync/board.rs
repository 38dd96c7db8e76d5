//! Observer-side view of jobs, reconciled from polls and pushes.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::WsMessage;
use crate::jobs::Job;

/// Finished jobs a board remembers by default.
pub const DEFAULT_FINISHED_CAPACITY: usize = 256;

/// Local job state for one observer.
///
/// Updates are idempotent: applying a state the board already holds is a
/// no-op. Snapshots older than what the board has seen are ignored, so a
/// late poll cannot roll a job back. Only the most recently finished jobs
/// are kept; older ones are evicted first-in first-out.
#[derive(Debug)]
pub struct JobBoard {
    active: HashMap<Uuid, Job>,
    finished: HashMap<Uuid, Job>,
    /// Finish order, oldest first.
    finished_order: VecDeque<Uuid>,
    finished_capacity: usize,
    watched: HashSet<Uuid>,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::with_finished_capacity(DEFAULT_FINISHED_CAPACITY)
    }
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_finished_capacity(capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            finished_capacity: capacity.max(1),
            watched: HashSet::new(),
        }
    }

    fn insert_finished(&mut self, job: Job) {
        if self.finished.insert(job.id, job.clone()).is_none() {
            self.finished_order.push_back(job.id);
        }
        while self.finished_order.len() > self.finished_capacity {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// Apply one job snapshot. Returns whether the board changed.
    pub fn apply_update(&mut self, job: Job) -> bool {
        if let Some(done) = self.finished.get(&job.id) {
            // Terminal is final; anything else is a stale read.
            if !job.stage.is_terminal() || *done == job || job.updated_at < done.updated_at {
                return false;
            }
            self.insert_finished(job);
            return true;
        }

        if let Some(known) = self.active.get(&job.id) {
            if *known == job || known.updated_at > job.updated_at {
                return false;
            }
        }

        if job.stage.is_terminal() {
            self.active.remove(&job.id);
            self.watched.remove(&job.id);
            self.insert_finished(job);
        } else {
            self.active.insert(job.id, job);
        }
        true
    }

    /// Replace the active set with a full snapshot.
    ///
    /// Returns ids that were active locally but are missing from the
    /// snapshot; their final state must be fetched separately.
    pub fn apply_init(&mut self, jobs: Vec<Job>) -> Vec<Uuid> {
        self.reconcile_active(jobs)
    }

    /// Reconcile against a fresh active listing by identity.
    ///
    /// Every listed job is applied as an update. Jobs known locally (active
    /// or watched) that are absent from the listing have left the active set;
    /// they are dropped from the active view, watched ids among them are
    /// pruned, and their ids are returned so the caller can fetch the final
    /// record.
    pub fn reconcile_active(&mut self, jobs: Vec<Job>) -> Vec<Uuid> {
        let listed: HashSet<Uuid> = jobs.iter().map(|j| j.id).collect();

        let mut departed: Vec<Uuid> = self
            .active
            .keys()
            .chain(self.watched.iter())
            .filter(|id| !listed.contains(id))
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        departed.sort();

        for id in &departed {
            self.active.remove(id);
        }
        self.watched.retain(|id| listed.contains(id));

        for job in jobs {
            self.apply_update(job);
        }
        departed
    }

    /// Apply a push message. Returns ids needing a final fetch (init only).
    pub fn apply_message(&mut self, msg: WsMessage) -> Vec<Uuid> {
        match msg {
            WsMessage::Init { jobs } => self.apply_init(jobs),
            WsMessage::Update { job } => {
                self.apply_update(job);
                Vec::new()
            }
        }
    }

    /// Keep polling for `id` even before it shows up as active.
    pub fn watch(&mut self, id: Uuid) {
        if !self.finished.contains_key(&id) {
            self.watched.insert(id);
        }
    }

    pub fn is_watched(&self, id: Uuid) -> bool {
        self.watched.contains(&id)
    }

    /// Whether a poll would be useful.
    pub fn needs_polling(&self) -> bool {
        !self.active.is_empty() || !self.watched.is_empty()
    }

    /// Latest known state of `id`, active or finished.
    pub fn get(&self, id: Uuid) -> Option<&Job> {
        self.active.get(&id).or_else(|| self.finished.get(&id))
    }

    /// Active jobs ordered by creation time.
    pub fn active(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.active.values().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Active jobs that have sat in their current stage longer than
    /// `threshold`. Display only.
    pub fn stalled(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> Vec<&Job> {
        self.active()
            .into_iter()
            .filter(|job| is_stalled(job, now, threshold))
            .collect()
    }
}

/// Whether `job` should be labelled stalled.
pub fn is_stalled(job: &Job, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    !job.stage.is_terminal() && job.time_in_stage(now) > threshold
}
