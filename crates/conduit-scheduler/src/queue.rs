//! Ready queue for job instances awaiting a slot.

use conduit_core::run::JobKey;
use petgraph::graph::NodeIndex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A ready instance waiting for execution.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub node: NodeIndex,
    pub key: JobKey,
    pub template_index: usize,
    pub matrix_index: usize,
    /// Groups this job occupies a slot in while running.
    pub concurrency_groups: Vec<String>,
}

impl QueuedJob {
    fn order_key(&self) -> (usize, usize, String) {
        (self.template_index, self.matrix_index, self.key.to_string())
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: earliest declaration, then matrix position, then name first
        other.order_key().cmp(&self.order_key())
    }
}

/// Queue manager for ready instances.
///
/// Dequeue order is deterministic. A job whose concurrency groups are all
/// full is passed over until `complete` frees a slot.
#[derive(Debug, Default)]
pub struct QueueManager {
    queue: BinaryHeap<QueuedJob>,
    concurrency_groups: HashMap<String, usize>,
    concurrency_limits: HashMap<String, usize>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group for jobs sharing a `resource_class`.
    pub fn resource_group(class: &str) -> String {
        format!("class:{}", class)
    }

    /// Group for the matrix instances of one template.
    pub fn matrix_group(template: &str) -> String {
        format!("matrix:{}", template)
    }

    /// Add a job to the queue.
    pub fn enqueue(&mut self, job: QueuedJob) {
        self.queue.push(job);
    }

    /// Get the next job that can be executed, claiming its group slots.
    pub fn dequeue(&mut self) -> Option<QueuedJob> {
        let mut temp = Vec::new();
        let mut result = None;

        while let Some(job) = self.queue.pop() {
            if self.can_execute(&job) {
                for group in &job.concurrency_groups {
                    *self.concurrency_groups.entry(group.clone()).or_insert(0) += 1;
                }
                result = Some(job);
                break;
            }
            temp.push(job);
        }

        // Put back jobs that couldn't be executed
        self.queue.extend(temp);

        result
    }

    /// Mark a job as completed, freeing up concurrency slots.
    pub fn complete(&mut self, job: &QueuedJob) {
        for group in &job.concurrency_groups {
            if let Some(count) = self.concurrency_groups.get_mut(group) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Drop every queued job, returning them in dequeue order.
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(job) = self.queue.pop() {
            drained.push(job);
        }
        drained
    }

    /// Set the concurrency limit for a group. A limit of zero is raised to one.
    pub fn set_concurrency_limit(&mut self, group: String, limit: usize) {
        self.concurrency_limits.insert(group, limit.max(1));
    }

    /// Get the current queue length.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn can_execute(&self, job: &QueuedJob) -> bool {
        job.concurrency_groups.iter().all(|group| {
            let current = self.concurrency_groups.get(group).copied().unwrap_or(0);
            self.concurrency_limits
                .get(group)
                .is_none_or(|&limit| current < limit)
        })
    }
}
