use anyhow::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::shared::serde_millis;

/// A rule queued for one batch, with its current cost estimate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub rule_id: String,
    pub cost: Duration,
}

impl WorkItem {
    pub fn new(rule_id: impl Into<String>, cost: Duration) -> Self {
        Self {
            rule_id: rule_id.into(),
            cost,
        }
    }
}

/// Per-worker observability for one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub executed: usize,
    pub steals: usize,
    #[serde(rename = "busy_ms", with = "serde_millis")]
    pub busy: Duration,
    #[serde(rename = "idle_ms", with = "serde_millis")]
    pub idle: Duration,
}

/// Everything a batch produced
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub results: Vec<R>,
    pub workers: Vec<WorkerStats>,
}

impl<R> BatchOutcome<R> {
    /// Number of items handed to the closure
    pub fn dispatched(&self) -> usize {
        self.workers.iter().map(|w| w.executed).sum()
    }

    pub fn steals(&self) -> usize {
        self.workers.iter().map(|w| w.steals).sum()
    }
}

/// Private deques of all workers. One lock covers every pop, steal and size
/// query, so an item can only ever leave a deque once.
struct DequeSet {
    deques: Vec<VecDeque<WorkItem>>,
}

impl DequeSet {
    /// LIFO from the worker's own tail
    fn pop_own(&mut self, worker: usize) -> Option<WorkItem> {
        self.deques[worker].pop_back()
    }

    /// FIFO from the head of the fullest other deque
    fn steal(&mut self, thief: usize) -> Option<WorkItem> {
        let victim = self
            .deques
            .iter()
            .enumerate()
            .filter(|(i, d)| *i != thief && !d.is_empty())
            .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
            .map(|(i, _)| i)?;
        self.deques[victim].pop_front()
    }
}

/// Largest-first, round-robin partitioned work-stealing scheduler for one batch
#[derive(Debug, Clone, Copy)]
pub struct WorkStealingScheduler {
    workers: usize,
}

impl WorkStealingScheduler {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Sort by descending cost (ties by id) and deal round-robin into one
    /// deque per worker. Never creates more deques than items.
    pub fn partition(&self, mut items: Vec<WorkItem>) -> Vec<VecDeque<WorkItem>> {
        items.sort_by(|a, b| b.cost.cmp(&a.cost).then_with(|| a.rule_id.cmp(&b.rule_id)));

        let pool = std::cmp::min(self.workers, items.len());
        let mut deques: Vec<VecDeque<WorkItem>> = (0..pool).map(|_| VecDeque::new()).collect();
        for (i, item) in items.into_iter().enumerate() {
            deques[i % pool].push_back(item);
        }
        deques
    }

    /// Run `process` once for every item. `process` receives the item and the
    /// id of the worker running it; results come back unordered.
    pub fn run<R, F>(&self, items: Vec<WorkItem>, process: F) -> Result<BatchOutcome<R>>
    where
        R: Send,
        F: Fn(&WorkItem, usize) -> R + Sync,
    {
        if items.is_empty() {
            return Ok(BatchOutcome {
                results: Vec::new(),
                workers: Vec::new(),
            });
        }

        let total = items.len();
        let deques = self.partition(items);
        let pool = deques.len();
        let set = Mutex::new(DequeSet { deques });

        tracing::debug!("Dispatching {} rules over {} workers", total, pool);

        let per_worker: Vec<(Vec<R>, WorkerStats)> = if pool == 1 {
            // No point paying for a thread when there is nobody to steal from
            vec![worker_loop(0, &set, &process)]
        } else {
            crossbeam::thread::scope(|s| {
                let handles: Vec<_> = (0..pool)
                    .map(|worker_id| {
                        let set = &set;
                        let process = &process;
                        s.spawn(move |_| worker_loop(worker_id, set, process))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join())
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .map_err(|_| anyhow::anyhow!("Thread panic occurred during batch execution"))?
            .map_err(|_| anyhow::anyhow!("Worker thread panicked during batch execution"))?
        };

        let mut results = Vec::with_capacity(total);
        let mut workers = Vec::with_capacity(pool);
        for (mut worker_results, stats) in per_worker {
            results.append(&mut worker_results);
            workers.push(stats);
        }

        Ok(BatchOutcome { results, workers })
    }
}

fn lock(set: &Mutex<DequeSet>) -> MutexGuard<'_, DequeSet> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn worker_loop<R, F>(worker_id: usize, set: &Mutex<DequeSet>, process: &F) -> (Vec<R>, WorkerStats)
where
    F: Fn(&WorkItem, usize) -> R,
{
    let mut results = Vec::new();
    let mut stats = WorkerStats {
        worker_id,
        ..WorkerStats::default()
    };

    loop {
        let waiting = Instant::now();
        let next = {
            let mut deques = lock(set);
            match deques.pop_own(worker_id) {
                Some(item) => Some((item, false)),
                None => deques.steal(worker_id).map(|item| (item, true)),
            }
        };
        stats.idle += waiting.elapsed();

        let Some((item, stolen)) = next else {
            break;
        };
        if stolen {
            stats.steals += 1;
            tracing::trace!("worker-{} stole {}", worker_id, item.rule_id);
        }

        let started = Instant::now();
        results.push(process(&item, worker_id));
        stats.busy += started.elapsed();
        stats.executed += 1;
    }

    (results, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(format!("rule-{i:03}"), Duration::from_millis((i % 7) as u64)))
            .collect()
    }

    #[test]
    fn test_partition_is_largest_first_round_robin() {
        let scheduler = WorkStealingScheduler::new(2);
        let deques = scheduler.partition(vec![
            WorkItem::new("small", Duration::from_millis(1)),
            WorkItem::new("large", Duration::from_millis(30)),
            WorkItem::new("medium", Duration::from_millis(10)),
        ]);
        assert_eq!(deques.len(), 2);
        assert_eq!(deques[0][0].rule_id, "large");
        assert_eq!(deques[1][0].rule_id, "medium");
        assert_eq!(deques[0][1].rule_id, "small");
    }

    #[test]
    fn test_partition_never_exceeds_items() {
        let scheduler = WorkStealingScheduler::new(16);
        assert_eq!(scheduler.partition(items(3)).len(), 3);
    }

    #[test]
    fn test_steal_takes_head_of_fullest_deque() {
        let mut set = DequeSet {
            deques: vec![
                VecDeque::new(),
                VecDeque::from(vec![WorkItem::new("b1", Duration::ZERO)]),
                VecDeque::from(vec![
                    WorkItem::new("c1", Duration::ZERO),
                    WorkItem::new("c2", Duration::ZERO),
                ]),
            ],
        };
        assert_eq!(set.steal(0).unwrap().rule_id, "c1");
        assert_eq!(set.pop_own(2).unwrap().rule_id, "c2");
        assert_eq!(set.steal(2).unwrap().rule_id, "b1");
        assert!(set.steal(0).is_none());
    }

    #[test]
    fn test_every_item_dispatched_once() {
        let scheduler = WorkStealingScheduler::new(4);
        let outcome = scheduler
            .run(items(57), |item, _worker| item.rule_id.clone())
            .unwrap();

        assert_eq!(outcome.results.len(), 57);
        assert_eq!(outcome.dispatched(), 57);
        let unique: HashSet<_> = outcome.results.iter().collect();
        assert_eq!(unique.len(), 57);
        assert_eq!(outcome.workers.len(), 4);
    }

    #[test]
    fn test_idle_workers_steal_from_busy_ones() {
        // Worker 0 stalls on its first item while its deque still holds five more
        let stalled = std::sync::atomic::AtomicBool::new(false);
        let scheduler = WorkStealingScheduler::new(2);
        let outcome = scheduler
            .run(items(12), |item, worker| {
                if worker == 0 && !stalled.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(300));
                }
                item.rule_id.clone()
            })
            .unwrap();

        assert_eq!(outcome.results.len(), 12);
        assert!(outcome.steals() >= 1);
        assert!(outcome.workers[1].steals >= 1);
    }

    #[test]
    fn test_single_worker_runs_inline() {
        let scheduler = WorkStealingScheduler::new(1);
        let caller = std::thread::current().id();
        let outcome = scheduler
            .run(items(5), |_item, _worker| std::thread::current().id())
            .unwrap();
        assert!(outcome.results.iter().all(|id| *id == caller));
    }

    #[test]
    fn test_empty_batch() {
        let outcome = WorkStealingScheduler::new(4)
            .run(Vec::new(), |item, _| item.rule_id.clone())
            .unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.dispatched(), 0);
    }
}
