//! Parallel execution of one dependency layer
//!
//! This module owns **how** a batch of rules is spread over worker threads;
//! it knows nothing about what a rule does.
//!
//! ## What This Module Does:
//! - **Resource Discovery**: default worker ceiling from `num_cpus::get()`
//! - **Adaptive Sizing**: [`allocator::workers`] maps batch size to a pool size
//! - **Work Stealing**: [`scheduler::WorkStealingScheduler`] runs the batch with
//!   per-worker deques and records busy/idle/steal statistics
//!
//! ## What This Module Does NOT Do:
//! - **Caching or execution policy**: the orchestrator passes a closure that
//!   decides per item whether to serve a cached result or run the rule
//! - **Cross-batch ordering**: batches are run one after another by the caller
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │  Orchestrator   │    │   Parallel       │    │   Workers       │
//! │                 │───▶│   Module         │───▶│                 │
//! │ • batch order   │    │ • pool sizing    │    │ • pop own tail  │
//! │ • cost estimate │    │ • deque set      │    │ • steal heads   │
//! │ • cache/execute │    │ • stats          │    │ • run closure   │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use ruleguard::parallel::{workers, WorkItem, WorkStealingScheduler};
//! use std::time::Duration;
//!
//! let items: Vec<WorkItem> = (0..20)
//!     .map(|i| WorkItem::new(format!("rule-{i}"), Duration::from_millis(i)))
//!     .collect();
//! let scheduler = WorkStealingScheduler::new(workers(items.len(), 8));
//! let outcome = scheduler.run(items, |item, _worker| item.rule_id.clone())?;
//! assert_eq!(outcome.results.len(), 20);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod allocator;
pub mod scheduler;

pub use allocator::{default_max_workers, workers};
pub use scheduler::{BatchOutcome, WorkItem, WorkStealingScheduler, WorkerStats};
