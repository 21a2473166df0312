//! Adaptive worker allocation
//!
//! Thread creation and coordination dominate tiny batches, so small layers get
//! few workers and only large layers saturate the configured ceiling.

/// Worker count for a batch of `batch_size` rules under a ceiling of `max_workers`.
///
/// | batch size | workers          |
/// |------------|------------------|
/// | 0          | 0                |
/// | 1          | 1                |
/// | 2..=3      | min(2, max)      |
/// | 4..=10     | min(4, max)      |
/// | 11..=50    | min(8, max)      |
/// | > 50       | max              |
///
/// A ceiling of 0 is treated as 1.
pub fn workers(batch_size: usize, max_workers: usize) -> usize {
    let max_workers = max_workers.max(1);
    match batch_size {
        0 => 0,
        1 => 1,
        2..=3 => std::cmp::min(2, max_workers),
        4..=10 => std::cmp::min(4, max_workers),
        11..=50 => std::cmp::min(8, max_workers),
        _ => max_workers,
    }
}

/// Ceiling used when none is configured: all available cores
pub fn default_max_workers(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        std::cmp::max(1, num_cpus::get())
    }
}
