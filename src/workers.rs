//! Bounded worker pool shared by the featurize batch and the archive pipeline.
use rayon::ThreadPoolBuilder;

/// Runs `work` on a rayon pool of `jobs` threads. `0` uses the global pool, as does a pool
/// that cannot be built.
pub fn run<T, F>(jobs: usize, work: F) -> T
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    if jobs == 0 {
        return work();
    }

    match ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("cellsniff-worker-{i}"))
        .build()
    {
        Ok(pool) => pool.install(work),
        Err(e) => {
            log::warn!("Cannot start {jobs} workers, using the global pool: {e}");
            work()
        }
    }
}
