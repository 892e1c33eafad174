//! Fan-out/fan-in of independent per-image work items over a worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

/// Work items per dispatched chunk: a tenth of the batch, at least one.
pub fn chunk_size(count: usize) -> usize
{
    (count / 10).max(1)
}

/// A progress bar showing completed / total items, or a hidden one.
pub fn progress_bar(stage: &str, total: usize, visible: bool) -> ProgressBar
{
    if !visible
    {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        bar.set_style(style);
    }
    bar.set_message(stage.to_string());
    bar
}

/// Runs a function over a batch of items on a dedicated thread pool.
///
/// Results come back in completion order, not submission order, so every
/// result has to carry its own key for the caller to recombine by. The first
/// failing item fails the whole batch: remaining items are skipped and no
/// partial results are returned.
pub struct FanOut
{
    pool: ThreadPool,
    show_progress: bool,
}

impl FanOut
{
    /// `workers` defaults to one thread per CPU core.
    pub fn new(workers: Option<usize>, show_progress: bool) -> Result<Self>
    {
        let workers = workers.unwrap_or_else(num_cpus::get).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("fanout-{}", idx))
            .build()?;
        info!("Started fan-out pool with {} workers", workers);
        Ok(FanOut { pool, show_progress })
    }

    pub fn workers(&self) -> usize
    {
        self.pool.current_num_threads()
    }

    pub fn run<A, R, F>(&self, stage: &'static str, items: Vec<A>, func: F) -> Result<Vec<R>>
    where
        A: Send,
        R: Send,
        F: Fn(A) -> Result<R> + Sync,
    {
        let total = items.len();
        if total == 0
        {
            return Ok(Vec::new());
        }

        let chunk = chunk_size(total);
        let mut chunks: Vec<Vec<A>> = Vec::with_capacity(total.div_ceil(chunk));
        let mut items = items.into_iter().peekable();
        while items.peek().is_some()
        {
            chunks.push(items.by_ref().take(chunk).collect());
        }
        debug!("{}: dispatching {} items in {} chunks of up to {}", stage, total, chunks.len(), chunk);

        let progress = progress_bar(stage, total, self.show_progress);
        let failed = AtomicBool::new(false);
        let (sender, receiver) = mpsc::channel::<Result<R>>();

        self.pool.scope(|scope| {
            for chunk in chunks
            {
                let sender = sender.clone();
                let (func, failed, progress) = (&func, &failed, &progress);
                scope.spawn(move |_| {
                    for item in chunk
                    {
                        if failed.load(Ordering::Relaxed)
                        {
                            return;
                        }
                        let result = func(item);
                        if result.is_err()
                        {
                            failed.store(true, Ordering::Relaxed);
                        }
                        progress.inc(1);
                        if sender.send(result).is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });
        drop(sender);

        let mut results = Vec::with_capacity(total);
        for result in receiver
        {
            match result
            {
                Ok(value) => results.push(value),
                Err(e) =>
                {
                    progress.abandon();
                    return Err(Error::Worker { stage, source: Box::new(e) });
                }
            }
        }
        progress.finish();
        Ok(results)
    }
}
