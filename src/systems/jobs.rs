use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::{JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_queue::SegQueue;

/// Work scheduler seam. The volume core only ever talks to this trait so
/// tests can run every parallel section single-threaded and deterministic.
pub trait WorkScheduler: Send + Sync {
    fn worker_count(&self) -> usize;

    /// Enqueues a fire-and-forget background job.
    fn spawn(&self, prioritize: bool, job: Box<dyn FnOnce() + Send>) -> JobHandle;

    /// Partitions `range` into contiguous chunks of at least `min_chunk`
    /// indices and runs `f` once per chunk, returning when all chunks are
    /// done. Chunks never overlap and cover the range exactly.
    fn run_chunks(&self, range: Range<usize>, min_chunk: usize, f: &(dyn Fn(Range<usize>) + Sync));
}

/// Chunk size used for batch work: `max(16, n / (2 * workers))`.
pub fn batch_chunk_size(n: usize, workers: usize) -> usize {
    (n / (2 * workers.max(1))).max(16)
}

/// Runs `f` over disjoint mutable sub-slices of `data`, one per chunk.
/// The closure receives the chunk's element offset and the sub-slice.
pub fn parallel_for_slices<T: Send, F>(
    scheduler: &dyn WorkScheduler,
    data: &mut [T],
    min_chunk: usize,
    f: F,
) where
    F: Fn(usize, &mut [T]) + Sync,
{
    struct SendPtr<T>(*mut T);
    unsafe impl<T> Send for SendPtr<T> {}
    unsafe impl<T> Sync for SendPtr<T> {}

    let len = data.len();
    let base = SendPtr(data.as_mut_ptr());
    scheduler.run_chunks(0..len, min_chunk, &move |chunk: Range<usize>| {
        // force capture of the whole `base` value (not just its `.0` field)
        // so the closure picks up SendPtr's unsafe Sync impl; Rust 2021's
        // disjoint-field capture would otherwise capture the bare `*mut T`
        let base = &base;
        // chunks are disjoint by the run_chunks contract, so each closure
        // invocation owns its sub-slice exclusively
        let slice = unsafe {
            std::slice::from_raw_parts_mut(base.0.add(chunk.start), chunk.end - chunk.start)
        };
        f(chunk.start, slice);
    });
}

/// Runs every job inline on the calling thread, in chunk order.
pub struct SerialScheduler;

impl WorkScheduler for SerialScheduler {
    fn worker_count(&self) -> usize {
        1
    }

    fn spawn(&self, _prioritize: bool, job: Box<dyn FnOnce() + Send>) -> JobHandle {
        let handle = JobHandle::new();
        job();
        handle.finished.store(true, Ordering::Release);
        handle
    }

    fn run_chunks(&self, range: Range<usize>, min_chunk: usize, f: &(dyn Fn(Range<usize>) + Sync)) {
        for chunk in split_range(range, min_chunk, 1) {
            f(chunk);
        }
    }
}

/// Worker-pool scheduler. Background jobs drain through two queues
/// (priority first); parallel sections fan out over scoped threads so they
/// can borrow the caller's data.
pub struct JobSystem {
    worker_handles: HashMap<ThreadId, JoinHandle<()>>,
    worker_count: usize,
    is_running: Arc<AtomicBool>,

    queue: Arc<SegQueue<Job>>,
    prio_queue: Arc<SegQueue<Job>>,
    sleeping_threads: Arc<SegQueue<ThreadId>>,
}

struct Job {
    handle: JobHandle,
    exec: Box<dyn FnOnce() + Send>,
}

impl JobSystem {
    pub fn new(worker_count: usize) -> JobSystem {
        let worker_count = worker_count.max(1);
        let mut system = JobSystem {
            worker_handles: HashMap::new(),
            worker_count,
            is_running: Arc::new(AtomicBool::new(true)),
            queue: Arc::new(SegQueue::new()),
            prio_queue: Arc::new(SegQueue::new()),
            sleeping_threads: Arc::new(SegQueue::new()),
        };

        for _ in 0..worker_count {
            let handle = system.spawn_worker();
            system.worker_handles.insert(handle.thread().id(), handle);
        }

        system
    }

    pub fn stop(self) {
        self.is_running.store(false, Ordering::Relaxed);

        for (_, handle) in self.worker_handles {
            handle.thread().unpark();
            handle.join().unwrap();
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len() + self.prio_queue.len()
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let is_running = self.is_running.clone();
        let queue = self.queue.clone();
        let prio_queue = self.prio_queue.clone();
        let sleeping_threads = self.sleeping_threads.clone();

        thread::spawn(move || {
            let mut last_exec = Instant::now();

            while is_running.load(Ordering::Relaxed) {
                let job = prio_queue.pop().or_else(|| queue.pop());
                let Some(job) = job else {
                    if last_exec.elapsed().as_millis() > 100 {
                        sleeping_threads.push(thread::current().id());
                        thread::park();
                        last_exec = Instant::now();
                    }
                    continue;
                };
                last_exec = Instant::now();

                if !job.handle.is_cancelled() {
                    (job.exec)();
                }
                job.handle.finished.store(true, Ordering::Release);
            }
        })
    }
}

impl WorkScheduler for JobSystem {
    fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn spawn(&self, prioritize: bool, exec: Box<dyn FnOnce() + Send>) -> JobHandle {
        let handle = JobHandle::new();
        let job = Job { handle: handle.clone(), exec };

        if prioritize {
            self.prio_queue.push(job);
        } else {
            self.queue.push(job);
        }

        if let Some(thread) = self.sleeping_threads.pop() {
            if let Some(worker) = self.worker_handles.get(&thread) {
                worker.thread().unpark();
            }
        }

        handle
    }

    fn run_chunks(&self, range: Range<usize>, min_chunk: usize, f: &(dyn Fn(Range<usize>) + Sync)) {
        let chunks = split_range(range, min_chunk, self.worker_count);
        if chunks.len() <= 1 {
            for chunk in chunks {
                f(chunk);
            }
            return;
        }

        let next = AtomicUsize::new(0);
        let threads = self.worker_count.min(chunks.len());
        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= chunks.len() {
                        break;
                    }
                    f(chunks[i].clone());
                });
            }
        });
    }
}

fn split_range(range: Range<usize>, min_chunk: usize, workers: usize) -> Vec<Range<usize>> {
    let len = range.end.saturating_sub(range.start);
    if len == 0 {
        return Vec::new();
    }
    let chunk = batch_chunk_size(len, workers).max(min_chunk.max(1));
    let mut out = Vec::with_capacity(len / chunk + 1);
    let mut start = range.start;
    while start < range.end {
        let end = (start + chunk).min(range.end);
        out.push(start..end);
        start = end;
    }
    out
}

#[derive(Clone)]
pub struct JobHandle {
    cancelled: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl JobHandle {
    fn new() -> JobHandle {
        JobHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[test]
    fn serial_chunks_cover_range_in_order() {
        let seen = Mutex::new(Vec::new());
        SerialScheduler.run_chunks(0..100, 16, &|chunk| {
            seen.lock().unwrap().push(chunk);
        });

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first().unwrap().start, 0);
        assert_eq!(seen.last().unwrap().end, 100);
        for pair in seen.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn pool_chunks_cover_range_exactly_once() {
        let pool = JobSystem::new(4);
        let hits: Vec<AtomicU32> = (0..1000).map(|_| AtomicU32::new(0)).collect();

        pool.run_chunks(0..1000, 16, &|chunk| {
            for i in chunk {
                hits[i].fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
        pool.stop();
    }

    #[test]
    fn slice_partition_mutates_disjoint_chunks() {
        let pool = JobSystem::new(4);
        let mut data = vec![0u32; 500];

        parallel_for_slices(&pool, &mut data, 16, |offset, slice| {
            for (i, v) in slice.iter_mut().enumerate() {
                *v = (offset + i) as u32;
            }
        });

        for (i, v) in data.iter().enumerate() {
            assert_eq!(*v, i as u32);
        }
        pool.stop();
    }

    #[test]
    fn spawned_jobs_run_and_cancel() {
        let pool = JobSystem::new(2);
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let handle = pool.spawn(
            false,
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        // a cancelled job is skipped but still marked finished; keep both
        // workers busy so the cancel lands while the job is still queued
        for _ in 0..2 {
            pool.spawn(false, Box::new(|| thread::sleep(Duration::from_millis(50))));
        }
        let c = counter.clone();
        let handle = pool.spawn(
            false,
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        handle.cancel();
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        pool.stop();
    }

    #[test]
    fn batch_chunk_size_floors_at_16() {
        assert_eq!(batch_chunk_size(10, 8), 16);
        assert_eq!(batch_chunk_size(1000, 4), 125);
        assert_eq!(batch_chunk_size(64, 2), 16);
    }
}
