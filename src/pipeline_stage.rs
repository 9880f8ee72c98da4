//! A bounded, single-consumer pipeline stage.
//!
//! A [BoundedStage] owns one consumer thread that drives a [Component].
//! Producers hand it jobs with [BoundedStage::enqueue]. The stage never holds
//! more than `depth` jobs that have not started yet: when a new job arrives
//! at a full stage, the oldest pending job is evicted and handed to the
//! cancellation callback, so latency stays bounded under overload instead of
//! growing with the backlog.
//!
//! Besides frames, a stage also carries control jobs (resets, exports) on a
//! separate lane that is never evicted and is served before the next frame.

use crate::component::Component;
use log::{debug, info, warn};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{SyncSender, TrySendError},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

/// What happened to a job handed to [BoundedStage::enqueue].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job was queued without displacing anything
    Admitted,
    /// The job was queued after the oldest pending job was cancelled
    EvictedOldest,
}

/// Things that can go wrong when feeding a [BoundedStage].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageError {
    /// The stage has been disposed; the job was cancelled
    Closed,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Closed => write!(f, "pipeline stage is closed"),
        }
    }
}

impl std::error::Error for StageError {}

/// Counters describing a stage's traffic so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    /// Frame jobs accepted by `enqueue`
    pub enqueued: u64,
    /// Jobs the consumer ran to completion, controls included
    pub processed: u64,
    /// Jobs handed to the cancellation callback
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    cancelled: AtomicU64,
}

struct Lanes<I> {
    jobs: VecDeque<I>,
    controls: VecDeque<I>,
    accepting: bool,
    busy: bool,
}

struct Shared<I> {
    lanes: Mutex<Lanes<I>>,
    wake: Condvar,
    idle: Condvar,
    counters: Counters,
}

impl<I> Shared<I> {
    fn lock(&self) -> MutexGuard<'_, Lanes<I>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type CancelFn<I> = dyn Fn(I) + Send + Sync;

/// A FIFO work queue with a maximum depth, drained by one consumer thread.
pub struct BoundedStage<I> {
    name: String,
    depth: usize,
    shared: Arc<Shared<I>>,
    on_cancel: Arc<CancelFn<I>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<I: Send + 'static> BoundedStage<I> {
    /// Starts `component` on its own consumer thread. Outputs are offered to
    /// `output` without blocking; if the receiver is behind, the output is
    /// dropped. `on_cancel` receives every job that is evicted or drained
    /// without being run.
    pub fn spawn<C, F>(
        component: C,
        depth: usize,
        output: SyncSender<C::OutData>,
        on_cancel: F,
    ) -> std::io::Result<Self>
    where
        C: Component<InData = I> + Send + 'static,
        C::OutData: Send + 'static,
        F: Fn(I) + Send + Sync + 'static,
    {
        let name = component.to_string();
        let shared = Arc::new(Shared {
            lanes: Mutex::new(Lanes {
                jobs: VecDeque::with_capacity(depth),
                controls: VecDeque::new(),
                accepting: true,
                busy: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
            counters: Counters::default(),
        });

        let th_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || consume(component, th_shared, output))?;

        Ok(Self {
            name,
            depth: depth.max(1),
            shared,
            on_cancel: Arc::new(on_cancel),
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl<I> BoundedStage<I> {
    /// Queue a frame job. If the stage already holds `depth` pending jobs,
    /// the oldest one is cancelled first. Never blocks on the consumer.
    pub fn enqueue(&self, job: I) -> Result<Admission, StageError> {
        let mut lanes = self.shared.lock();
        if !lanes.accepting {
            drop(lanes);
            self.cancel(job);
            return Err(StageError::Closed);
        }

        let mut evicted = Vec::new();
        while lanes.jobs.len() >= self.depth {
            if let Some(oldest) = lanes.jobs.pop_front() {
                evicted.push(oldest);
            }
        }
        lanes.jobs.push_back(job);
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(lanes);
        self.shared.wake.notify_one();

        if evicted.is_empty() {
            Ok(Admission::Admitted)
        } else {
            debug!("{} : evicted {} pending job(s).", self.name, evicted.len());
            evicted.into_iter().for_each(|job| self.cancel(job));
            Ok(Admission::EvictedOldest)
        }
    }

    /// Queue a control job. Control jobs are never evicted and run before
    /// any pending frame job.
    pub fn enqueue_control(&self, job: I) -> Result<(), StageError> {
        let mut lanes = self.shared.lock();
        if !lanes.accepting {
            drop(lanes);
            self.cancel(job);
            return Err(StageError::Closed);
        }
        lanes.controls.push_back(job);
        drop(lanes);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Cancel every pending frame job, then wait until the consumer has
    /// finished the job it is running and every queued control job.
    pub fn flush(&self) {
        let mut lanes = self.shared.lock();
        let pending: Vec<I> = lanes.jobs.drain(..).collect();
        while lanes.busy || !lanes.controls.is_empty() {
            lanes = self
                .shared
                .idle
                .wait(lanes)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(lanes);
        pending.into_iter().for_each(|job| self.cancel(job));
    }

    /// Number of frame jobs waiting to start.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Maximum number of pending frame jobs.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Traffic counters for this stage.
    pub fn stats(&self) -> StageStats {
        let counters = &self.shared.counters;
        StageStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, cancel everything still queued and join the
    /// consumer. A job that has already started is allowed to finish.
    /// Calling this more than once is harmless.
    pub fn dispose(&self) {
        let drained: Vec<I> = {
            let mut lanes = self.shared.lock();
            lanes.accepting = false;
            let mut drained: Vec<I> = lanes.controls.drain(..).collect();
            drained.extend(lanes.jobs.drain(..));
            drained
        };
        self.shared.wake.notify_all();
        drained.into_iter().for_each(|job| self.cancel(job));

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{} : consumer thread panicked.", self.name);
            }
        }
    }

    fn cancel(&self, job: I) {
        self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        (self.on_cancel)(job);
    }
}

impl<I> Drop for BoundedStage<I> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The consumer loop: blocks while there is nothing to do, serves control
/// jobs before frame jobs, and exits once the stage is closed and empty.
fn consume<C>(mut component: C, shared: Arc<Shared<C::InData>>, output: SyncSender<C::OutData>)
where
    C: Component,
{
    loop {
        let job = {
            let mut lanes = shared.lock();
            loop {
                if let Some(job) = lanes.controls.pop_front().or_else(|| lanes.jobs.pop_front()) {
                    lanes.busy = true;
                    break Some(job);
                }
                if !lanes.accepting {
                    break None;
                }
                lanes = shared.wake.wait(lanes).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Some(job) = job else { break };

        let out_data = component.convert(job);
        match output.try_send(out_data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("{} : receiver is behind, dropping output.", component);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("{} : receiver is gone, dropping output.", component);
            }
        }

        shared.counters.processed.fetch_add(1, Ordering::Relaxed);
        shared.lock().busy = false;
        shared.idle.notify_all();
    }

    if let Err(component_error) = component.finalize() {
        warn!("{} : error during terminating : {component_error}.", component);
    }
    info!("{} : terminated.", component);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_pool::{FramePool, SlotLease};
    use crate::sensor::{Resolution, SensorFormat};
    use std::sync::mpsc::{channel, sync_channel, Receiver, Sender};
    use std::time::Duration;

    /// Announces each job as it starts, then waits for the test to let it go.
    struct GatedComponent {
        started: Sender<i32>,
        gate: Receiver<()>,
    }

    impl Component for GatedComponent {
        type InData = i32;
        type OutData = i32;

        fn convert(&mut self, input: i32) -> i32 {
            let _ = self.started.send(input);
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            input
        }

        fn finalize(&mut self) -> Result<(), crate::component::ComponentError> {
            Ok(())
        }
    }

    impl fmt::Display for GatedComponent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "GatedComponent")
        }
    }

    /// Holds a pool slot for a short while, like a real frame job.
    struct SlowSlotComponent;

    impl Component for SlowSlotComponent {
        type InData = SlotLease;
        type OutData = u64;

        fn convert(&mut self, input: SlotLease) -> u64 {
            thread::sleep(Duration::from_millis(2));
            input.frame_number
        }

        fn finalize(&mut self) -> Result<(), crate::component::ComponentError> {
            Ok(())
        }
    }

    impl fmt::Display for SlowSlotComponent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "SlowSlotComponent")
        }
    }

    fn gated_stage(
        depth: usize,
    ) -> (
        BoundedStage<i32>,
        Receiver<i32>,
        Sender<()>,
        Receiver<i32>,
        Receiver<i32>,
    ) {
        let (started_tx, started_rx) = channel();
        let (gate_tx, gate_rx) = channel();
        let (out_tx, out_rx) = sync_channel(16);
        let (cancel_tx, cancel_rx) = channel();
        let cancel_tx = Mutex::new(cancel_tx);
        let stage = BoundedStage::spawn(
            GatedComponent {
                started: started_tx,
                gate: gate_rx,
            },
            depth,
            out_tx,
            move |job| {
                let _ = cancel_tx.lock().unwrap().send(job);
            },
        )
        .unwrap();
        (stage, started_rx, gate_tx, out_rx, cancel_rx)
    }

    #[test]
    fn evicts_oldest_pending_job() {
        let (stage, started, gate, out, cancelled) = gated_stage(2);

        assert_eq!(stage.enqueue(1), Ok(Admission::Admitted));
        assert_eq!(started.recv().unwrap(), 1);

        assert_eq!(stage.enqueue(2), Ok(Admission::Admitted));
        assert_eq!(stage.enqueue(3), Ok(Admission::Admitted));
        assert_eq!(stage.enqueue(4), Ok(Admission::EvictedOldest));
        assert_eq!(cancelled.recv().unwrap(), 2);
        assert_eq!(stage.pending(), 2);

        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        assert_eq!(out.recv().unwrap(), 1);
        assert_eq!(out.recv().unwrap(), 3);
        assert_eq!(out.recv().unwrap(), 4);

        stage.dispose();
        let stats = stage.stats();
        assert_eq!(stats.enqueued, 4);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.cancelled, 1);
    }

    #[test]
    fn controls_jump_the_queue_and_are_never_evicted() {
        let (stage, started, gate, out, cancelled) = gated_stage(1);

        stage.enqueue(1).unwrap();
        assert_eq!(started.recv().unwrap(), 1);
        stage.enqueue(2).unwrap();
        stage.enqueue_control(100).unwrap();
        stage.enqueue_control(101).unwrap();
        assert_eq!(stage.enqueue(3), Ok(Admission::EvictedOldest));
        assert_eq!(cancelled.recv().unwrap(), 2);

        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        let order: Vec<i32> = (0..4).map(|_| out.recv().unwrap()).collect();
        assert_eq!(order, vec![1, 100, 101, 3]);

        stage.dispose();
    }

    #[test]
    fn dispose_cancels_pending_and_refuses_new_work() {
        let (stage, started, gate, _out, cancelled) = gated_stage(2);

        stage.enqueue(1).unwrap();
        assert_eq!(started.recv().unwrap(), 1);
        stage.enqueue(2).unwrap();
        stage.enqueue_control(3).unwrap();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = gate.send(());
        });
        stage.dispose();

        let mut drained: Vec<i32> = cancelled.try_iter().collect();
        drained.sort();
        assert_eq!(drained, vec![2, 3]);

        assert_eq!(stage.enqueue(9), Err(StageError::Closed));
        assert_eq!(cancelled.recv().unwrap(), 9);
    }

    #[test]
    fn flush_waits_for_running_job() {
        let (stage, started, gate, out, cancelled) = gated_stage(2);

        stage.enqueue(1).unwrap();
        assert_eq!(started.recv().unwrap(), 1);
        stage.enqueue(2).unwrap();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = gate.send(());
        });
        stage.flush();

        assert_eq!(out.try_recv().unwrap(), 1);
        assert_eq!(cancelled.try_recv().unwrap(), 2);
        assert_eq!(stage.pending(), 0);
        stage.dispose();
    }

    #[test]
    fn overload_never_leaks_slots() {
        let format = SensorFormat {
            depth: Resolution::new(8, 8),
            color: Resolution::new(8, 8),
            skeleton_count: 1,
        };
        let pool = FramePool::new("OverloadPool", 5, format);
        let (out_tx, out_rx) = sync_channel(1024);
        let stage = BoundedStage::spawn(SlowSlotComponent, 2, out_tx, |lease| drop(lease)).unwrap();

        let mut dropped = 0;
        for frame_number in 0..300 {
            match pool.acquire() {
                Ok(mut lease) => {
                    lease.frame_number = frame_number;
                    stage.enqueue(lease).unwrap();
                }
                Err(_) => dropped += 1,
            }
            assert!(pool.outstanding() <= pool.capacity());
        }

        stage.dispose();
        assert_eq!(pool.outstanding(), 0);

        let stats = stage.stats();
        assert_eq!(stats.enqueued + dropped, 300);
        assert_eq!(stats.processed + stats.cancelled, stats.enqueued);
        assert_eq!(out_rx.try_iter().count() as u64, stats.processed);
    }
}
