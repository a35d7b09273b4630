// Software queue: one worker thread per queue, fed through a flume channel
//
// Work runs strictly in submission order. Completion is published as the
// serial of the last finished submission. A submission that waits on
// semaphores blocks its worker until the signalling submissions, possibly on
// other queues, have finished.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};

use super::execute::{Executor, Op};
use crate::capture::DrawCall;

/// Host-visible fence state shared with the worker.
#[derive(Debug, Default)]
pub(super) struct FenceState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl FenceState {
    pub(super) fn new(signaled: bool) -> Self {
        Self { signaled: Mutex::new(signaled), cond: Condvar::new() }
    }

    pub(super) fn signal(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    pub(super) fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub(super) fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Wait up to `timeout`; returns whether the fence got signalled.
    pub(super) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut signaled = self.signaled.lock();
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        return *signaled;
                    }
                }
                None => self.cond.wait(&mut signaled),
            }
        }
        true
    }
}

enum Work {
    Execute {
        serial: u64,
        ops: Arc<Vec<Op>>,
        fence: Option<Arc<FenceState>>,
        waits: Vec<TimelinePoint>,
    },
}

#[derive(Debug, Default)]
struct Progress {
    completed: u64,
    errors: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    progress: Mutex<Progress>,
    cond: Condvar,
}

impl Shared {
    fn wait_for(&self, serial: u64) {
        let mut progress = self.progress.lock();
        while progress.completed < serial {
            self.cond.wait(&mut progress);
        }
    }
}

/// A submission on some queue's timeline. Semaphore signals carry one so a
/// waiter on any queue can block until that submission finished.
#[derive(Debug, Clone)]
pub(super) struct TimelinePoint {
    shared: Arc<Shared>,
    serial: u64,
}

impl TimelinePoint {
    #[cfg(test)]
    fn is_reached(&self) -> bool {
        self.shared.progress.lock().completed >= self.serial
    }

    fn wait(&self) {
        self.shared.wait_for(self.serial);
    }
}

pub(super) struct QueueWorker {
    sender: Option<flume::Sender<Work>>,
    shared: Arc<Shared>,
    next_serial: Mutex<u64>,
    thread: Option<JoinHandle<()>>,
}

impl QueueWorker {
    pub(super) fn spawn(name: String, capture: Option<Arc<Mutex<Vec<DrawCall>>>>) -> Result<Self> {
        let (sender, receiver) = flume::unbounded::<Work>();
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();

        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut executor = Executor::new(capture);
                for work in receiver.iter() {
                    match work {
                        Work::Execute { serial, ops, fence, waits } => {
                            for point in &waits {
                                point.wait();
                            }
                            let result = executor.run(&ops);
                            let mut progress = worker_shared.progress.lock();
                            if let Err(err) = result {
                                log::error!("software queue: submission {} failed: {:#}", serial, err);
                                progress.errors.push(format!("submission {}: {:#}", serial, err));
                            }
                            progress.completed = serial;
                            drop(progress);
                            if let Some(fence) = fence {
                                fence.signal();
                            }
                            worker_shared.cond.notify_all();
                        }
                    }
                }
                log::debug!("software queue worker exiting");
            })
            .context("Failed to spawn software queue thread")?;

        Ok(Self { sender: Some(sender), shared, next_serial: Mutex::new(0), thread: Some(thread) })
    }

    /// Queue `ops` behind everything submitted so far. They start once every
    /// point in `waits` is reached.
    pub(super) fn submit(
        &self,
        ops: Arc<Vec<Op>>,
        fence: Option<Arc<FenceState>>,
        waits: Vec<TimelinePoint>,
    ) -> Result<u64> {
        let mut next = self.next_serial.lock();
        let serial = *next + 1;
        let sender = self.sender.as_ref().context("software queue is shut down")?;
        sender
            .send(Work::Execute { serial, ops, fence, waits })
            .map_err(|_| anyhow::anyhow!("software queue thread is gone"))?;
        *next = serial;
        Ok(serial)
    }

    pub(super) fn point(&self, serial: u64) -> TimelinePoint {
        TimelinePoint { shared: self.shared.clone(), serial }
    }

    pub(super) fn completed(&self) -> u64 {
        self.shared.progress.lock().completed
    }

    /// Block until everything submitted so far ran, then report executor errors.
    pub(super) fn wait_idle(&self) -> Result<()> {
        let target = *self.next_serial.lock();
        let mut progress = self.shared.progress.lock();
        while progress.completed < target {
            self.shared.cond.wait(&mut progress);
        }
        if !progress.errors.is_empty() {
            let errors = std::mem::take(&mut progress.errors);
            anyhow::bail!("software queue execution failed: {}", errors.join("; "));
        }
        Ok(())
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once queued work drained.
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("software queue thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_wait_times_out_and_wakes() {
        let fence = Arc::new(FenceState::new(false));
        assert!(!fence.wait(Duration::from_millis(5)));
        let signaller = fence.clone();
        let handle = std::thread::spawn(move || signaller.signal());
        assert!(fence.wait(Duration::from_secs(5)));
        handle.join().unwrap();
        fence.reset();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn empty_submissions_complete_in_order() {
        let worker = QueueWorker::spawn("test-queue".into(), None).unwrap();
        let fence = Arc::new(FenceState::new(false));
        let first = worker.submit(Arc::new(Vec::new()), None, Vec::new()).unwrap();
        let second = worker.submit(Arc::new(Vec::new()), Some(fence.clone()), Vec::new()).unwrap();
        assert!(second > first);
        worker.wait_idle().unwrap();
        assert_eq!(worker.completed(), second);
        assert!(fence.is_signaled());
    }

    #[test]
    fn waiting_worker_holds_until_the_point_is_reached() {
        let producer = QueueWorker::spawn("producer".into(), None).unwrap();
        let consumer = QueueWorker::spawn("consumer".into(), None).unwrap();

        // A point one past anything submitted stays unreached until the producer catches up
        let point = producer.point(1);
        assert!(!point.is_reached());
        let waited = consumer.submit(Arc::new(Vec::new()), None, vec![point.clone()]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(consumer.completed(), 0);

        producer.submit(Arc::new(Vec::new()), None, Vec::new()).unwrap();
        consumer.wait_idle().unwrap();
        assert!(point.is_reached());
        assert_eq!(consumer.completed(), waited);
    }
}
