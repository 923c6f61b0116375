use crossbeam_channel::{Receiver, Sender, unbounded};

/// One unit of transfer work.
///
/// `offset` and `size` identify the byte range; `attempts` is retry
/// bookkeeping carried along by the engine and not part of the job's
/// identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Job {
    pub offset: u64,
    pub size: u64,
    pub attempts: u32,
}

impl Job {
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            attempts: 0,
        }
    }

    /// The same byte range, one attempt later.
    pub fn retry(self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self
        }
    }
}

/// Unbounded multi-producer multi-consumer queue of jobs. Workers drain it
/// and re-enqueue failed ranges while other workers keep consuming.
#[derive(Clone)]
pub struct JobQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl JobQueue {
    pub fn unbounded() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Non-blocking enqueue. Cannot fail while the queue is alive: both
    /// ends live inside this handle.
    pub fn try_put(&self, job: Job) {
        let _ = self.tx.send(job);
    }

    /// Non-blocking dequeue; `None` means the queue is drained.
    pub fn get(&self) -> Option<Job> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}
