//! Bounded compile request queue.
//!
//! The execution loop owns the only [`Sender`]; the worker blocks
//! on the receiving side and exits once the sender is dropped.
//! Requests are advisory: a full queue drops them and the next miss
//! at or above threshold asks again.

use std::collections::HashSet;

use crossbeam_channel::{bounded, Receiver, RecvError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

/// Request to compile the block entered at `entry_pa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileTask {
    pub entry_pa: u64,
    pub entry_va: u64,
    /// Fetch translation of the page after the entry page, when it
    /// is executable. Lets a block end with an instruction that
    /// crosses into it.
    pub next_page_pa: Option<u64>,
}

/// Outcome of [`CompileQueue::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Sent,
    /// The PA is already queued or being compiled.
    InFlight,
    /// No room; the request was dropped.
    Full,
}

/// Receiving side plus the set of PAs queued or compiling
/// (`active_compilations`).
pub struct CompileQueue {
    rx: Receiver<CompileTask>,
    active: Mutex<HashSet<u64>>,
}

impl CompileQueue {
    /// Create a queue holding at most `depth` requests.
    pub fn new(depth: usize) -> (Sender<CompileTask>, Self) {
        let (tx, rx) = bounded(depth.max(1));
        (
            tx,
            Self {
                rx,
                active: Mutex::new(HashSet::new()),
            },
        )
    }

    /// Non-blocking enqueue.
    pub fn request(&self, tx: &Sender<CompileTask>, task: CompileTask) -> Enqueue {
        let mut active = self.active.lock();
        if !active.insert(task.entry_pa) {
            return Enqueue::InFlight;
        }
        match tx.try_send(task) {
            Ok(()) => Enqueue::Sent,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                active.remove(&task.entry_pa);
                Enqueue::Full
            }
        }
    }

    /// Block until a task arrives. Fails once every sender is gone
    /// and the queue is drained.
    pub fn recv(&self) -> Result<CompileTask, RecvError> {
        self.rx.recv()
    }

    pub fn try_recv(&self) -> Option<CompileTask> {
        match self.rx.try_recv() {
            Ok(task) => Some(task),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Forget `pa` after its compilation committed or aborted.
    pub fn complete(&self, pa: u64) {
        self.active.lock().remove(&pa);
    }

    pub fn in_flight(&self, pa: u64) -> bool {
        self.active.lock().contains(&pa)
    }

    /// Requests waiting to be picked up.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
