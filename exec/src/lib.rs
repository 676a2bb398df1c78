//! TCG Execution Engine: tiered interpretation and compilation.
//!
//! The execution loop interprets cold code, counts misses per entry
//! PA, and queues hot PAs for a background compile worker. Compiled
//! blocks are published in a PA-keyed translation cache and
//! invalidated whenever a store touches a page they were built
//! from.
//!
//! ```text
//!  exec loop --miss--> hotness --hot--> compile queue --> worker
//!      ^                                                    |
//!      +------------- translation cache <--verified commit--+
//!  stores --> page versions / reverse index --> invalidation
//! ```

pub mod compile_queue;
pub mod exec_loop;
pub mod hotness;
pub mod page_version;
pub mod smc;
pub mod stats;
pub mod tb_store;
pub mod worker;

pub use compile_queue::{CompileQueue, CompileTask, Enqueue};
pub use exec_loop::{cpu_exec_loop, ExitReason};
pub use hotness::HotnessTable;
pub use page_version::{PageState, PageVersionTable};
pub use smc::{guest_store, SmcOutcome};
pub use stats::{CacheStats, CacheStatsSnapshot, ExecStats};
pub use tb_store::{CacheState, TranslationCache};
pub use worker::{commit, compile, snapshot, CompilationSnapshot, CompiledCode};

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tcg_backend::{CodeArena, HostCodeGen, ThreadedCodeGen};
use tcg_core::{BusError, JumpCache, PhysMemory, TcgConfig, TcgError};

/// State shared between the execution thread and the worker.
pub struct SharedState<B> {
    pub config: TcgConfig,
    pub mem: Arc<dyn PhysMemory>,
    pub cache: TranslationCache,
    pub queue: CompileQueue,
    pub backend: B,
}

/// State private to the execution thread.
#[derive(Default)]
pub struct PerCpuState {
    pub jump_cache: JumpCache,
    /// Frame instructions are currently fetched from.
    pub fetch_pfn: Option<u64>,
    pub stats: ExecStats,
    /// Cache retire generation the jump cache was last purged at.
    seen_retire_gen: u64,
}

/// Execution environment: shared engine state, this CPU's private
/// state, and the compile worker.
pub struct ExecEnv<B: HostCodeGen + 'static = ThreadedCodeGen> {
    shared: Arc<SharedState<B>>,
    pub per_cpu: PerCpuState,
    tx: Option<Sender<CompileTask>>,
    worker: Option<JoinHandle<()>>,
}

impl ExecEnv<ThreadedCodeGen> {
    /// Environment using the portable threaded-code backend.
    pub fn with_config(
        config: TcgConfig,
        mem: Arc<dyn PhysMemory>,
    ) -> Result<Self, TcgError> {
        let backend = ThreadedCodeGen::new(config.safepoint_interval);
        Self::new(config, mem, backend)
    }
}

impl<B: HostCodeGen + 'static> ExecEnv<B> {
    /// Validate `config`, map the code arena, size the per-page
    /// tables for `mem`, and start the worker when
    /// `background_compile` is set.
    pub fn new(
        config: TcgConfig,
        mem: Arc<dyn PhysMemory>,
        backend: B,
    ) -> Result<Self, TcgError> {
        config.validate()?;
        let arena = CodeArena::new(config.code_arena_size)
            .map_err(TcgError::CodeArena)?;
        let cache = TranslationCache::new(
            arena,
            mem.base_pfn(),
            mem.num_pages(),
            config.promotion_threshold as u16,
        );
        let (tx, queue) = CompileQueue::new(config.compile_queue_depth);
        let background = config.background_compile;
        let shared = Arc::new(SharedState {
            config,
            mem,
            cache,
            queue,
            backend,
        });

        let worker = if background {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("tcg-compile".into())
                .spawn(move || worker::run(&shared))
                .map_err(TcgError::WorkerSpawn)?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            shared,
            per_cpu: PerCpuState::default(),
            tx: Some(tx),
            worker,
        })
    }

    pub fn shared(&self) -> &Arc<SharedState<B>> {
        &self.shared
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.shared.cache
    }

    pub fn config(&self) -> &TcgConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &ExecStats {
        &self.per_cpu.stats
    }

    /// Compile requests not yet picked up.
    pub fn pending_compiles(&self) -> usize {
        self.shared.queue.pending()
    }

    /// Run every queued compile request on the calling thread.
    /// Returns how many blocks were installed. Used when
    /// `background_compile` is off.
    pub fn drain_compile_queue(&self) -> usize {
        let mut installed = 0;
        while let Some(task) = self.shared.queue.try_recv() {
            if worker::process(&self.shared, task).is_ok() {
                installed += 1;
            }
        }
        installed
    }

    /// Write guest physical memory through the invalidation hook,
    /// as a device or the embedder would.
    pub fn store(&self, pa: u64, data: &[u8]) -> Result<SmcOutcome, BusError> {
        guest_store(&self.shared, pa, data, self.per_cpu.fetch_pfn)
    }

    /// Purge dead jump-cache slots if blocks were retired since the
    /// last call.
    fn sync_jump_cache(&mut self) {
        let gen = self.shared.cache.retire_gen();
        if gen != self.per_cpu.seen_retire_gen {
            self.per_cpu.jump_cache.purge_invalid();
            self.per_cpu.seen_retire_gen = gen;
        }
    }
}

impl<B: HostCodeGen + 'static> Drop for ExecEnv<B> {
    fn drop(&mut self) {
        // Disconnect the queue; the worker finishes what is queued
        // and exits.
        self.tx.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("[tcg-worker] compile worker panicked");
            }
        }
    }
}
