//! Host module: the audio-thread side of the script host.
//!
//! [`ScriptHost::process`] is called once per block. It tries the execution
//! lock once. With the lock it replays any stashed blocks, runs the script
//! on the live block and closes one sequence per output port. Without it,
//! the block's input goes to the per-port stashes and the outputs carry the
//! bypass content. Either way the call returns without waiting.
//!
//! A stash is spent by the first locked block that replays it, even when
//! the script then fails: stashed events reach the script at most once.
//!
//! The non-real-time counterpart is [`Worker`].

// IMPORTANT: Do not call assert_invariant or any PPT logging in RT paths to avoid locks/allocs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rtrb::Producer;
use thiserror::Error;

use crate::atom::Atom;
use crate::config::{BypassMode, ConfigError, HostConfig, MAX_PORTS};
use crate::control::{ControlMessage, Diagnostics};
use crate::driver::Reader;
use crate::forge::{Forge, ForgeError, Frame};
use crate::invariant_ppt::{assert_invariant, HOST_PORTS_BOUND};
use crate::invariant_rt::{
    new_invariant_queue, signal_invariant, INV_BLOCK_PROCESSED, INV_BLOCK_STASHED,
    INV_FORGE_OVERFLOW, INV_GROWTH_REQUESTED, INV_OOM_BYPASS, INV_RT_CALLBACK_CLEAN,
    INV_SCRIPT_ERROR, INV_STASH_OVERFLOW, INV_STASH_REPLAYED,
};
use crate::lock::ExecLock;
use crate::pool::{Pool, PoolCounters, PoolError};
use crate::region::RegionError;
use crate::script::{Compiler, RunContext, Script, ScriptError};
use crate::stash::Stash;
use crate::urid::{UridMap, Urids};
use crate::view::View;
use crate::worker::Worker;

/// Setup and worker-side failures.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Forge(#[from] ForgeError),
    #[error("no script loaded")]
    NoScript,
    #[error("state is not a complete atom")]
    InvalidState,
}

/// Why a block's outputs carry bypass content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// No script has been loaded.
    NoScript,
    /// A previous runtime error disabled the script.
    Disabled,
    /// The pool ran dry during this block.
    OutOfMemory,
    /// An output buffer ran out of room during this block.
    Overflow,
    /// The script failed during this block and is now disabled.
    Error,
}

/// Result of one [`ScriptHost::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The script ran; `replayed` if stashed blocks were flushed first.
    Processed { replayed: bool },
    /// The worker held the lock; input went to the stash.
    Stashed,
    Bypassed(BypassReason),
}

/// Lifetime counters, shared between the host and the worker.
#[derive(Debug, Default)]
pub struct HostStats {
    blocks_processed: AtomicU64,
    blocks_stashed: AtomicU64,
    blocks_bypassed: AtomicU64,
    replays: AtomicU64,
    stash_dropped: AtomicU64,
    script_errors: AtomicU64,
    pub(crate) regions_committed: AtomicU64,
}

impl HostStats {
    #[inline]
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy the counters together with the pool's accounting.
    pub fn snapshot(&self, pool: &PoolCounters) -> StatsSnapshot {
        StatsSnapshot {
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            blocks_stashed: self.blocks_stashed.load(Ordering::Relaxed),
            blocks_bypassed: self.blocks_bypassed.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            stash_dropped: self.stash_dropped.load(Ordering::Relaxed),
            script_errors: self.script_errors.load(Ordering::Relaxed),
            regions_committed: self.regions_committed.load(Ordering::Relaxed),
            growth_requests: pool.growth_requests(),
            regions: pool.regions(),
            used: pool.used(),
            space: pool.space(),
        }
    }
}

/// Plain copy of [`HostStats`] and [`PoolCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub blocks_processed: u64,
    pub blocks_stashed: u64,
    pub blocks_bypassed: u64,
    pub replays: u64,
    pub stash_dropped: u64,
    pub script_errors: u64,
    pub regions_committed: u64,
    pub growth_requests: u64,
    pub regions: usize,
    pub used: usize,
    pub space: usize,
}

/// Interpreter state guarded by the execution lock.
pub struct Interp {
    script: Option<Box<dyn Script>>,
    pool: Pool,
    diag: Diagnostics,
    code: String,
}

impl Interp {
    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            script: None,
            pool,
            diag: Diagnostics::default(),
            code: String::new(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut Pool {
        &mut self.pool
    }

    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diag
    }

    /// Source of the running script.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Replace the running script, releasing the old one.
    pub(crate) fn install(&mut self, script: Box<dyn Script>, source: &str) {
        if let Some(mut old) = self.script.replace(script) {
            old.release(&mut self.pool);
        }
        self.code.clear();
        self.code.push_str(source);
        self.diag.loaded();
    }

    pub(crate) fn save(&mut self, forge: &mut Forge<'_>) -> Result<(), ScriptError> {
        match self.script.as_mut() {
            Some(script) => script.save(forge, &self.pool),
            None => Err(ScriptError::Runtime("no script loaded")),
        }
    }

    pub(crate) fn restore(&mut self, state: View<'_>) -> Result<(), ScriptError> {
        match self.script.as_mut() {
            Some(script) => script.restore(state, &mut self.pool),
            None => Err(ScriptError::Runtime("no script loaded")),
        }
    }

    fn run(
        &mut self,
        reader: &Reader,
        inputs: &[Option<View<'_>>],
        outputs: &mut [Option<Forge<'_>>],
        frames: u32,
    ) -> Result<(), ScriptError> {
        let script = self
            .script
            .as_mut()
            .ok_or(ScriptError::Runtime("no script loaded"))?;
        let mut cx = RunContext::new(
            frames,
            inputs,
            outputs,
            &mut self.pool,
            reader,
            &mut self.diag.trace,
        );
        script.run(&mut cx)
    }
}

impl Drop for Interp {
    fn drop(&mut self) {
        // The script gives its memory back before the pool releases regions.
        if let Some(mut script) = self.script.take() {
            script.release(&mut self.pool);
        }
    }
}

/// State touched only by the audio thread.
struct Rt {
    reader: Reader,
    stashes: Vec<Stash>,
    stashed_frames: i64,
    stashed_blocks: u32,
    bypass: BypassMode,
    signals: Producer<u8>,
    stats: Arc<HostStats>,
}

/// The audio-thread handle.
pub struct ScriptHost {
    lock: Arc<ExecLock<Interp>>,
    rt: Rt,
    map: UridMap,
    counters: Arc<PoolCounters>,
    output_ports: usize,
}

impl ScriptHost {
    /// Build the host and its worker. Not real-time safe.
    ///
    /// Fails if the configuration is invalid, region 0 cannot be mapped or
    /// the initial script does not compile.
    pub fn new<C>(config: HostConfig, compiler: C) -> Result<(ScriptHost, Worker), HostError>
    where
        C: Compiler + 'static,
    {
        config.validate()?;

        let mut map = UridMap::new();
        let urids = Urids::new(&mut map);
        let reader = Reader::new(urids);

        let (pool, growth_rx) = Pool::new(config.initial_region_size, config.max_regions)?;
        let counters = Arc::clone(pool.counters());
        let mut interp = Interp::new(pool);
        let mut compiler: Box<dyn Compiler> = Box::new(compiler);

        if let Some(code) = config.initial_code.as_deref() {
            let script = compiler.compile(code, interp.pool_mut()).map_err(|err| {
                log::error!("initial script rejected: {err}");
                err
            })?;
            interp.install(script, code);
        }

        let stashes: Vec<Stash> = (0..config.input_ports)
            .map(|_| Stash::new(config.stash_capacity, urids))
            .collect();
        assert_invariant(
            HOST_PORTS_BOUND,
            stashes.len() <= MAX_PORTS && config.output_ports <= MAX_PORTS,
            "Port counts within fixed per-block arrays",
            Some("ScriptHost::new"),
        );

        let (signals, signal_rx) = new_invariant_queue();
        let stats = Arc::new(HostStats::default());
        let lock = Arc::new(ExecLock::new(interp));

        let worker = Worker::new(
            Arc::clone(&lock),
            growth_rx,
            signal_rx,
            compiler,
            reader.clone(),
            &config,
            Arc::clone(&stats),
            Arc::clone(&counters),
        );

        log::info!(
            "script host ready: {} byte initial region, up to {} regions, {}/{} ports",
            config.initial_region_size,
            config.max_regions,
            config.input_ports,
            config.output_ports
        );

        let host = ScriptHost {
            lock,
            rt: Rt {
                reader,
                stashes,
                stashed_frames: 0,
                stashed_blocks: 0,
                bypass: config.bypass,
                signals,
                stats,
            },
            map,
            counters,
            output_ports: config.output_ports,
        };
        Ok((host, worker))
    }

    /// Process one block of `frames` frames.
    ///
    /// `inputs[i]` holds the sequence atom for input port `i`; each
    /// `outputs[i]` receives one sequence atom. Extra ports are ignored.
    pub fn process(
        &mut self,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
        frames: u32,
    ) -> BlockOutcome {
        let inputs = &inputs[..inputs.len().min(self.rt.stashes.len())];
        let ports = outputs.len().min(self.output_ports);
        let outputs = &mut outputs[..ports];
        let growth_before = self.counters.growth_requests();

        let outcome = match self.lock.try_lock() {
            Some(mut interp) => self.rt.locked(&mut interp, inputs, outputs, frames),
            None => self.rt.stash(inputs, outputs, frames),
        };

        if self.counters.growth_requests() != growth_before {
            signal_invariant(&mut self.rt.signals, INV_GROWTH_REQUESTED);
        }
        signal_invariant(&mut self.rt.signals, INV_RT_CALLBACK_CLEAN);
        outcome
    }

    /// Write pending control messages (code echo, error, trace lines) as a
    /// sequence into `out`, all at time `frames - 1`.
    ///
    /// Writes an empty sequence if the worker holds the lock. Pending
    /// messages stay pending until a call writes all of them.
    pub fn control_out(&mut self, out: &mut [u8], frames: u32) -> Result<usize, ForgeError> {
        let urids = *self.rt.reader.urids();
        let mut forge = Forge::new(out, urids);
        let seq = forge.sequence()?;
        let Some(mut guard) = self.lock.try_lock() else {
            forge.close(seq)?;
            return forge.finish();
        };
        let at = i64::from(frames.saturating_sub(1));
        emit_diagnostics(&mut forge, &guard, at)?;
        forge.close(seq)?;
        let len = forge.finish()?;
        guard.diag.sent();
        Ok(len)
    }

    /// Blocks are waiting in the stash.
    pub fn is_replay_pending(&self) -> bool {
        self.rt.stashed_blocks > 0
    }

    pub fn reader(&self) -> &Reader {
        &self.rt.reader
    }

    pub fn urids(&self) -> &Urids {
        self.rt.reader.urids()
    }

    /// Map an extra URI. Not real-time safe.
    pub fn map_uri(&mut self, uri: &str) -> u32 {
        self.map.map(uri)
    }

    pub fn urid_map(&self) -> &UridMap {
        &self.map
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.rt.stats.snapshot(&self.counters)
    }
}

impl Rt {
    fn locked(
        &mut self,
        interp: &mut Interp,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
        frames: u32,
    ) -> BlockOutcome {
        if !interp.has_script() || interp.diag.sticky {
            let reason = if interp.has_script() {
                BypassReason::Disabled
            } else {
                BypassReason::NoScript
            };
            self.discard_stash();
            return self.bypassed(reason, inputs, outputs);
        }

        let replay = self.stashed_blocks > 0;
        let replay_frames = u32::try_from(self.stashed_frames).unwrap_or(u32::MAX);
        let stashes = replay.then_some(self.stashes.as_slice());
        let reader = &self.reader;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            execute(interp, reader, stashes, replay_frames, inputs, outputs, frames)
        }))
        .unwrap_or(Err(ScriptError::Runtime("script panicked")));

        // Stashed events reach the script at most once.
        if replay {
            self.consume_stash(result.is_ok());
        }

        match result {
            Ok(()) => {
                HostStats::bump(&self.stats.blocks_processed, 1);
                signal_invariant(&mut self.signals, INV_BLOCK_PROCESSED);
                BlockOutcome::Processed { replayed: replay }
            }
            Err(err) if err.is_sticky() => {
                interp.diag.report(&err, true);
                HostStats::bump(&self.stats.script_errors, 1);
                signal_invariant(&mut self.signals, INV_SCRIPT_ERROR);
                self.bypassed(BypassReason::Error, inputs, outputs)
            }
            Err(err) => {
                let reason = match err {
                    ScriptError::OutOfMemory => {
                        signal_invariant(&mut self.signals, INV_OOM_BYPASS);
                        BypassReason::OutOfMemory
                    }
                    _ => {
                        signal_invariant(&mut self.signals, INV_FORGE_OVERFLOW);
                        BypassReason::Overflow
                    }
                };
                self.bypassed(reason, inputs, outputs)
            }
        }
    }

    fn stash(&mut self, inputs: &[&[u8]], outputs: &mut [&mut [u8]], frames: u32) -> BlockOutcome {
        self.append(inputs, frames);
        HostStats::bump(&self.stats.blocks_stashed, 1);
        signal_invariant(&mut self.signals, INV_BLOCK_STASHED);
        write_bypass(self.bypass, &self.reader, inputs, outputs);
        BlockOutcome::Stashed
    }

    fn append(&mut self, inputs: &[&[u8]], frames: u32) {
        for (port, stash) in self.stashes.iter_mut().enumerate() {
            let view = inputs.get(port).and_then(|buf| self.reader.view(buf));
            let was_failed = stash.is_failed();
            stash.append_block(view, frames);
            if stash.is_failed() && !was_failed {
                signal_invariant(&mut self.signals, INV_STASH_OVERFLOW);
            }
        }
        self.stashed_frames += i64::from(frames);
        self.stashed_blocks += 1;
    }

    fn bypassed(
        &mut self,
        reason: BypassReason,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> BlockOutcome {
        HostStats::bump(&self.stats.blocks_bypassed, 1);
        write_bypass(self.bypass, &self.reader, inputs, outputs);
        BlockOutcome::Bypassed(reason)
    }

    fn reset_stash(&mut self) {
        for stash in &mut self.stashes {
            stash.reset();
        }
        self.stashed_frames = 0;
        self.stashed_blocks = 0;
    }

    fn consume_stash(&mut self, delivered: bool) {
        let dropped: u64 = self.stashes.iter().map(Stash::dropped).sum();
        HostStats::bump(&self.stats.stash_dropped, dropped);
        if delivered {
            HostStats::bump(&self.stats.replays, 1);
            signal_invariant(&mut self.signals, INV_STASH_REPLAYED);
        }
        self.reset_stash();
    }

    fn discard_stash(&mut self) {
        if self.stashed_blocks > 0 {
            self.reset_stash();
        }
    }
}

/// Replay (if any) then run the live block into freshly opened output
/// sequences.
fn execute(
    interp: &mut Interp,
    reader: &Reader,
    stashes: Option<&[Stash]>,
    replay_frames: u32,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
    frames: u32,
) -> Result<(), ScriptError> {
    let urids = *reader.urids();
    let ports = outputs.len().min(MAX_PORTS);
    let mut forges: [Option<Forge<'_>>; MAX_PORTS] = std::array::from_fn(|_| None);
    let mut seqs: [Option<Frame>; MAX_PORTS] = [None; MAX_PORTS];
    for ((forge, seq), out) in forges
        .iter_mut()
        .zip(seqs.iter_mut())
        .zip(outputs.iter_mut())
    {
        let mut opened = Forge::new(out, urids);
        *seq = Some(opened.sequence()?);
        *forge = Some(opened);
    }

    if let Some(stashes) = stashes {
        let mut views: [Option<View<'_>>; MAX_PORTS] = [None; MAX_PORTS];
        for (view, stash) in views.iter_mut().zip(stashes) {
            *view = reader.view(stash.sequence());
        }
        let count = stashes.len().min(MAX_PORTS);
        interp.run(reader, &views[..count], &mut forges[..ports], replay_frames)?;
        // Replayed output is flushed late, at the start of this block.
        for (forge, seq) in forges.iter_mut().zip(&seqs) {
            if let (Some(forge), Some(seq)) = (forge.as_mut(), seq) {
                forge.zero_times(seq)?;
            }
        }
    }

    let mut views: [Option<View<'_>>; MAX_PORTS] = [None; MAX_PORTS];
    for (view, buf) in views.iter_mut().zip(inputs) {
        *view = reader.view(buf);
    }
    let count = inputs.len().min(MAX_PORTS);
    interp.run(reader, &views[..count], &mut forges[..ports], frames)?;

    for (forge, seq) in forges.iter_mut().zip(&seqs) {
        if let (Some(forge), Some(seq)) = (forge.as_mut(), seq) {
            forge.close(*seq)?;
            forge.finish()?;
        }
    }
    Ok(())
}

fn write_bypass(mode: BypassMode, reader: &Reader, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) {
    for (port, out) in outputs.iter_mut().enumerate() {
        if mode == BypassMode::Passthrough {
            let copied = inputs.get(port).and_then(|buf| {
                let total = Atom::parse_complete(buf)?.total_size();
                let dst = out.get_mut(..total)?;
                dst.copy_from_slice(&buf[..total]);
                Some(())
            });
            if copied.is_some() {
                continue;
            }
        }
        let mut forge = Forge::new(out, *reader.urids());
        let written = forge.sequence().and_then(|seq| forge.close(seq));
        if written.is_err() {
            // Too small for a sequence header.
            out.fill(0);
        }
    }
}

fn emit_diagnostics(forge: &mut Forge<'_>, interp: &Interp, at: i64) -> Result<(), ForgeError> {
    let diag = &interp.diag;
    if diag.code_pending {
        forge.time(at)?;
        ControlMessage::Code(&interp.code).forge(forge)?;
    }
    if diag.error_pending {
        forge.time(at)?;
        ControlMessage::Error(diag.error.as_str()).forge(forge)?;
    }
    for line in diag.trace.lines() {
        forge.time(at)?;
        ControlMessage::Trace(line).forge(forge)?;
    }
    Ok(())
}
