//! Worker module: the non-real-time side of the script host.
//!
//! The worker maps new pool regions, compiles and swaps scripts, and moves
//! script state in and out. Every call may block on the execution lock and
//! may allocate; none of it belongs on the audio thread. While the worker
//! holds the lock the audio side stashes its input.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rtrb::Consumer;

use crate::atom::Atom;
use crate::config::HostConfig;
use crate::control::ControlMessage;
use crate::driver::Reader;
use crate::forge::Forge;
use crate::host::{HostError, HostStats, Interp, StatsSnapshot};
use crate::invariant_ppt::{assert_invariant, SCRIPT_SWAP_UNDER_LOCK, STATE_RESTORED};
use crate::invariant_rt::drain_invariant_signals;
use crate::lock::{ExecGuard, ExecLock, LockState};
use crate::pool::{region_size, GrowthRequest, PoolCounters};
use crate::region::Region;
use crate::script::Compiler;

/// Non-real-time handle, created together with its
/// [`ScriptHost`](crate::host::ScriptHost).
pub struct Worker {
    lock: Arc<ExecLock<Interp>>,
    growth_rx: Consumer<GrowthRequest>,
    signal_rx: Consumer<u8>,
    compiler: Box<dyn Compiler>,
    reader: Reader,
    base_size: usize,
    state_capacity: usize,
    stats: Arc<HostStats>,
    counters: Arc<PoolCounters>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        lock: Arc<ExecLock<Interp>>,
        growth_rx: Consumer<GrowthRequest>,
        signal_rx: Consumer<u8>,
        compiler: Box<dyn Compiler>,
        reader: Reader,
        config: &HostConfig,
        stats: Arc<HostStats>,
        counters: Arc<PoolCounters>,
    ) -> Self {
        Self {
            lock,
            growth_rx,
            signal_rx,
            compiler,
            reader,
            base_size: config.initial_region_size,
            state_capacity: config.state_capacity,
            stats,
            counters,
        }
    }

    /// Answer pending growth requests. Returns the number of regions added.
    ///
    /// Mapping happens without the lock; only the commit takes it. A failed
    /// mapping stops further growth and is returned as an error.
    pub fn service_growth(&mut self) -> Result<usize, HostError> {
        let mut committed = 0;
        while let Ok(request) = self.growth_rx.pop() {
            let index = request.region_index;
            let size = region_size(self.base_size, index).unwrap_or(0);
            let region = match Region::acquire(index, size) {
                Ok(region) => region,
                Err(err) => {
                    log::error!("pool growth to region {index} failed: {err}");
                    self.lock.lock().pool_mut().abandon_growth();
                    return Err(err.into());
                }
            };
            self.lock.lock().pool_mut().commit(region).map_err(|err| {
                log::error!("region {index} rejected by pool: {err}");
                err
            })?;
            self.stats
                .regions_committed
                .fetch_add(1, Ordering::Relaxed);
            log::info!(
                "committed region {index} ({size} bytes), pool space now {}",
                self.counters.space()
            );
            committed += 1;
        }
        Ok(committed)
    }

    /// Compile `source` and swap it in, carrying the old script's state.
    ///
    /// On a compile error the running script stays in place and the error
    /// is queued for `control_out`.
    pub fn load_script(&mut self, source: &str) -> Result<(), HostError> {
        let mut scratch = vec![0u8; self.state_capacity];
        let urids = *self.reader.urids();
        let mut guard = self.lock.lock();
        assert_invariant(
            SCRIPT_SWAP_UNDER_LOCK,
            guard.owner() == LockState::Worker,
            "Script swap runs under the worker's lock",
            Some("Worker::load_script"),
        );
        let interp = &mut *guard;

        let saved = if interp.has_script() {
            let mut forge = Forge::new(&mut scratch, urids);
            let result = interp
                .save(&mut forge)
                .and_then(|()| forge.finish().map_err(Into::into));
            match result {
                Ok(len) => len,
                Err(err) => {
                    log::warn!("state of the running script not carried over: {err}");
                    0
                }
            }
        } else {
            0
        };

        let mut script = match self.compiler.compile(source, interp.pool_mut()) {
            Ok(script) => script,
            Err(err) => {
                log::warn!("script rejected, keeping the running one: {err}");
                interp.diagnostics_mut().report(&err, false);
                return Err(err.into());
            }
        };

        if let Some(state) = Atom::parse_complete(&scratch[..saved]) {
            let view = self.reader.view_atom(state);
            if let Err(err) = script.restore(view, interp.pool_mut()) {
                log::warn!("new script could not take over state: {err}");
            }
        }

        interp.install(script, source);
        log::info!("script loaded ({} bytes of source)", source.len());
        Ok(())
    }

    /// Handle one control atom. Returns whether it was a code message.
    pub fn control_in(&mut self, message: &[u8]) -> Result<bool, HostError> {
        let source = match self.reader.view(message).and_then(ControlMessage::from_view) {
            Some(ControlMessage::Code(source)) => source.to_owned(),
            _ => return Ok(false),
        };
        self.load_script(&source)?;
        Ok(true)
    }

    /// Serialize the running script's state as one atom.
    pub fn save_state(&mut self) -> Result<Vec<u8>, HostError> {
        let mut scratch = vec![0u8; self.state_capacity];
        let mut guard = self.lock.lock();
        if !guard.has_script() {
            return Err(HostError::NoScript);
        }
        let mut forge = Forge::new(&mut scratch, *self.reader.urids());
        guard.save(&mut forge)?;
        let len = forge.finish()?;
        drop(guard);
        scratch.truncate(len);
        Ok(scratch)
    }

    /// Hand a previously saved atom to the running script.
    pub fn restore_state(&mut self, state: &[u8]) -> Result<(), HostError> {
        let atom = Atom::parse_complete(state).ok_or(HostError::InvalidState)?;
        let view = self.reader.view_atom(atom);
        let mut guard = self.lock.lock();
        if !guard.has_script() {
            return Err(HostError::NoScript);
        }
        assert_invariant(
            STATE_RESTORED,
            guard.owner() == LockState::Worker,
            "State restore runs under the worker's lock",
            Some("Worker::restore_state"),
        );
        guard.restore(view)?;
        Ok(())
    }

    /// Take the execution lock, as any worker operation does.
    ///
    /// Blocks processed while the guard lives are stashed.
    pub fn lock(&self) -> ExecGuard<'_, Interp> {
        self.lock.lock()
    }

    /// Collect the audio thread's invariant signals since the last call.
    pub fn drain_signals(&mut self) -> Vec<u8> {
        drain_invariant_signals(&mut self.signal_rx)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.counters)
    }

    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::HarnessCompiler;
    use crate::host::ScriptHost;

    #[test]
    fn compile_error_keeps_running_script() {
        let config = HostConfig::default().with_initial_code("echo");
        let (_host, mut worker) = ScriptHost::new(config, HarnessCompiler).unwrap();
        let err = worker.load_script("echo\nwobble").unwrap_err();
        assert!(matches!(err, HostError::Script(_)));
        let guard = worker.lock();
        assert_eq!(guard.code(), "echo");
        assert!(guard.diagnostics().error_pending);
        assert!(guard.diagnostics().error.as_str().contains("line 2"));
        assert!(!guard.diagnostics().sticky);
    }

    #[test]
    fn state_moves_between_scripts() {
        let config = HostConfig::default().with_initial_code("count");
        let (_host, mut worker) = ScriptHost::new(config, HarnessCompiler).unwrap();

        let mut buf = [0u8; 16];
        let mut forge = Forge::new(&mut buf, *worker.reader.urids());
        forge.long(41).unwrap();
        worker.restore_state(&buf).unwrap();

        worker.load_script("count\necho").unwrap();
        let saved = worker.save_state().unwrap();
        let view = worker.reader.view(&saved).unwrap();
        assert_eq!(view.value(), crate::atom::Value::Long(41));
    }

    #[test]
    fn restore_rejects_partial_atom() {
        let config = HostConfig::default().with_initial_code("count");
        let (_host, mut worker) = ScriptHost::new(config, HarnessCompiler).unwrap();
        assert!(matches!(
            worker.restore_state(&[16, 0, 0, 0, 1, 0]),
            Err(HostError::InvalidState)
        ));
    }

    #[test]
    fn save_without_script_fails() {
        let (_host, mut worker) = ScriptHost::new(HostConfig::default(), HarnessCompiler).unwrap();
        assert!(matches!(worker.save_state(), Err(HostError::NoScript)));
    }
}
