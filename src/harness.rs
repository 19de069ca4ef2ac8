//! RT Proof Harness: a line-oriented toy script language and a block
//! driver, used to exercise the host in tests and benches.
//!
//! One command per line, blank lines and `--` comments ignored:
//!
//! | command       | per block                                              |
//! |---------------|--------------------------------------------------------|
//! | `echo`        | copy every input event to the output of the same index |
//! | `count`       | add input 0's event count to a counter, emit it as a long at the last frame |
//! | `hold N`      | allocate N bytes once and keep them                    |
//! | `churn N`     | allocate and free N bytes                              |
//! | `reserve N`   | allocate N bytes at compile time                       |
//! | `trace TEXT`  | append a trace line                                    |
//! | `flood N`     | write an N byte chunk at the last frame                |
//! | `rewind`      | write events at decreasing times                       |
//! | `fail`        | raise a runtime error                                  |
//! | `panic`       | panic                                                  |
//!
//! The `count` counter is the script's state: it is saved as a long atom
//! and restored from one.

use crate::atom::{Key, Value};
use crate::config::{HostConfig, MAX_PORTS};
use crate::driver::Reader;
use crate::forge::Forge;
use crate::host::{BlockOutcome, HostError, ScriptHost};
use crate::pool::{Pool, PoolPtr};
use crate::script::{Compiler, RunContext, Script, ScriptError};
use crate::view::View;
use crate::worker::Worker;

#[derive(Debug)]
enum Op {
    Echo,
    Count,
    Hold(usize),
    Churn(usize),
    Trace(String),
    Flood(Vec<u8>),
    Rewind,
    Fail,
    Panic,
}

/// Compiler for the harness language.
#[derive(Debug, Default, Clone, Copy)]
pub struct HarnessCompiler;

impl Compiler for HarnessCompiler {
    fn compile(&mut self, source: &str, pool: &mut Pool) -> Result<Box<dyn Script>, ScriptError> {
        let mut reserved = Vec::new();
        let ops = match parse(source, pool, &mut reserved) {
            Ok(ops) => ops,
            Err(err) => {
                for (ptr, bytes) in reserved {
                    let _ = pool.free(ptr, bytes);
                }
                return Err(err);
            }
        };
        let held = vec![None; ops.len()];
        Ok(Box::new(HarnessScript {
            ops,
            held,
            reserved,
            counter: 0,
        }))
    }
}

fn parse(
    source: &str,
    pool: &mut Pool,
    reserved: &mut Vec<(PoolPtr, usize)>,
) -> Result<Vec<Op>, ScriptError> {
    let mut ops = Vec::new();
    for (n, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("--") {
            continue;
        }
        let (cmd, arg) = match line.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (line, ""),
        };
        let size = || {
            arg.parse::<usize>().map_err(|_| {
                ScriptError::Compile(format!("line {}: `{cmd}` needs a byte count", n + 1))
            })
        };
        let op = match cmd {
            "echo" => Op::Echo,
            "count" => Op::Count,
            "hold" => Op::Hold(size()?),
            "churn" => Op::Churn(size()?),
            "reserve" => {
                let bytes = size()?;
                let ptr = pool.allocate(bytes).map_err(|err| {
                    ScriptError::Compile(format!("line {}: reserve failed: {err}", n + 1))
                })?;
                reserved.push((ptr, bytes));
                continue;
            }
            "trace" => Op::Trace(arg.to_owned()),
            "flood" => Op::Flood(vec![0xA5; size()?]),
            "rewind" => Op::Rewind,
            "fail" => Op::Fail,
            "panic" => Op::Panic,
            other => {
                return Err(ScriptError::Compile(format!(
                    "line {}: unknown command `{other}`",
                    n + 1
                )))
            }
        };
        ops.push(op);
    }
    Ok(ops)
}

struct HarnessScript {
    ops: Vec<Op>,
    held: Vec<Option<(PoolPtr, usize)>>,
    reserved: Vec<(PoolPtr, usize)>,
    counter: i64,
}

fn echo(cx: &mut RunContext<'_, '_>) -> Result<(), ScriptError> {
    for port in 0..cx.input_count().min(cx.output_count()) {
        let Some(input) = cx.input(port) else { continue };
        let Some(out) = cx.output(port) else { continue };
        for (key, event) in input.iter() {
            if let Key::Time(t) = key {
                out.time(t)?;
                out.atom(&event.atom())?;
            }
        }
    }
    Ok(())
}

impl Script for HarnessScript {
    fn run(&mut self, cx: &mut RunContext<'_, '_>) -> Result<(), ScriptError> {
        let last = i64::from(cx.frames().saturating_sub(1));
        let Self {
            ops, held, counter, ..
        } = self;
        for (op, slot) in ops.iter().zip(held.iter_mut()) {
            match op {
                Op::Echo => echo(cx)?,
                Op::Count => {
                    if let Some(input) = cx.input(0) {
                        *counter += input
                            .iter()
                            .filter(|(k, _)| matches!(k, Key::Time(_)))
                            .count() as i64;
                    }
                    if let Some(out) = cx.output(0) {
                        out.time(last)?;
                        out.long(*counter)?;
                    }
                }
                Op::Hold(bytes) => {
                    if slot.is_none() {
                        *slot = Some((cx.alloc(*bytes)?, *bytes));
                    }
                }
                Op::Churn(bytes) => {
                    let ptr = cx.alloc(*bytes)?;
                    cx.free(ptr, *bytes)?;
                }
                Op::Trace(text) => cx.trace(text),
                Op::Flood(bytes) => {
                    if let Some(out) = cx.output(0) {
                        out.time(last)?;
                        out.chunk(bytes)?;
                    }
                }
                Op::Rewind => {
                    if let Some(out) = cx.output(0) {
                        out.time(5)?;
                        out.int(0)?;
                        out.time(1)?;
                    }
                }
                Op::Fail => return Err(ScriptError::Runtime("script failed")),
                Op::Panic => panic!("script panicked"),
            }
        }
        Ok(())
    }

    fn save(&mut self, forge: &mut Forge<'_>, _pool: &Pool) -> Result<(), ScriptError> {
        forge.long(self.counter)?;
        Ok(())
    }

    fn restore(&mut self, state: View<'_>, _pool: &mut Pool) -> Result<(), ScriptError> {
        match state.value() {
            Value::Long(n) => {
                self.counter = n;
                Ok(())
            }
            _ => Err(ScriptError::Runtime("state is not a counter")),
        }
    }

    fn release(&mut self, pool: &mut Pool) {
        for (ptr, bytes) in self.held.iter_mut().filter_map(Option::take) {
            let _ = pool.free(ptr, bytes);
        }
        for (ptr, bytes) in self.reserved.drain(..) {
            let _ = pool.free(ptr, bytes);
        }
    }
}

/// Drives a [`ScriptHost`] with pre-allocated port buffers.
///
/// `run_block` does not allocate, so it can sit inside an allocation
/// counting region.
pub struct RtHarness {
    pub host: ScriptHost,
    pub worker: Worker,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
}

impl RtHarness {
    /// Port buffer size used by [`RtHarness::new`].
    pub const PORT_BYTES: usize = 4096;

    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        Self::with_port_bytes(config, Self::PORT_BYTES)
    }

    pub fn with_port_bytes(config: HostConfig, port_bytes: usize) -> Result<Self, HostError> {
        let inputs = vec![vec![0u8; port_bytes]; config.input_ports];
        let outputs = vec![vec![0u8; port_bytes]; config.output_ports];
        let (host, worker) = ScriptHost::new(config, HarnessCompiler)?;
        let mut harness = Self {
            host,
            worker,
            inputs,
            outputs,
        };
        for port in 0..harness.inputs.len() {
            harness.set_input(port, &[]);
        }
        Ok(harness)
    }

    /// Fill input `port` with int events `(time, value)`.
    ///
    /// # Panics
    /// If the events do not fit the port buffer.
    pub fn set_input(&mut self, port: usize, events: &[(i64, i32)]) {
        let urids = *self.host.urids();
        let mut forge = Forge::new(&mut self.inputs[port], urids);
        let seq = forge.sequence().expect("input port too small");
        for &(t, v) in events {
            forge.time(t).expect("input event");
            forge.int(v).expect("input event");
        }
        forge.close(seq).expect("input port too small");
    }

    /// Run one block over the current inputs.
    pub fn run_block(&mut self, frames: u32) -> BlockOutcome {
        drive(&mut self.host, &self.inputs, &mut self.outputs, frames)
    }

    /// Run one block while the worker holds the execution lock.
    pub fn run_block_contended(&mut self, frames: u32) -> BlockOutcome {
        let guard = self.worker.lock();
        let outcome = drive(&mut self.host, &self.inputs, &mut self.outputs, frames);
        drop(guard);
        outcome
    }

    pub fn output(&self, port: usize) -> &[u8] {
        &self.outputs[port]
    }

    pub fn reader(&self) -> &Reader {
        self.host.reader()
    }

    /// Output `port` as `(time, value)` pairs; ints and longs only.
    pub fn output_events(&self, port: usize) -> Vec<(i64, i64)> {
        let Some(seq) = self.reader().view(&self.outputs[port]) else {
            return Vec::new();
        };
        seq.iter()
            .filter_map(|(key, event)| {
                let Key::Time(t) = key else { return None };
                match event.value() {
                    Value::Int(v) => Some((t, i64::from(v))),
                    Value::Long(v) => Some((t, v)),
                    _ => None,
                }
            })
            .collect()
    }
}

fn drive(
    host: &mut ScriptHost,
    inputs: &[Vec<u8>],
    outputs: &mut [Vec<u8>],
    frames: u32,
) -> BlockOutcome {
    let mut ins: [&[u8]; MAX_PORTS] = [&[]; MAX_PORTS];
    for (slot, buf) in ins.iter_mut().zip(inputs) {
        *slot = buf.as_slice();
    }
    let (n_in, n_out) = (inputs.len(), outputs.len());
    let mut outs: [&mut [u8]; MAX_PORTS] = Default::default();
    for (slot, buf) in outs.iter_mut().zip(outputs.iter_mut()) {
        *slot = buf.as_mut_slice();
    }
    host.process(&ins[..n_in], &mut outs[..n_out], frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BypassReason;

    #[test]
    fn harness_basic() {
        let mut harness = RtHarness::new(HostConfig::default().with_initial_code("echo")).unwrap();
        harness.set_input(0, &[(1, 10), (7, 20)]);
        assert_eq!(harness.run_block(64), BlockOutcome::Processed { replayed: false });
        assert_eq!(harness.output_events(0), vec![(1, 10), (7, 20)]);
    }

    #[test]
    fn unknown_command_names_the_line() {
        let mut pool = Pool::new(4096, 1).unwrap().0;
        let err = HarnessCompiler
            .compile("echo\n\n-- note\nfrobnicate 3", &mut pool)
            .err()
            .unwrap();
        assert_eq!(
            err,
            ScriptError::Compile("line 4: unknown command `frobnicate`".into())
        );
    }

    #[test]
    fn release_returns_all_memory() {
        let mut pool = Pool::new(64 * 1024, 1).unwrap().0;
        let mut script = HarnessCompiler.compile("reserve 500", &mut pool).unwrap();
        assert!(pool.used() >= 500);
        script.release(&mut pool);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn rewind_disables_script() {
        let mut harness = RtHarness::new(HostConfig::default().with_initial_code("rewind")).unwrap();
        assert_eq!(
            harness.run_block(64),
            BlockOutcome::Bypassed(BypassReason::Error)
        );
    }
}
