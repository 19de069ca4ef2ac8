//! Script module: the seam between the host and an embedded interpreter.
//!
//! The host never looks inside a script. It compiles source through a
//! [`Compiler`] on the worker, then calls [`Script::run`] once per block on
//! the audio thread with a [`RunContext`] giving access to the block's
//! input views, output forges, the pool and the trace buffer.

use thiserror::Error;

use crate::control::TraceText;
use crate::driver::Reader;
use crate::forge::{Forge, ForgeError};
use crate::pool::{Pool, PoolError, PoolPtr};
use crate::urid::Urids;
use crate::view::View;

/// Script failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// The pool could not satisfy an allocation.
    #[error("out of memory")]
    OutOfMemory,
    #[error("forge: {0}")]
    Forge(#[from] ForgeError),
    #[error("pool: {0}")]
    Pool(PoolError),
    /// Runtime failure raised by the script itself.
    #[error("{0}")]
    Runtime(&'static str),
    /// Source rejected by the compiler. Never produced on the audio thread.
    #[error("compile error: {0}")]
    Compile(String),
}

impl ScriptError {
    /// Whether the error disables the script until new code loads.
    ///
    /// Exhaustion (pool or output buffer) only costs the current block.
    pub fn is_sticky(&self) -> bool {
        !matches!(
            self,
            ScriptError::OutOfMemory | ScriptError::Forge(ForgeError::Overflow)
        )
    }
}

impl From<PoolError> for ScriptError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfMemory => ScriptError::OutOfMemory,
            other => ScriptError::Pool(other),
        }
    }
}

/// A compiled script.
pub trait Script: Send {
    /// Process one block.
    fn run(&mut self, cx: &mut RunContext<'_, '_>) -> Result<(), ScriptError>;

    /// Serialize state as one atom before the script is replaced or saved.
    fn save(&mut self, _forge: &mut Forge<'_>, _pool: &Pool) -> Result<(), ScriptError> {
        Ok(())
    }

    /// Take over state written by `save`, possibly by another script.
    fn restore(&mut self, _state: View<'_>, _pool: &mut Pool) -> Result<(), ScriptError> {
        Ok(())
    }

    /// Give back every pool allocation. Called once, before the pool drops.
    fn release(&mut self, _pool: &mut Pool) {}
}

/// Turns source text into a [`Script`]. Runs on the worker only.
pub trait Compiler: Send {
    fn compile(&mut self, source: &str, pool: &mut Pool) -> Result<Box<dyn Script>, ScriptError>;
}

/// Everything a script may touch during one block.
pub struct RunContext<'a, 'b> {
    frames: u32,
    inputs: &'a [Option<View<'a>>],
    outputs: &'a mut [Option<Forge<'b>>],
    pool: &'a mut Pool,
    reader: &'a Reader,
    trace: &'a mut TraceText,
}

impl<'a, 'b> RunContext<'a, 'b> {
    pub fn new(
        frames: u32,
        inputs: &'a [Option<View<'a>>],
        outputs: &'a mut [Option<Forge<'b>>],
        pool: &'a mut Pool,
        reader: &'a Reader,
        trace: &'a mut TraceText,
    ) -> Self {
        Self {
            frames,
            inputs,
            outputs,
            pool,
            reader,
            trace,
        }
    }

    /// Frames covered by this call.
    #[inline]
    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Events on input port `port`, if it holds an atom.
    #[inline]
    pub fn input(&self, port: usize) -> Option<View<'a>> {
        self.inputs.get(port).copied().flatten()
    }

    /// Forge for output port `port`, positioned inside its open sequence.
    #[inline]
    pub fn output(&mut self, port: usize) -> Option<&mut Forge<'b>> {
        self.outputs.get_mut(port).and_then(Option::as_mut)
    }

    pub fn pool(&mut self) -> &mut Pool {
        &mut *self.pool
    }

    pub fn alloc(&mut self, size: usize) -> Result<PoolPtr, ScriptError> {
        Ok(self.pool.allocate(size)?)
    }

    pub fn free(&mut self, ptr: PoolPtr, size: usize) -> Result<(), ScriptError> {
        Ok(self.pool.free(ptr, size)?)
    }

    pub fn reader(&self) -> &'a Reader {
        self.reader
    }

    pub fn urids(&self) -> &'a Urids {
        self.reader.urids()
    }

    /// Append one line to the trace output.
    pub fn trace(&mut self, line: &str) {
        self.trace.push_line(line);
    }
}
