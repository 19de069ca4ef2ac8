//! Real-time-safe substrate for hosting a scripting interpreter inside an
//! audio plugin.
//!
//! - [`pool`] / [`region`]: a two-level segregated-fit allocator over pinned
//!   regions that grow geometrically on request from the worker thread
//! - [`lock`] / [`stash`]: the execution lock the audio thread only ever
//!   try-locks, and the per-port stash that buffers events while it loses
//! - [`atom`], [`driver`], [`view`], [`forge`]: zero-copy reading and bounded
//!   writing of the binary atom event format
//! - [`host`] / [`worker`]: the two thread-side handles tying it together
//!
//! The interpreter itself plugs in through [`script::Compiler`] and
//! [`script::Script`].

pub mod atom;
pub mod config;
pub mod control;
pub mod driver;
pub mod forge;
#[doc(hidden)]
pub mod harness;
pub mod host;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod lock;
pub mod pool;
pub mod region;
pub mod script;
pub mod stash;
pub mod urid;
pub mod view;
pub mod worker;

pub use atom::{Atom, Key, Value};
pub use config::{BypassMode, ConfigError, HostConfig, MAX_PORTS};
pub use control::ControlMessage;
pub use driver::{Driver, Reader};
pub use forge::{Forge, ForgeError, Frame};
pub use host::{BlockOutcome, BypassReason, HostError, ScriptHost, StatsSnapshot};
pub use pool::{Pool, PoolError, PoolPtr};
pub use script::{Compiler, RunContext, Script, ScriptError};
pub use urid::{UridMap, Urids};
pub use view::View;
pub use worker::Worker;
