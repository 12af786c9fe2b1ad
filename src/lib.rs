//! Watermelon is an imperative configuration automation engine.
//!
//! An orchestrator process drives a fleet of remote hosts by invoking
//! functions defined in pluggable modules. Each module is a separately
//! built executable that connects back to the orchestrator over a
//! bidirectional RPC channel; module functions can call other modules,
//! query the host inventory, read configuration, execute shell commands on
//! remote hosts and push or pull files.
//!
//! The crate has two faces:
//!
//! - the orchestrator: [`server`], [`module`], [`inventory`], [`session`],
//!   [`host`] and the `wm` binary built on them;
//! - the module runtime: [`client`], linked into every module executable.

#[macro_use]
extern crate log;

pub mod client;
pub mod error;
pub mod host;
pub mod interact;
pub mod inventory;
pub mod logging;
pub mod module;
pub mod net;
pub mod proto;
pub mod response;
pub mod server;
pub mod session;
#[cfg(feature = "ssh")]
pub mod ssh;

pub use error::{CmdError, Error};
pub use response::Response;
