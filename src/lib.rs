pub mod clienv;
pub mod config;
pub mod control;
pub mod env_scope;
pub mod error;
pub mod executor;
pub mod os_signals;
pub mod pea;
pub mod runtime;
pub mod signal;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Backend, ControlAddress, ControlAddresses, ControlTimeout, UnitConfig};
pub use error::{PeaError, Result, RuntimeError};
pub use self::pea::{Pea, PeaHandle, UnitSpec};
pub use runtime::{BackendFactory, Runtime, RuntimeFactory};
pub use signal::Signal;
pub use supervisor::{supervise, Outcome, Phase};
