//! Managed backend processes and their scheduling groups

mod group;
mod proc;
mod state;

pub use group::ProcessGroup;
pub use proc::{Process, ProcessError, ProcessStatus, StopMode};
pub use state::{ProcessState, StateCell, SwapError};
