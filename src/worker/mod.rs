//! Worker process management
//!
//! Resolving the worker executable under the trust policy, building its
//! command line and environment, and tearing it down again.

mod command;
mod resolve;
mod terminate;

pub use command::{
    ephemeral_command, parse_environment, persistent_command, split_arguments, ENV_EXTERNAL,
    ENV_PERSISTENT,
};
pub use resolve::resolve_executable;
pub use terminate::Terminator;
