//! Small helpers shared by the executors.
//!
//! Shell quoting for command lines and a bounded ring buffer for output tails.

pub mod shell;
mod tail;

pub use shell::{quote_arg, quote_path, remote_join};
pub use tail::{OutputTail, DEFAULT_TAIL_LINES};
