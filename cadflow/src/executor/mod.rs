//! Local stage execution.

mod local;

pub(crate) use local::{finish, transition};
pub use local::LocalExecutor;
