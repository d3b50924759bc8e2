//! Stage definitions.
//!
//! A stage is a declarative record: what to run, where, with which inputs and
//! expected outputs, under which timeout and retry budget. Stages carry no
//! behaviour beyond validation; the executors interpret them.

mod definition;
mod pipeline;
mod template;

pub use definition::{
    validate, AvailableInputs, ExportOptions, FileRef, InputRef, ObjectType, Stage, StageTarget,
    MAX_TIMEOUT_SECS,
};
pub use pipeline::{Pipeline, EXPRESSIONS_FILE};
pub use template::{CommandTemplate, Placeholder, TemplateContext};

pub(crate) use definition::env_name;
