//! Expression codec: parameters in, CAD interchange text out.
//!
//! The CAD tool imports design parameters from a plain-text file whose first
//! line is `// Version: 3` followed by one expression per line. This module
//! owns the parameter model, the line grammar and the atomic file write.

mod expression;
mod file;
mod parameter;

pub use expression::{decode_line, encode};
pub use file::{
    parse_expression_file, read_expression_file, render_expression_file,
    write_expression_file, EXPRESSION_FILE_HEADER,
};
pub use parameter::{ParamType, Parameter, ParameterSet};

pub(crate) use parameter::is_identifier;
