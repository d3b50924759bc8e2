//! Command templates with `{placeholder}` substitution.
//!
//! Recognised placeholders: `{workdir}`, `{run_id}`, `{stage_id}`,
//! `{attempt}`, `{expressions}`, `{input.NAME}`, `{output.NAME}` and
//! `{param.NAME}`. Substituted values are shell-quoted. Shell expansions such
//! as `${HOME}` are left alone.

use crate::codec::ParameterSet;
use crate::errors::{ValidationCode, ValidationError};
use crate::utils::quote_arg;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\$?)\{([a-z_]+)(?:\.([A-Za-z0-9_\-]+))?\}")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

const SCALAR_KEYS: [&str; 5] = ["workdir", "run_id", "stage_id", "attempt", "expressions"];

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// One of the run/stage scalars.
    Scalar(String),
    /// `{input.NAME}`.
    Input(String),
    /// `{output.NAME}`.
    Output(String),
    /// `{param.NAME}`.
    Param(String),
}

/// A shell command with placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    /// Wraps a template string.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// The raw template.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lists the placeholders used, in order of appearance.
    ///
    /// # Errors
    ///
    /// Returns a template error for unknown keys.
    pub fn placeholders(&self) -> Result<Vec<Placeholder>, ValidationError> {
        PLACEHOLDER
            .captures_iter(&self.0)
            .filter(|caps| caps[1].is_empty())
            .map(|caps| parse_placeholder(&caps))
            .collect()
    }

    /// Substitutes every placeholder.
    ///
    /// # Errors
    ///
    /// Returns a template error for unknown keys or names.
    pub fn render(&self, ctx: &TemplateContext) -> Result<String, ValidationError> {
        let mut error = None;
        let rendered = PLACEHOLDER.replace_all(&self.0, |caps: &Captures<'_>| {
            if !caps[1].is_empty() {
                return caps[0].to_string();
            }
            let resolved = parse_placeholder(caps).and_then(|p| ctx.resolve(&p));
            match resolved {
                Ok(value) => quote_arg(&value),
                Err(e) => {
                    error.get_or_insert(e);
                    String::new()
                }
            }
        });
        match error {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }
}

impl From<&str> for CommandTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CommandTemplate {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn template_error(message: String, subject: &str) -> ValidationError {
    ValidationError::new(ValidationCode::Template, message).with_subjects(vec![subject.to_string()])
}

fn parse_placeholder(caps: &Captures<'_>) -> Result<Placeholder, ValidationError> {
    let key = &caps[2];
    let name = caps.get(3).map(|m| m.as_str().to_string());
    match (key, name) {
        (k, None) if SCALAR_KEYS.contains(&k) => Ok(Placeholder::Scalar(k.to_string())),
        ("input", Some(n)) => Ok(Placeholder::Input(n)),
        ("output", Some(n)) => Ok(Placeholder::Output(n)),
        ("param", Some(n)) => Ok(Placeholder::Param(n)),
        _ => Err(template_error(
            format!("Unknown placeholder '{}'", &caps[0]),
            &caps[0],
        )),
    }
}

/// Values available to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    scalars: HashMap<String, String>,
    inputs: HashMap<String, String>,
    outputs: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl TemplateContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a scalar (`workdir`, `run_id`, ...).
    #[must_use]
    pub fn with_scalar(mut self, key: &str, value: impl Into<String>) -> Self {
        self.scalars.insert(key.to_string(), value.into());
        self
    }

    /// Sets an input path.
    #[must_use]
    pub fn with_input(mut self, name: &str, path: impl Into<String>) -> Self {
        self.inputs.insert(name.to_string(), path.into());
        self
    }

    /// Sets an output path.
    #[must_use]
    pub fn with_output(mut self, name: &str, path: impl Into<String>) -> Self {
        self.outputs.insert(name.to_string(), path.into());
        self
    }

    /// Adds every parameter's plain value.
    #[must_use]
    pub fn with_params(mut self, params: &ParameterSet) -> Self {
        for param in params {
            let value = match &param.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.params.insert(param.name.clone(), value);
        }
        self
    }

    fn resolve(&self, placeholder: &Placeholder) -> Result<String, ValidationError> {
        let (map, kind, name) = match placeholder {
            Placeholder::Scalar(key) => (&self.scalars, "value", key),
            Placeholder::Input(name) => (&self.inputs, "input", name),
            Placeholder::Output(name) => (&self.outputs, "output", name),
            Placeholder::Param(name) => (&self.params, "parameter", name),
        };
        map.get(name)
            .cloned()
            .ok_or_else(|| template_error(format!("Template references unknown {kind} '{name}'"), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Parameter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_quotes_values() {
        let params = ParameterSet::new()
            .with(Parameter::number("L4", 2.5).unwrap())
            .unwrap();
        let ctx = TemplateContext::new()
            .with_scalar("workdir", "/runs/my run")
            .with_input("geometry", "model.step")
            .with_params(&params);

        let cmd = CommandTemplate::new("cd {workdir} && mesher {input.geometry} --size {param.L4}");
        assert_eq!(
            cmd.render(&ctx).unwrap(),
            "cd '/runs/my run' && mesher model.step --size 2.5"
        );
    }

    #[test]
    fn test_shell_expansion_untouched() {
        let cmd = CommandTemplate::new("echo ${HOME} {attempt}");
        let ctx = TemplateContext::new().with_scalar("attempt", "2");
        assert_eq!(cmd.render(&ctx).unwrap(), "echo ${HOME} 2");
    }

    #[test]
    fn test_unknown_placeholder() {
        let cmd = CommandTemplate::new("solver {solver_path}");
        let err = cmd.placeholders().unwrap_err();
        assert_eq!(err.code, ValidationCode::Template);

        let err = CommandTemplate::new("x {output.result}")
            .render(&TemplateContext::new())
            .unwrap_err();
        assert_eq!(err.subjects, vec!["result".to_string()]);
    }

    #[test]
    fn test_placeholders_listed_in_order() {
        let cmd = CommandTemplate::new("{expressions} {input.a} {param.b}");
        assert_eq!(
            cmd.placeholders().unwrap(),
            vec![
                Placeholder::Scalar("expressions".into()),
                Placeholder::Input("a".into()),
                Placeholder::Param("b".into()),
            ]
        );
    }
}
