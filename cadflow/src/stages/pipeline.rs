//! Ordered stage lists and their submission-time checks.

use super::definition::{validate, AvailableInputs, Stage, MAX_TIMEOUT_SECS};
use super::template::Placeholder;
use crate::codec::ParameterSet;
use crate::errors::{ValidationCode, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the interchange file written into every run directory.
pub const EXPRESSIONS_FILE: &str = "expressions.exp";

/// An ordered list of stages. Stage *i+1* consumes what stage *i* produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Optional display name.
    #[serde(default)]
    pub name: String,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Creates a pipeline from stages.
    #[must_use]
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            name: String::new(),
            stages,
        }
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Looks a stage up by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Structural checks: non-empty, unique ids, positive timeouts, valid
    /// patterns and templates.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stages.is_empty() {
            return Err(ValidationError::config("Pipeline has no stages"));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !is_stage_id(&stage.id) {
                return Err(ValidationError::config(format!(
                    "Invalid stage id '{}': use letters, digits, '_' or '-'",
                    stage.id
                ))
                .with_subjects(vec![stage.id.clone()]));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(ValidationError::duplicate("stage", &stage.id));
            }
            if !(stage.timeout_secs > 0.0 && stage.timeout_secs <= MAX_TIMEOUT_SECS) {
                return Err(ValidationError::config(format!(
                    "Stage '{}' timeout must be positive and at most {MAX_TIMEOUT_SECS} seconds",
                    stage.id
                ))
                .with_subjects(vec![stage.id.clone()]));
            }
            stage.compiled_failure_patterns()?;
            check_template_names(stage)?;
        }
        Ok(())
    }

    /// Checks that every stage's inputs are supplied by the run inputs, the
    /// parameter set, or an earlier stage's declared outputs.
    ///
    /// # Errors
    ///
    /// Returns a missing-input error for the first stage that cannot start.
    pub fn validate_inputs(
        &self,
        params: &ParameterSet,
        run_inputs: &[String],
    ) -> Result<(), ValidationError> {
        let mut available = AvailableInputs::new()
            .with_parameters(params)
            .with_file(EXPRESSIONS_FILE);
        for input in run_inputs {
            available.add_file(input.clone());
        }

        for stage in &self.stages {
            validate(stage, &available)?;
            for param in stage.command.placeholders()? {
                if let Placeholder::Param(name) = param {
                    if !params.contains(&name) {
                        return Err(ValidationError::new(
                            ValidationCode::Template,
                            format!("Stage '{}' references unknown parameter '{name}'", stage.id),
                        )
                        .with_subjects(vec![name]));
                    }
                }
            }
            for output in &stage.expected_outputs {
                available.add_file(output.path.clone());
            }
        }
        Ok(())
    }
}

fn is_stage_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Input and output placeholders must name something the stage declares.
fn check_template_names(stage: &Stage) -> Result<(), ValidationError> {
    let inputs: HashSet<&str> = stage.file_inputs().map(|f| f.name.as_str()).collect();
    let outputs: HashSet<&str> = stage.expected_outputs.iter().map(|f| f.name.as_str()).collect();

    let templates = std::iter::once(&stage.command).chain(stage.cleanup.as_ref());
    for template in templates {
        for placeholder in template.placeholders()? {
            let (known, kind, name) = match &placeholder {
                Placeholder::Input(n) => (inputs.contains(n.as_str()), "input", n),
                Placeholder::Output(n) => (outputs.contains(n.as_str()), "output", n),
                Placeholder::Scalar(_) | Placeholder::Param(_) => continue,
            };
            if !known {
                return Err(ValidationError::new(
                    ValidationCode::Template,
                    format!("Stage '{}' references undeclared {kind} '{name}'", stage.id),
                )
                .with_subjects(vec![name.clone()]));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Parameter;
    use crate::core::StageKind;
    use crate::stages::InputRef;
    use std::time::Duration;

    fn four_stage() -> Pipeline {
        Pipeline::new(vec![
            Stage::new("cad", StageKind::CadUpdate, "cad-update {expressions}")
                .with_input(InputRef::file("model", "model.prt"))
                .with_output("part", "model_updated.prt"),
            Stage::new("export", StageKind::ExportGeometry, "export {input.part} {output.step}")
                .with_input(InputRef::file("part", "model_updated.prt"))
                .with_output("step", "model.step"),
            Stage::new("mesh", StageKind::Mesh, "mesh --size {param.L4}")
                .with_input(InputRef::file("step", "model.step"))
                .with_output("mesh", "model.msh"),
            Stage::new("solve", StageKind::Solve, "solve")
                .with_input(InputRef::file("mesh", "model.msh")),
        ])
    }

    fn params() -> ParameterSet {
        ParameterSet::new()
            .with(Parameter::number("L4", 2.0).unwrap())
            .unwrap()
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = four_stage();
        pipeline.validate().unwrap();
        pipeline
            .validate_inputs(&params(), &["model.prt".to_string()])
            .unwrap();
    }

    #[test]
    fn test_missing_run_input() {
        let err = four_stage().validate_inputs(&params(), &[]).unwrap_err();
        assert!(err.is_missing_input());
        assert_eq!(err.subjects, vec!["model.prt".to_string()]);
    }

    #[test]
    fn test_unknown_param_reference() {
        let err = four_stage()
            .validate_inputs(&ParameterSet::new(), &["model.prt".to_string()])
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::Template);
    }

    #[test]
    fn test_structural_checks() {
        assert!(Pipeline::default().validate().is_err());

        let mut dup = four_stage();
        dup.stages.push(Stage::new("mesh", StageKind::Mesh, "again"));
        assert_eq!(dup.validate().unwrap_err().code, ValidationCode::Duplicate);

        let zero = Pipeline::new(vec![
            Stage::new("a", StageKind::Mesh, "x").with_timeout(Duration::ZERO)
        ]);
        assert!(zero.validate().is_err());

        let mut huge = Stage::new("a", StageKind::Mesh, "x");
        huge.timeout_secs = 1e30;
        let huge = Pipeline::new(vec![huge]);
        assert_eq!(huge.validate().unwrap_err().code, ValidationCode::Config);
        assert_eq!(
            huge.stages[0].timeout(),
            Duration::from_secs_f64(MAX_TIMEOUT_SECS)
        );

        let mut nan = Stage::new("a", StageKind::Mesh, "x");
        nan.timeout_secs = f64::NAN;
        assert!(Pipeline::new(vec![nan]).validate().is_err());

        let undeclared = Pipeline::new(vec![Stage::new("a", StageKind::Mesh, "x {output.nope}")]);
        assert_eq!(undeclared.validate().unwrap_err().code, ValidationCode::Template);
    }
}
