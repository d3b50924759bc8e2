//! The expression interchange file.

use super::expression::{decode_line, encode};
use super::parameter::ParameterSet;
use crate::errors::{CadflowError, ValidationCode, ValidationError};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Header line expected by the CAD tool's expression import.
pub const EXPRESSION_FILE_HEADER: &str = "// Version: 3";

/// Renders a whole interchange file in memory.
///
/// # Errors
///
/// Returns the first encoding error; no partial output is produced.
pub fn render_expression_file(params: &ParameterSet) -> Result<String, ValidationError> {
    let mut out = String::with_capacity(32 + params.len() * 24);
    out.push_str(EXPRESSION_FILE_HEADER);
    out.push('\n');
    for param in params {
        out.push_str(&encode(param)?);
        out.push('\n');
    }
    Ok(out)
}

/// Writes the interchange file atomically.
///
/// Every parameter is encoded before the filesystem is touched, then the
/// content goes to a sibling temporary file which is synced and renamed over
/// `path`.
pub async fn write_expression_file(
    path: impl AsRef<Path>,
    params: &ParameterSet,
) -> Result<(), CadflowError> {
    let path = path.as_ref();
    let content = render_expression_file(params)?;

    let tmp = temp_path(path);
    let write = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    debug!(path = %path.display(), count = params.len(), "Wrote expression file");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "expressions".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Parses interchange file content.
///
/// # Errors
///
/// Returns a syntax error if the header is missing or a line is malformed.
pub fn parse_expression_file(content: &str) -> Result<ParameterSet, ValidationError> {
    let mut lines = content.lines();
    let header = lines.next().unwrap_or_default();
    if !is_header(header) {
        return Err(ValidationError::new(
            ValidationCode::Syntax,
            format!("Missing expression file header, found: {header}"),
        ));
    }

    let mut set = ParameterSet::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        set.insert(decode_line(trimmed)?)?;
    }
    Ok(set)
}

/// Reads and parses an interchange file.
pub async fn read_expression_file(path: impl AsRef<Path>) -> Result<ParameterSet, CadflowError> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    Ok(parse_expression_file(&content)?)
}

fn is_header(line: &str) -> bool {
    line.trim()
        .strip_prefix("//")
        .and_then(|rest| rest.trim_start().strip_prefix("Version:"))
        .is_some_and(|version| version.trim() == "3")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ParamType, Parameter};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scenario_set() -> ParameterSet {
        ParameterSet::new()
            .with(Parameter::number("L4", 2.0).unwrap().with_unit("mm"))
            .unwrap()
            .with(Parameter::new("shape", ParamType::Point, json!([0, 0, 0])).unwrap())
            .unwrap()
    }

    #[test]
    fn test_render_scenario() {
        let content = render_expression_file(&scenario_set()).unwrap();
        assert_eq!(
            content,
            "// Version: 3\n[mm]L4=2.0\n(Point) shape=point(0, 0, 0)\n"
        );
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.exp");

        write_expression_file(&path, &scenario_set()).await.unwrap();
        let back = read_expression_file(&path).await.unwrap();
        assert_eq!(back, scenario_set());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_value_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.exp");
        let set = ParameterSet::new()
            .with(Parameter::new("p", ParamType::Point, json!("not a point")).unwrap())
            .unwrap();

        let err = write_expression_file(&path, &set).await.unwrap_err();
        assert!(matches!(err, CadflowError::Validation(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.exp");

        let result = ParameterSet::from_json_str(r#"[{"name": "m", "type": "matrix", "value": 1}]"#);
        let err = result.unwrap_err();
        assert_eq!(err.code, ValidationCode::UnknownType);
        assert!(!path.exists());
    }

    #[test]
    fn test_parse_skips_comments_and_checks_header() {
        let set = parse_expression_file("//  Version:  3\n// exported\nn=4\n\n").unwrap();
        assert_eq!(set.get("n").unwrap().value, json!(4));

        let err = parse_expression_file("n=4\n").unwrap_err();
        assert_eq!(err.code, ValidationCode::Syntax);
    }

    #[test]
    fn test_multiline_strings_stay_on_one_line() {
        let set = ParameterSet::new()
            .with(Parameter::new("label", ParamType::String, json!("line1\nline2\r\tend")).unwrap())
            .unwrap()
            .with(Parameter::new("notes", ParamType::List, json!(["a\nb", "c"])).unwrap())
            .unwrap();

        let content = render_expression_file(&set).unwrap();
        assert_eq!(content.lines().count(), 3, "{content}");
        assert_eq!(parse_expression_file(&content).unwrap(), set);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.exp");
        std::fs::write(&path, "stale").unwrap();

        write_expression_file(&path, &scenario_set()).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(EXPRESSION_FILE_HEADER));
    }
}
