//! Shell quoting for commands sent to `sh -c` locally or over ssh.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument, leaving plain words untouched.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote a path (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

/// Joins remote path segments with `/`, whatever the local platform.
pub fn remote_join(base: &str, segment: &str) -> String {
    if base.is_empty() {
        return segment.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), segment.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_arg_simple() {
        assert_eq!(quote_arg("squeue"), "squeue");
        assert_eq!(quote_arg("12345"), "12345");
    }

    #[test]
    fn quote_arg_with_spaces() {
        assert_eq!(quote_arg("run dir"), "'run dir'");
    }

    #[test]
    fn quote_arg_with_single_quote() {
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
    }

    #[test]
    fn quote_arg_empty() {
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn quote_path_always_quotes() {
        assert_eq!(quote_path("/scratch/run"), "'/scratch/run'");
    }

    #[test]
    fn remote_join_normalises_slashes() {
        assert_eq!(remote_join("/scratch/", "/runs"), "/scratch/runs");
        assert_eq!(remote_join("", "runs"), "runs");
        assert_eq!(remote_join("~/cadflow", "abc"), "~/cadflow/abc");
    }
}
