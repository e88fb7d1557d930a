use std::collections::HashMap;

use thiserror::Error;

/// Name of the manifest file looked for in every affected directory.
pub const TESTFILE_NAME: &str = "Testfile";

/// Reserved entry name. A `setup` entry is run before any test in the same
/// tree; it is never scheduled as a test of its own.
pub const SETUP_TASK: &str = "setup";

/// A line that does not match the `name: command` grammar. Carries the
/// offending line verbatim so it can be shown on the commit status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("bad line: {0}")]
pub struct SyntaxError(pub String);

/// Parse a Testfile into its name-to-command mapping.
///
/// The grammar is line oriented: blank lines and lines starting with `#` are
/// ignored; every other line must be `NAME: COMMAND`, where `NAME` is made of
/// ASCII letters, digits and underscores. The command is the rest of the
/// line with surrounding whitespace trimmed; a `#` inside it is not a
/// comment.
pub fn parse_testfile(input: &str) -> Result<HashMap<String, String>, SyntaxError> {
    let mut entries = HashMap::new();
    for line in input.lines() {
        let l = line.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }
        match l.split_once(':') {
            Some((name, cmd)) if ok_name(name) => {
                entries.insert(name.to_string(), cmd.trim().to_string());
            }
            _ => return Err(SyntaxError(line.to_string())),
        }
    }
    Ok(entries)
}

fn ok_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
# this is a comment
gotest: go test ./...
gocompile: go install chain/... # this is an end-of-line comment
";

    #[test]
    fn parse_commands() {
        let got = parse_testfile(SAMPLE).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["gotest"], "go test ./...");
        assert_eq!(
            got["gocompile"],
            "go install chain/... # this is an end-of-line comment"
        );
    }

    #[test]
    fn bad_line_is_a_syntax_error() {
        let err = parse_testfile("bad-name!: cmd").unwrap_err();
        assert_eq!(err, SyntaxError("bad-name!: cmd".to_string()));
        assert_eq!(err.to_string(), "bad line: bad-name!: cmd");
    }

    #[test]
    fn missing_colon_is_a_syntax_error() {
        assert!(parse_testfile("gotest go test").is_err());
    }

    #[test]
    fn reparse_of_serialized_output_is_identity() {
        let first = parse_testfile(SAMPLE).unwrap();
        let mut serialized = String::new();
        for (name, cmd) in &first {
            serialized.push_str(&format!("{name}: {cmd}\n"));
        }
        let second = parse_testfile(&serialized).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ok_name_ok() {
        for name in ["web", "a", "a123", "123", "name_with_underscore"] {
            assert!(ok_name(name), "ok_name({name:?}) should be true");
        }
    }

    #[test]
    fn ok_name_bad() {
        for name in ["", " ", "a.b", "a-"] {
            assert!(!ok_name(name), "ok_name({name:?}) should be false");
        }
    }
}
