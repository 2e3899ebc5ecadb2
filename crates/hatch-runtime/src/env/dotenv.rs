//! Dotenv file loading.
//!
//! Format: `KEY=value` per line, `#` comments, optional `export ` prefix.
//! Double-quoted values understand `\n \r \t \\ \" \$`; single-quoted values
//! are literal; unquoted values end at an inline ` #` comment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DotenvError {
    #[error("failed to read env file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },
}

/// Load `spec` (a path, optionally suffixed with `?` to mark it optional)
/// relative to `base` and merge it into `env`. Later files override earlier
/// ones.
pub fn load_env_file(
    env: &mut BTreeMap<String, String>,
    spec: &str,
    base: &Path,
) -> Result<(), DotenvError> {
    let (path, optional) = match spec.strip_suffix('?') {
        Some(p) => (p, true),
        None => (spec, false),
    };
    let full: PathBuf = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    };

    let content = match std::fs::read_to_string(&full) {
        Ok(c) => c,
        Err(e) if optional && e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(DotenvError::Read {
                path: path.to_owned(),
                source,
            })
        }
    };

    for (key, value) in parse_dotenv(&content, path)? {
        env.insert(key, value);
    }
    Ok(())
}

/// Parse dotenv content. `name` is only used in error messages.
pub fn parse_dotenv(content: &str, name: &str) -> Result<Vec<(String, String)>, DotenvError> {
    let mut vars = Vec::new();
    for (idx, raw) in content.split('\n').enumerate() {
        let fail = |message: &str| DotenvError::Parse {
            file: name.to_owned(),
            line: idx + 1,
            message: message.to_owned(),
        };

        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim();

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| fail("invalid format (missing '=')"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(fail("empty variable name"));
        }
        let value = parse_value(value).map_err(fail)?;
        vars.push((key.to_owned(), value));
    }
    Ok(vars)
}

fn parse_value(value: &str) -> Result<String, &'static str> {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix('"') {
        let inner = rest
            .strip_suffix('"')
            .ok_or("unterminated double quote")?;
        return Ok(unescape_double_quoted(inner));
    }
    if let Some(rest) = value.strip_prefix('\'') {
        return rest
            .strip_suffix('\'')
            .map(str::to_owned)
            .ok_or("unterminated single quote");
    }
    match value.find(" #") {
        Some(idx) => Ok(value[..idx].trim().to_owned()),
        None => Ok(value.to_owned()),
    }
}

fn unescape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('$') => out.push('$'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> BTreeMap<String, String> {
        parse_dotenv(content, ".env").unwrap().into_iter().collect()
    }

    #[test]
    fn parses_common_forms() {
        let env = parse(
            "# comment\n\nexport A=1\nB = two words \r\nC=\nD=value # trailing\nE=a#b\n",
        );
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "two words");
        assert_eq!(env["C"], "");
        assert_eq!(env["D"], "value");
        assert_eq!(env["E"], "a#b");
    }

    #[test]
    fn double_quotes_process_escapes() {
        let env = parse(r#"MSG="line1\nline2\t\"q\" \$HOME \x""#);
        assert_eq!(env["MSG"], "line1\nline2\t\"q\" $HOME \\x");
    }

    #[test]
    fn single_quotes_are_literal() {
        let env = parse(r"RAW='no\nescape # kept'");
        assert_eq!(env["RAW"], r"no\nescape # kept");
    }

    #[test]
    fn value_may_contain_equals() {
        let env = parse("URL=postgres://u:p@h/db?x=1");
        assert_eq!(env["URL"], "postgres://u:p@h/db?x=1");
    }

    #[test]
    fn errors_carry_file_and_line() {
        let err = parse_dotenv("A=1\nBROKEN\n", "app.env").unwrap_err();
        assert_eq!(err.to_string(), "app.env:2: invalid format (missing '=')");

        let err = parse_dotenv("=x", "app.env").unwrap_err();
        assert_eq!(err.to_string(), "app.env:1: empty variable name");

        let err = parse_dotenv("A=\"open", "app.env").unwrap_err();
        assert!(err.to_string().contains("unterminated double quote"));

        let err = parse_dotenv("A='open", "app.env").unwrap_err();
        assert!(err.to_string().contains("unterminated single quote"));
    }

    #[test]
    fn optional_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        load_env_file(&mut env, "missing.env?", dir.path()).unwrap();
        assert!(env.is_empty());

        let err = load_env_file(&mut env, "missing.env", dir.path()).unwrap_err();
        assert!(err.to_string().contains("failed to read env file 'missing.env'"));
    }

    #[test]
    fn later_files_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.env"), "X=1\nY=a\n").unwrap();
        std::fs::write(dir.path().join("b.env"), "X=2\n").unwrap();
        let mut env = BTreeMap::new();
        load_env_file(&mut env, "a.env", dir.path()).unwrap();
        load_env_file(&mut env, "b.env?", dir.path()).unwrap();
        assert_eq!(env["X"], "2");
        assert_eq!(env["Y"], "a");
    }
}
