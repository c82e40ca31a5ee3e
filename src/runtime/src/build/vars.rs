//! `${NAME}` substitution.

use std::collections::HashMap;

use box_core::error::{BoxError, Result};

/// Replace every `${NAME}` with its binding. `$${` yields a literal `${`;
/// a `$` not followed by `{` is kept as is.
pub fn interpolate(input: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$${") {
            out.push_str("${");
            rest = after;
        } else if let Some(body) = tail.strip_prefix("${") {
            let Some(end) = body.find('}') else {
                // Unterminated reference stays literal.
                out.push_str(tail);
                return Ok(out);
            };
            let name = &body[..end];
            let value = vars
                .get(name)
                .ok_or_else(|| BoxError::UndefinedVariable(name.to_string()))?;
            out.push_str(value);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("uid".to_string(), "1000".to_string()),
            ("name".to_string(), "web".to_string()),
        ])
    }

    #[test]
    fn test_interpolate_substitutes() {
        assert_eq!(
            interpolate("chown ${uid} /srv/${name}", &vars()).unwrap(),
            "chown 1000 /srv/web"
        );
    }

    #[test]
    fn test_interpolate_plain_text() {
        assert_eq!(interpolate("echo hi", &vars()).unwrap(), "echo hi");
        assert_eq!(interpolate("", &vars()).unwrap(), "");
    }

    #[test]
    fn test_interpolate_undefined() {
        let err = interpolate("${missing}", &vars()).unwrap_err();
        assert!(matches!(err, BoxError::UndefinedVariable(ref n) if n == "missing"));
    }

    #[test]
    fn test_interpolate_escapes_and_shell_vars() {
        assert_eq!(
            interpolate("echo $HOME $${HOME} $", &vars()).unwrap(),
            "echo $HOME ${HOME} $"
        );
    }

    #[test]
    fn test_interpolate_unterminated_is_literal() {
        assert_eq!(interpolate("a ${uid", &vars()).unwrap(), "a ${uid");
    }
}
