//! `${name}` variable interpolation for configuration strings.
//!
//! Used by auth providers to resolve endpoint templates. Values may reference
//! further variables; resolution is depth-limited and cycle-checked:
//! a reference cycle fails with `CIRCULAR_REFERENCE`, exceeding the nesting
//! limit fails with `MAX_RECURSION`, and an unknown variable fails with
//! `VALIDATION`.

use std::collections::BTreeMap;

use crate::error::{Error, ErrorCode, Result};

/// Maximum substitution depth.
pub const MAX_DEPTH: usize = 10;

/// Resolves every `${name}` reference in `input` against `vars`.
pub fn interpolate(input: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut active = Vec::new();
    resolve(input, vars, &mut active, 0)
}

fn resolve(
    input: &str,
    vars: &BTreeMap<String, String>,
    active: &mut Vec<String>,
    depth: usize,
) -> Result<String> {
    if depth > MAX_DEPTH {
        return Err(Error::new(
            ErrorCode::MaxRecursion,
            format!("interpolation exceeded {MAX_DEPTH} nested substitutions"),
        ));
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(Error::new(
                ErrorCode::Validation,
                "unterminated ${ reference in template",
            ));
        };
        let name = &after[..end];
        if active.iter().any(|seen| seen == name) {
            return Err(Error::new(
                ErrorCode::CircularReference,
                format!("variable `{name}` refers to itself"),
            ));
        }
        let value = vars.get(name).ok_or_else(|| {
            Error::new(ErrorCode::Validation, format!("unknown variable `{name}`"))
        })?;
        active.push(name.to_string());
        out.push_str(&resolve(value, vars, active, depth + 1)?);
        active.pop();
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_nested_references() {
        let vars = vars(&[
            ("base", "https://idp.example.com"),
            ("token_url", "${base}/oauth/token"),
        ]);
        assert_eq!(
            interpolate("${token_url}?v=1", &vars).unwrap(),
            "https://idp.example.com/oauth/token?v=1"
        );
    }

    #[test]
    fn detects_cycles() {
        let vars = vars(&[("a", "${b}"), ("b", "${a}")]);
        let err = interpolate("${a}", &vars).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircularReference);
    }

    #[test]
    fn limits_recursion_depth() {
        let mut deep = BTreeMap::new();
        for i in 0..20 {
            deep.insert(format!("v{i}"), format!("${{v{}}}", i + 1));
        }
        deep.insert("v20".to_string(), "leaf".to_string());
        let err = interpolate("${v0}", &deep).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MaxRecursion);
    }

    #[test]
    fn unknown_variables_fail() {
        let err = interpolate("${missing}", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }
}
