//! Flat `%{name}` variable substitution over element commands and paths.

use std::collections::BTreeMap;

use kiln_types::{Error, ErrorKind, Result};

/// Default build area inside the sandbox root.
pub const BUILD_ROOT: &str = "/kiln-build";
/// Default install area inside the sandbox root.
pub const INSTALL_ROOT: &str = "/kiln-install";

/// An element's variable table. Substitution is non-recursive in values
/// except through repeated expansion, bounded to catch reference loops.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    /// Build a table from element-declared variables plus the defaults.
    pub fn new(declared: &BTreeMap<String, String>) -> Self {
        let mut values = BTreeMap::new();
        values.insert("build-root".to_string(), BUILD_ROOT.to_string());
        values.insert("install-root".to_string(), INSTALL_ROOT.to_string());
        for (k, v) in declared {
            values.insert(k.clone(), v.clone());
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Expand every `%{name}` occurrence in `input`.
    pub fn expand(&self, input: &str) -> Result<String> {
        let mut current = input.to_string();
        // Values may reference other variables; bound the passes so a
        // reference cycle surfaces as an error instead of spinning.
        for _ in 0..16 {
            let expanded = self.expand_once(&current)?;
            if expanded == current {
                return Ok(expanded);
            }
            current = expanded;
        }
        Err(Error::new(
            ErrorKind::Load,
            "circular-variable",
            format!("circular variable reference while expanding '{}'", input),
        ))
    }

    fn expand_once(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("%{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(Error::new(
                    ErrorKind::Load,
                    "invalid-variable",
                    format!("unterminated variable reference in '{}'", input),
                ));
            };
            let name = &after[..end];
            let value = self.values.get(name).ok_or_else(|| {
                Error::new(
                    ErrorKind::Load,
                    "undefined-variable",
                    format!("undefined variable '%{{{}}}' in '{}'", name, input),
                )
            })?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        let declared = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Variables::new(&declared)
    }

    #[test]
    fn defaults_are_present() {
        let v = vars(&[]);
        assert_eq!(v.get("build-root"), Some(BUILD_ROOT));
        assert_eq!(v.get("install-root"), Some(INSTALL_ROOT));
    }

    #[test]
    fn expands_simple_references() {
        let v = vars(&[("prefix", "/usr")]);
        assert_eq!(v.expand("install to %{prefix}/bin").expect("expand"), "install to /usr/bin");
    }

    #[test]
    fn expands_nested_references() {
        let v = vars(&[("prefix", "/usr"), ("bindir", "%{prefix}/bin")]);
        assert_eq!(v.expand("%{bindir}/tool").expect("expand"), "/usr/bin/tool");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let v = vars(&[]);
        let err = v.expand("%{nonsense}").expect_err("undefined");
        assert_eq!(err.reason, "undefined-variable");
    }

    #[test]
    fn circular_reference_is_detected() {
        let v = vars(&[("a", "%{b}"), ("b", "%{a}")]);
        let err = v.expand("%{a}").expect_err("cycle");
        assert_eq!(err.reason, "circular-variable");
    }

    #[test]
    fn unterminated_reference_is_an_error() {
        let v = vars(&[]);
        let err = v.expand("%{oops").expect_err("unterminated");
        assert_eq!(err.reason, "invalid-variable");
    }

    #[test]
    fn declared_variables_override_defaults() {
        let v = vars(&[("build-root", "/custom-build")]);
        assert_eq!(v.expand("%{build-root}").expect("expand"), "/custom-build");
    }
}
