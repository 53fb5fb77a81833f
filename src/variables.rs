//! Per-client variable table (spec §3 `Variable`).

use std::collections::HashMap;

/// `(name, value)` pairs, case-sensitive, `value` is an opaque string until a
/// numeric operation parses it as a signed 64-bit integer.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    table: HashMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.table.get(name).map(String::as_str)
    }

    /// Insertion creates a new entry; reassignment overwrites the value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.table.insert(name.into(), value.into());
    }

    pub fn get_i64(&self, name: &str) -> Option<Result<i64, std::num::ParseIntError>> {
        self.table.get(name).map(|v| v.parse::<i64>())
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Uniform meta-command argument substitution (spec §4.6/§8): an argument that is
/// exactly `:name` is replaced by the variable's value (`UndefinedVariable` if
/// there is no such variable); an argument starting with `::` has that leading
/// escape stripped to a literal single colon and is otherwise left alone. Any
/// other argument passes through unchanged.
pub fn substitute_arg(vars: &Variables, arg: &str) -> Result<String, crate::error::ClientError> {
    if let Some(rest) = arg.strip_prefix("::") {
        return Ok(format!(":{rest}"));
    }
    if let Some(name) = arg.strip_prefix(':') {
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return vars
                .get(name)
                .map(str::to_string)
                .ok_or_else(|| crate::error::ClientError::UndefinedVariable(name.to_string()));
        }
    }
    Ok(arg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_overwrite() {
        let mut v = Variables::new();
        assert!(v.get("x").is_none());
        v.set("x", "1");
        assert_eq!(v.get("x"), Some("1"));
        v.set("x", "2");
        assert_eq!(v.get("x"), Some("2"));
    }

    #[test]
    fn case_sensitive() {
        let mut v = Variables::new();
        v.set("X", "1");
        assert!(v.get("x").is_none());
        assert_eq!(v.get("X"), Some("1"));
    }

    #[test]
    fn substitution_rules() {
        let mut v = Variables::new();
        v.set("aid", "7");
        assert_eq!(substitute_arg(&v, ":aid").unwrap(), "7");
        assert_eq!(substitute_arg(&v, "::aid").unwrap(), ":aid");
        assert!(substitute_arg(&v, ":missing").is_err());
        assert_eq!(substitute_arg(&v, "plain").unwrap(), "plain");
    }
}
