use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Longest value excerpt shown in an error message.
const MAX_LENGTH: usize = 60;

/// A node in a validation error tree.
///
/// Each schema level that fails wraps the errors of the levels below it as
/// context, so the rendered tree reads from the outermost schema inwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    kind: &'static str,
    message: String,
    context: Vec<Arc<ValidationError>>,
}

impl ValidationError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: ValidationError) -> Self {
        self.context.push(Arc::new(context));
        self
    }

    pub fn with_shared_context(mut self, context: Arc<ValidationError>) -> Self {
        self.context.push(context);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &[Arc<ValidationError>] {
        &self.context
    }

    /// Renders the tree with nested `Context(kind):` blocks. A node reached a
    /// second time is printed as `...` instead of being expanded again.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut seen = HashSet::new();
        seen.insert(self as *const ValidationError);
        self.render_into(&mut out, 0, &mut seen);
        out.truncate(out.trim_end().len());
        out
    }

    fn render_into(
        &self,
        out: &mut String,
        depth: usize,
        seen: &mut HashSet<*const ValidationError>,
    ) {
        let indent = "  ".repeat(depth);
        let header = if depth == 0 { "ValidationError" } else { "Context" };
        out.push_str(&format!("{indent}{header}({}):\n", self.kind));
        for line in self.message.lines() {
            out.push_str(&format!("{indent}  {line}\n"));
        }
        for child in &self.context {
            if !seen.insert(Arc::as_ptr(child)) {
                out.push_str(&format!("{indent}  ...\n"));
                continue;
            }
            child.render_into(out, depth + 1, seen);
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.context
            .first()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Shortens `value` to [`MAX_LENGTH`] characters, marking the cut with `...`.
pub(crate) fn truncate(value: &str) -> String {
    if value.chars().count() <= MAX_LENGTH {
        return value.to_string();
    }
    let head: String = value.chars().take(MAX_LENGTH).collect();
    format!("{head}...")
}

/// Short representation of a JSON value for error messages.
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", truncate(s)),
        other => truncate(&other.to_string()),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nested_context() {
        let err = ValidationError::new("dict", "Unable to validate value of key 'id'")
            .with_context(ValidationError::new(
                "type",
                "Type of 123 should be str, but is int",
            ));

        assert_eq!(
            err.render(),
            "ValidationError(dict):\n  Unable to validate value of key 'id'\n  Context(type):\n    Type of 123 should be str, but is int"
        );
    }

    #[test]
    fn shared_nodes_are_expanded_once() {
        let shared = Arc::new(ValidationError::new("type", "inner"));
        let err = ValidationError::new("any_of", "no match")
            .with_shared_context(shared.clone())
            .with_shared_context(shared);

        let rendered = err.render();
        assert_eq!(rendered.matches("Context(type)").count(), 1);
        assert!(rendered.ends_with("  ..."));
    }

    #[test]
    fn long_values_are_truncated() {
        let long = "x".repeat(100);
        let described = describe(&Value::String(long));
        assert_eq!(described, format!("'{}...'", "x".repeat(60)));
        assert_eq!(truncate("short"), "short");
    }
}
