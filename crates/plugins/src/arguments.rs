use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Int,
    Float,
    Bool,
}

/// A plugin-specific option, exposed as `--{plugin}-{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginArgument {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub required: bool,
    /// Never logged or printed.
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default = "default_type", rename = "type")]
    pub arg_type: ArgumentType,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

fn default_type() -> ArgumentType {
    ArgumentType::String
}

impl PluginArgument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: String::new(),
            required: false,
            sensitive: false,
            arg_type: ArgumentType::String,
            choices: Vec::new(),
            default: None,
        }
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn typed(mut self, arg_type: ArgumentType) -> Self {
        self.arg_type = arg_type;
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Command-line spelling, e.g. `nicolive-user-session`.
    pub fn option_name(&self, plugin: &str) -> String {
        format!("{plugin}-{}", self.name)
    }

    fn parse(&self, plugin: &str, raw: &str) -> Result<OptionValue, PluginError> {
        let invalid = |reason: String| PluginError::InvalidArgument {
            name: self.option_name(plugin),
            reason,
        };

        if !self.choices.is_empty() && !self.choices.iter().any(|c| c == raw) {
            return Err(invalid(format!(
                "expected one of {}",
                self.choices.join(", ")
            )));
        }

        Ok(match self.arg_type {
            ArgumentType::String => OptionValue::String(raw.to_string()),
            ArgumentType::Int => OptionValue::Int(
                raw.parse()
                    .map_err(|e| invalid(format!("not an integer: {e}")))?,
            ),
            ArgumentType::Float => OptionValue::Float(
                raw.parse()
                    .map_err(|e| invalid(format!("not a number: {e}")))?,
            ),
            ArgumentType::Bool => match raw.to_ascii_lowercase().as_str() {
                "" | "1" | "true" | "yes" | "on" => OptionValue::Bool(true),
                "0" | "false" | "no" | "off" => OptionValue::Bool(false),
                _ => return Err(invalid("not a boolean".to_string())),
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginArguments(Vec<PluginArgument>);

impl PluginArguments {
    pub fn new(arguments: Vec<PluginArgument>) -> Self {
        Self(arguments)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginArgument> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&PluginArgument> {
        self.0.iter().find(|a| a.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds typed options for `plugin` from raw `--{plugin}-{name}=value`
    /// pairs. Keys for other plugins are ignored.
    pub fn parse(
        &self,
        plugin: &str,
        raw: &HashMap<String, String>,
    ) -> Result<PluginOptions, PluginError> {
        let mut options = PluginOptions::default();

        for argument in &self.0 {
            let key = argument.option_name(plugin);
            let value = raw.get(&key).or(argument.default.as_ref());
            match value {
                Some(value) => {
                    let parsed = argument.parse(plugin, value)?;
                    options.insert(&argument.name, parsed, argument.sensitive);
                }
                None if argument.required => {
                    return Err(PluginError::MissingArgument { name: key });
                }
                None => {}
            }
        }

        Ok(options)
    }
}

#[derive(Clone, PartialEq)]
pub enum OptionValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Parsed plugin options. Sensitive values are redacted from `Debug`.
#[derive(Clone, Default, PartialEq)]
pub struct PluginOptions {
    values: HashMap<String, OptionValue>,
    sensitive: Vec<String>,
}

impl PluginOptions {
    pub fn insert(&mut self, name: &str, value: OptionValue, sensitive: bool) {
        self.values.insert(name.to_string(), value);
        if sensitive {
            self.sensitive.push(name.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptionValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OptionValue::Bool(true)))
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(OptionValue::Int(i)) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Debug for PluginOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        for key in keys {
            if self.sensitive.contains(key) {
                map.entry(key, &"********");
            } else {
                map.entry(key, &self.values[key]);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arguments() -> PluginArguments {
        PluginArguments::new(vec![
            PluginArgument::new("user-session").sensitive(),
            PluginArgument::new("quality").choices(&["high", "low"]).default_value("high"),
            PluginArgument::new("offset").typed(ArgumentType::Int),
            PluginArgument::new("token").required(),
        ])
    }

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_prefixed_values() {
        let options = arguments()
            .parse(
                "nicolive",
                &raw(&[
                    ("nicolive-user-session", "secret"),
                    ("nicolive-offset", "30"),
                    ("nicolive-token", "t"),
                    ("other-token", "ignored"),
                ]),
            )
            .unwrap();
        assert_eq!(options.get_str("user-session"), Some("secret"));
        assert_eq!(options.get_str("quality"), Some("high"));
        assert_eq!(options.get_int("offset"), Some(30));
        assert!(!format!("{options:?}").contains("secret"));
    }

    #[test]
    fn rejects_missing_and_invalid_values() {
        let err = arguments().parse("nicolive", &raw(&[])).unwrap_err();
        assert!(matches!(err, PluginError::MissingArgument { ref name } if name == "nicolive-token"));

        let err = arguments()
            .parse(
                "nicolive",
                &raw(&[("nicolive-token", "t"), ("nicolive-quality", "ultra")]),
            )
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidArgument { .. }));
    }
}
