use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matcher priority. Higher wins when several plugins match one URL.
pub type Priority = i32;

pub const NO_PRIORITY: Priority = 0;
pub const LOW_PRIORITY: Priority = 10;
pub const NORMAL_PRIORITY: Priority = 20;
pub const HIGH_PRIORITY: Priority = 30;

/// A URL pattern with a priority and an optional name.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub pattern: Regex,
    pub priority: Priority,
    pub name: Option<String>,
}

impl Matcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            priority: NORMAL_PRIORITY,
            name: None,
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Serialized form of a [`Matcher`], used by plugin metadata files and
/// declarative plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherDefinition {
    pub pattern: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_priority() -> Priority {
    NORMAL_PRIORITY
}

impl MatcherDefinition {
    pub fn compile(&self) -> Result<Matcher, regex::Error> {
        let mut matcher = Matcher::new(&self.pattern)?.with_priority(self.priority);
        matcher.name = self.name.clone();
        Ok(matcher)
    }
}

/// The result of matching a URL: which matcher hit and its captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedUrl {
    pub url: String,
    pub index: usize,
    pub name: Option<String>,
    pub priority: Priority,
    groups: HashMap<String, String>,
}

impl MatchedUrl {
    /// A named capture group.
    pub fn group(&self, name: &str) -> Option<&str> {
        self.groups.get(name).map(String::as_str)
    }

    pub fn groups(&self) -> &HashMap<String, String> {
        &self.groups
    }
}

/// Matches `url` against `matchers`, returning the highest-priority hit.
/// Ties go to the matcher declared first.
pub fn match_url(matchers: &[Matcher], url: &str) -> Option<MatchedUrl> {
    let mut best: Option<MatchedUrl> = None;

    for (index, matcher) in matchers.iter().enumerate() {
        if matcher.priority <= NO_PRIORITY {
            continue;
        }
        let Some(captures) = matcher.pattern.captures(url) else {
            continue;
        };
        if best.as_ref().is_some_and(|b| b.priority >= matcher.priority) {
            continue;
        }

        let groups = matcher
            .pattern
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();

        best = Some(MatchedUrl {
            url: url.to_string(),
            index,
            name: matcher.name.clone(),
            priority: matcher.priority,
            groups,
        });
    }

    best
}
