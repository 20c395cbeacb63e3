// Declarative plugins: a JSON file naming URL patterns and a playlist URL
// template. Captures from the winning pattern fill `{name}` placeholders.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::arguments::PluginArgument;
use crate::arguments::PluginArguments;
use crate::error::PluginError;
use crate::matcher::MatcherDefinition;
use crate::plugin::{Plugin, PluginContext, PluginMetadata, PluginSpec};
use crate::platforms::hls::variant_streams;
use crate::stream::StreamSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarativeDefinition {
    pub name: String,
    pub matchers: Vec<MatcherDefinition>,
    /// Multivariant playlist URL, e.g. `https://cdn.example/{channel}/master.m3u8`.
    pub url_template: String,
    #[serde(default)]
    pub arguments: Vec<PluginArgument>,
    #[serde(default)]
    pub title: Option<String>,
}

impl DeclarativeDefinition {
    pub fn from_json(text: &str) -> Result<Self, PluginError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn spec(definition: DeclarativeDefinition) -> Result<PluginSpec, PluginError> {
    let matchers = definition
        .matchers
        .iter()
        .map(|m| {
            m.compile()
                .map_err(|e| PluginError::load(&definition.name, e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if matchers.is_empty() {
        return Err(PluginError::load(&definition.name, "no matchers defined"));
    }

    let arguments = PluginArguments::new(definition.arguments.clone());
    let definition = Arc::new(definition);
    Ok(PluginSpec::new(definition.name.clone(), matchers, move |context| {
        Ok(Box::new(DeclarativePlugin {
            definition: definition.clone(),
            context,
        }) as Box<dyn Plugin>)
    })
    .with_arguments(arguments))
}

/// Fills `{capture}` placeholders from the match; `{url}` is the input URL
/// and plugin options are available under their own names.
fn render(template: &str, context: &PluginContext) -> Result<String, PluginError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(PluginError::other(format!("unterminated placeholder in {template}")));
        };
        let key = &after[..end];
        let value = match key {
            "url" => Some(context.url.as_str()),
            _ => context
                .matched
                .group(key)
                .or_else(|| context.options.get_str(key)),
        };
        let Some(value) = value else {
            return Err(PluginError::other(format!(
                "placeholder {{{key}}} has no value for {}",
                context.url
            )));
        };
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

struct DeclarativePlugin {
    definition: Arc<DeclarativeDefinition>,
    context: PluginContext,
}

#[async_trait]
impl Plugin for DeclarativePlugin {
    fn name(&self) -> &str {
        &self.definition.name
    }

    async fn streams(&self) -> Result<StreamSet, PluginError> {
        let url = render(&self.definition.url_template, &self.context)?;
        variant_streams(&self.context, &url).await
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: self.context.matched.groups().values().next().cloned(),
            title: self.definition.title.clone(),
            ..PluginMetadata::default()
        }
    }
}
