// Schema-validated requests on top of the engine's `HttpSession`.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use slink_engine::{HttpError, HttpSession, RequestOptions};
use tracing::trace;

use crate::error::PluginError;
use crate::validate::Schema;

/// How a response body is turned into a value before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    /// The body as a JSON string, e.g. an HTML page for XPath schemas.
    Text,
}

#[async_trait]
pub trait SessionExt: Send + Sync {
    /// Sends a request and validates the decoded body against `schema`.
    async fn fetch(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        format: ResponseFormat,
        schema: Option<&Schema>,
    ) -> Result<Value, PluginError>;

    async fn get_json(&self, url: &str, schema: &Schema) -> Result<Value, PluginError> {
        self.fetch(
            Method::GET,
            url,
            RequestOptions::new(),
            ResponseFormat::Json,
            Some(schema),
        )
        .await
    }

    async fn get_text(&self, url: &str, schema: &Schema) -> Result<Value, PluginError> {
        self.fetch(
            Method::GET,
            url,
            RequestOptions::new(),
            ResponseFormat::Text,
            Some(schema),
        )
        .await
    }
}

#[async_trait]
impl SessionExt for HttpSession {
    async fn fetch(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        format: ResponseFormat,
        schema: Option<&Schema>,
    ) -> Result<Value, PluginError> {
        let response = self.request(method, url, options).await?;
        let body = response.text().await.map_err(HttpError::from)?;
        trace!(%url, len = body.len(), "Fetched response body");

        let value = match format {
            ResponseFormat::Json => serde_json::from_str(&body)?,
            ResponseFormat::Text => Value::String(body),
        };
        match schema {
            Some(schema) => Ok(schema.validate(&value)?),
            None => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use serde_json::json;
    use slink_engine::HttpSessionConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::validate::ValueType;

    #[tokio::test]
    async fn validation_failure_keeps_the_error_tree() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": 1}})))
            .mount(&server)
            .await;

        let session = HttpSession::new(HttpSessionConfig::default()).unwrap();
        let schema = Schema::dict([("data", Schema::dict([("id", Schema::Type(ValueType::Str))]))]);
        let err = session
            .get_json(&format!("{}/api", server.uri()), &schema)
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Validation(_)));
        let cause = err.source().unwrap().to_string();
        assert!(cause.contains("Context(type)"));
        assert!(err.to_string().starts_with("Unable to validate response: ValidationError(dict)"));
    }

    #[tokio::test]
    async fn valid_response_is_reshaped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "x", "noise": 1}})),
            )
            .mount(&server)
            .await;

        let session = HttpSession::new(HttpSessionConfig::default()).unwrap();
        let schema = Schema::dict([("data", Schema::dict([("id", Schema::Type(ValueType::Str))]))]);
        let value = session
            .get_json(&format!("{}/api", server.uri()), &schema)
            .await
            .unwrap();
        assert_eq!(value, json!({"data": {"id": "x"}}));
    }
}
