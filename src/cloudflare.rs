//! Cloudflare v4 REST client for the Workers and KV resources the bot manages.
//!
//! Every call is a single request: no retry and no backoff. Failures are
//! surfaced verbatim to the caller.

use async_trait::async_trait;
use reqwest::{multipart, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

const KV_LIST_PAGE_SIZE: &str = "100";
const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub code: Option<i64>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareApiResponse<T> {
    success: bool,
    result: Option<T>,
    errors: Option<Vec<ApiMessage>>,
    messages: Option<Vec<ApiMessage>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CloudflareError {
    #[error("{context}: request failed: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context} failed: {}", summarize_cloudflare_messages(.errors))]
    Remote {
        context: String,
        status: Option<u16>,
        errors: Vec<ApiMessage>,
    },

    #[error("{context} returned an unexpected response: {message}")]
    Decode { context: String, message: String },

    #[error("invalid Cloudflare API base URL {url}: {message}")]
    BaseUrl { url: String, message: String },
}

impl CloudflareError {
    /// The error list reported by Cloudflare, empty for non-remote failures.
    pub fn remote_errors(&self) -> &[ApiMessage] {
        match self {
            CloudflareError::Remote { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// Account-scoped credentials captured during login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account_id: String,
    pub api_token: String,
}

impl Credentials {
    pub fn new(account_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            api_token: api_token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("api_token", &mask_secret(&self.api_token))
            .finish()
    }
}

/// Mask a secret for display, keeping a short prefix and suffix.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerScript {
    pub id: String,
    #[serde(default)]
    pub created_on: Option<String>,
    #[serde(default)]
    pub modified_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KvNamespace {
    pub id: String,
    pub title: String,
}

/// A binding injected into a Worker's runtime environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Binding {
    KvNamespace { name: String, namespace_id: String },
}

impl Binding {
    pub fn kv_namespace(name: impl Into<String>, namespace_id: impl Into<String>) -> Self {
        Binding::KvNamespace {
            name: name.into(),
            namespace_id: namespace_id.into(),
        }
    }
}

/// The Workers/KV operations the dispatcher drives.
#[async_trait]
pub trait WorkersApi: Send + Sync {
    async fn list_scripts(&self, creds: &Credentials) -> Result<Vec<WorkerScript>, CloudflareError>;

    async fn upload_script(
        &self,
        creds: &Credentials,
        name: &str,
        source: &str,
    ) -> Result<WorkerScript, CloudflareError>;

    async fn delete_script(&self, creds: &Credentials, name: &str) -> Result<(), CloudflareError>;

    async fn create_kv_namespace(
        &self,
        creds: &Credentials,
        title: &str,
    ) -> Result<KvNamespace, CloudflareError>;

    async fn list_kv_namespaces(&self, creds: &Credentials)
        -> Result<Vec<KvNamespace>, CloudflareError>;

    async fn delete_kv_namespace(&self, creds: &Credentials, id: &str)
        -> Result<(), CloudflareError>;

    async fn patch_script_bindings(
        &self,
        creds: &Credentials,
        name: &str,
        bindings: &[Binding],
    ) -> Result<(), CloudflareError>;
}

pub struct CloudflareClient {
    http: reqwest::Client,
    base: Url,
}

impl CloudflareClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, CloudflareError> {
        let base = Url::parse(api_base).map_err(|e| CloudflareError::BaseUrl {
            url: api_base.to_string(),
            message: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(CloudflareError::BaseUrl {
                url: api_base.to_string(),
                message: "URL cannot carry path segments".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| CloudflareError::Transport {
                context: "Build HTTP client".to_string(),
                source,
            })?;

        Ok(Self { http, base })
    }

    fn account_url(&self, account_id: &str, segments: &[&str]) -> Result<Url, CloudflareError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CloudflareError::BaseUrl {
                url: self.base.to_string(),
                message: "URL cannot carry path segments".to_string(),
            })?
            .pop_if_empty()
            .push("accounts")
            .push(account_id)
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response, CloudflareError> {
        tracing::debug!(action = context, "Sending Cloudflare request");
        request
            .send()
            .await
            .map_err(|source| CloudflareError::Transport {
                context: context.to_string(),
                source,
            })
    }
}

#[async_trait]
impl WorkersApi for CloudflareClient {
    async fn list_scripts(&self, creds: &Credentials) -> Result<Vec<WorkerScript>, CloudflareError> {
        let context = "List workers scripts";
        let url = self.account_url(&creds.account_id, &["workers", "scripts"])?;
        let response = self
            .send(self.http.get(url).bearer_auth(&creds.api_token), context)
            .await?;
        let result: Value = require_result(parse_cloudflare_response(response, context).await?, context)?;
        decode_list_from_value(result, &["scripts", "items"], context)
    }

    async fn upload_script(
        &self,
        creds: &Credentials,
        name: &str,
        source: &str,
    ) -> Result<WorkerScript, CloudflareError> {
        let context = format!("Upload script {}", name);
        let url = self.account_url(&creds.account_id, &["workers", "scripts", name])?;
        let request = self
            .http
            .put(url)
            .bearer_auth(&creds.api_token)
            .header("Content-Type", "application/javascript")
            .body(source.to_string());
        let response = self.send(request, &context).await?;
        require_result(parse_cloudflare_response(response, &context).await?, &context)
    }

    async fn delete_script(&self, creds: &Credentials, name: &str) -> Result<(), CloudflareError> {
        let context = format!("Delete worker script {}", name);
        let url = self.account_url(&creds.account_id, &["workers", "scripts", name])?;
        let response = self
            .send(self.http.delete(url).bearer_auth(&creds.api_token), &context)
            .await?;
        let _: Option<Value> = parse_cloudflare_response(response, &context).await?;
        Ok(())
    }

    async fn create_kv_namespace(
        &self,
        creds: &Credentials,
        title: &str,
    ) -> Result<KvNamespace, CloudflareError> {
        let context = format!("Create KV namespace {}", title);
        let url = self.account_url(&creds.account_id, &["storage", "kv", "namespaces"])?;
        let request = self
            .http
            .post(url)
            .bearer_auth(&creds.api_token)
            .json(&json!({ "title": title }));
        let response = self.send(request, &context).await?;
        require_result(parse_cloudflare_response(response, &context).await?, &context)
    }

    async fn list_kv_namespaces(
        &self,
        creds: &Credentials,
    ) -> Result<Vec<KvNamespace>, CloudflareError> {
        let context = "List KV namespaces";
        let url = self.account_url(&creds.account_id, &["storage", "kv", "namespaces"])?;
        let request = self
            .http
            .get(url)
            .bearer_auth(&creds.api_token)
            .query(&[("per_page", KV_LIST_PAGE_SIZE)]);
        let response = self.send(request, context).await?;
        let result: Value = require_result(parse_cloudflare_response(response, context).await?, context)?;
        decode_list_from_value(result, &["namespaces", "items"], context)
    }

    async fn delete_kv_namespace(
        &self,
        creds: &Credentials,
        id: &str,
    ) -> Result<(), CloudflareError> {
        let context = format!("Delete KV namespace {}", id);
        let url = self.account_url(&creds.account_id, &["storage", "kv", "namespaces", id])?;
        let response = self
            .send(self.http.delete(url).bearer_auth(&creds.api_token), &context)
            .await?;
        let _: Option<Value> = parse_cloudflare_response(response, &context).await?;
        Ok(())
    }

    async fn patch_script_bindings(
        &self,
        creds: &Credentials,
        name: &str,
        bindings: &[Binding],
    ) -> Result<(), CloudflareError> {
        let context = format!("Patch bindings for {}", name);
        let url = self.account_url(&creds.account_id, &["workers", "scripts", name, "settings"])?;
        let settings = json!({ "bindings": bindings }).to_string();
        let part = multipart::Part::text(settings)
            .mime_str("application/json")
            .map_err(|source| CloudflareError::Transport {
                context: context.clone(),
                source,
            })?;
        let form = multipart::Form::new().part("settings", part);
        let request = self
            .http
            .patch(url)
            .bearer_auth(&creds.api_token)
            .multipart(form);
        let response = self.send(request, &context).await?;
        let _: Option<Value> = parse_cloudflare_response(response, &context).await?;
        Ok(())
    }
}

fn summarize_cloudflare_messages(errors: &[ApiMessage]) -> String {
    let parts: Vec<String> = errors
        .iter()
        .map(|err| match err.code {
            Some(code) => format!("{} ({})", err.message, code),
            None => err.message.clone(),
        })
        .collect();
    if parts.is_empty() {
        "Unknown Cloudflare API error".to_string()
    } else {
        parts.join("; ")
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let mut out: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    out.push_str("...");
    out
}

fn decode_list_from_value<T: DeserializeOwned>(
    value: Value,
    keys: &[&str],
    context: &str,
) -> Result<Vec<T>, CloudflareError> {
    let decode = |candidate: Value| {
        serde_json::from_value(candidate).map_err(|e| CloudflareError::Decode {
            context: context.to_string(),
            message: e.to_string(),
        })
    };

    if value.is_array() {
        return decode(value);
    }

    if let Some(object) = value.as_object() {
        for key in keys {
            if let Some(candidate) = object.get(*key) {
                if candidate.is_array() {
                    return decode(candidate.clone());
                }
            }
        }
    }

    Err(CloudflareError::Decode {
        context: context.to_string(),
        message: format!("list shape is unexpected: {}", value),
    })
}

fn require_result<T>(result: Option<T>, context: &str) -> Result<T, CloudflareError> {
    result.ok_or_else(|| CloudflareError::Decode {
        context: context.to_string(),
        message: "result is missing".to_string(),
    })
}

async fn parse_cloudflare_response<T: DeserializeOwned>(
    response: Response,
    context: &str,
) -> Result<Option<T>, CloudflareError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| CloudflareError::Transport {
            context: context.to_string(),
            source,
        })?;

    if !status.is_success() {
        let errors = match serde_json::from_str::<CloudflareApiResponse<Value>>(&body) {
            Ok(envelope) => envelope.errors.unwrap_or_default(),
            Err(_) => vec![ApiMessage {
                code: None,
                message: format!("HTTP {}: {}", status, truncate_body(&body)),
            }],
        };
        return Err(CloudflareError::Remote {
            context: context.to_string(),
            status: Some(status.as_u16()),
            errors,
        });
    }

    let envelope: CloudflareApiResponse<T> =
        serde_json::from_str(&body).map_err(|e| CloudflareError::Decode {
            context: context.to_string(),
            message: format!("{} (body: {})", e, truncate_body(&body)),
        })?;

    if !envelope.success {
        let mut errors = envelope.errors.unwrap_or_default();
        errors.extend(envelope.messages.unwrap_or_default());
        return Err(CloudflareError::Remote {
            context: context.to_string(),
            status: Some(status.as_u16()),
            errors,
        });
    }

    Ok(envelope.result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CloudflareClient {
        CloudflareClient::new(DEFAULT_API_BASE, Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn test_account_url_encodes_segments() {
        let url = client()
            .account_url("acc 1", &["workers", "scripts", "my/worker"])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://api.cloudflare.com/client/v4/accounts/acc%201/workers/scripts/my%2Fworker"
        );
    }

    #[test]
    fn test_account_url_handles_trailing_slash_base() {
        let client = CloudflareClient::new("http://127.0.0.1:9000/v4/", Duration::from_secs(5))
            .expect("client");
        let url = client
            .account_url("a1", &["storage", "kv", "namespaces"])
            .expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/v4/accounts/a1/storage/kv/namespaces");
    }

    #[test]
    fn test_new_rejects_invalid_base() {
        let result = CloudflareClient::new("not a url", Duration::from_secs(5));
        assert!(matches!(result, Err(CloudflareError::BaseUrl { .. })));
    }

    #[test]
    fn test_summarize_messages_includes_codes() {
        let errors = vec![
            ApiMessage {
                code: Some(10000),
                message: "Authentication error".to_string(),
            },
            ApiMessage {
                code: None,
                message: "second".to_string(),
            },
        ];
        assert_eq!(
            summarize_cloudflare_messages(&errors),
            "Authentication error (10000); second"
        );
        assert_eq!(summarize_cloudflare_messages(&[]), "Unknown Cloudflare API error");
    }

    #[test]
    fn test_remote_error_display() {
        let error = CloudflareError::Remote {
            context: "Delete worker script demo".to_string(),
            status: Some(404),
            errors: vec![ApiMessage {
                code: Some(10007),
                message: "workers.api.error.script_not_found".to_string(),
            }],
        };
        assert_eq!(
            error.to_string(),
            "Delete worker script demo failed: workers.api.error.script_not_found (10007)"
        );
        assert_eq!(error.remote_errors().len(), 1);
    }

    #[test]
    fn test_kv_binding_serializes_with_type_tag() {
        let value = serde_json::to_value(Binding::kv_namespace("KV", "kv1")).unwrap();
        assert_eq!(
            value,
            json!({ "type": "kv_namespace", "name": "KV", "namespace_id": "kv1" })
        );
    }

    #[test]
    fn test_decode_list_accepts_wrapped_shape() {
        let wrapped = json!({ "items": [{ "id": "kv1", "title": "cache" }] });
        let list: Vec<KvNamespace> =
            decode_list_from_value(wrapped, &["namespaces", "items"], "List").unwrap();
        assert_eq!(list[0].id, "kv1");

        let err = decode_list_from_value::<KvNamespace>(json!({ "x": 1 }), &["items"], "List");
        assert!(matches!(err, Err(CloudflareError::Decode { .. })));
    }

    #[test]
    fn test_credentials_debug_masks_token() {
        let creds = Credentials::new("acc", "abcdefghijklmnop");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("abcd...mnop"));
        assert!(!debug.contains("abcdefghijklmnop"));
        assert_eq!(mask_secret("short"), "****");
    }
}
