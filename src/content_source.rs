//! Content repository access over HTTP (Sling JSON servlet).
//!
//! Two selectors are used against the repository:
//!
//! | Request | Returns |
//! |---------|---------|
//! | `GET <path>.1.json` | the node plus one level of children (child listing) |
//! | `GET <path>.infinity.json` | the full subtree, or a list of fragment URLs |
//!
//! Every response is classified right after the HTTP call into a
//! [`FetchOutcome`]. Large subtrees are answered by Sling with HTTP 300 and a
//! JSON array of smaller resources to fetch instead; that becomes
//! [`FetchOutcome::FragmentList`]. HTML responses are what AEM serves when the
//! session is not authorized (login page redirect), so they are treated as
//! an access failure rather than parsed.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

use aem_rag_core::models::ContentNode;

use crate::config::SourceConfig;

/// Why a node could not be fetched. The crawler logs it and moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} returned HTML (likely not accessible)")]
    Html { url: String },
    #[error("{url} returned an unusable body: {message}")]
    Malformed { url: String, message: String },
}

/// Shape of a fetch response, decided once at the HTTP boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// A JSON node.
    Node(ContentNode),
    /// Pointers to fragment resources that together make up the node.
    FragmentList(Vec<String>),
    /// Nothing usable came back.
    Unavailable(FetchError),
}

/// Read access to the content repository.
///
/// Implemented over HTTP by [`HttpContentSource`]; tests substitute an
/// in-memory tree.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Names of the direct children of `path`.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, FetchError>;

    /// The full subtree at `path`, possibly paginated into fragments.
    async fn fetch_subtree(&self, path: &str) -> FetchOutcome;

    /// One fragment named by a [`FetchOutcome::FragmentList`] pointer.
    async fn fetch_fragment(&self, pointer: &str) -> FetchOutcome;
}

/// Classify a raw HTTP response.
pub fn classify_response(
    url: &str,
    status: u16,
    content_type: Option<&str>,
    body: &str,
) -> FetchOutcome {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("html")) {
        return FetchOutcome::Unavailable(FetchError::Html {
            url: url.to_string(),
        });
    }

    let multiple_choices = status == 300;
    if !(200..300).contains(&status) && !multiple_choices {
        return FetchOutcome::Unavailable(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return FetchOutcome::Unavailable(FetchError::Malformed {
                url: url.to_string(),
                message: e.to_string(),
            })
        }
    };

    match fragment_pointers(&value) {
        Some(pointers) => FetchOutcome::FragmentList(pointers),
        None if multiple_choices => FetchOutcome::Unavailable(FetchError::Status {
            url: url.to_string(),
            status,
        }),
        None => FetchOutcome::Node(value),
    }
}

/// A non-empty JSON array made only of strings is a fragment list.
fn fragment_pointers(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Child node names in a `.1.json` listing.
///
/// Children are the keys holding objects, in listing order; scalar keys are
/// the node's own properties.
pub fn child_names(listing: &Map<String, Value>) -> Vec<String> {
    listing
        .iter()
        .filter(|(_, v)| v.is_object())
        .map(|(k, _)| k.clone())
        .collect()
}

/// [`ContentSource`] backed by the Sling default GET servlet.
pub struct HttpContentSource {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpContentSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn selector_url(&self, path: &str, selector: &str) -> String {
        let path = path.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}.{}", self.base_url, path, selector)
        } else {
            format!("{}/{}.{}", self.base_url, path, selector)
        }
    }

    fn resolve(&self, pointer: &str) -> String {
        if pointer.starts_with("http://") || pointer.starts_with("https://") {
            pointer.to_string()
        } else if pointer.starts_with('/') {
            format!("{}{}", self.base_url, pointer)
        } else {
            format!("{}/{}", self.base_url, pointer)
        }
    }

    async fn get(&self, url: &str) -> FetchOutcome {
        tracing::debug!(url, "fetching");
        let mut req = self.client.get(url);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_ref());
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                return FetchOutcome::Unavailable(FetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match resp.text().await {
            Ok(body) => classify_response(url, status, content_type.as_deref(), &body),
            Err(e) => FetchOutcome::Unavailable(FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn list_children(&self, path: &str) -> Result<Vec<String>, FetchError> {
        let url = self.selector_url(path, "1.json");
        match self.get(&url).await {
            FetchOutcome::Node(Value::Object(map)) => Ok(child_names(&map)),
            FetchOutcome::Node(_) => Err(FetchError::Malformed {
                url,
                message: "listing is not a JSON object".to_string(),
            }),
            FetchOutcome::FragmentList(_) => Err(FetchError::Malformed {
                url,
                message: "listing came back as a fragment list".to_string(),
            }),
            FetchOutcome::Unavailable(e) => Err(e),
        }
    }

    async fn fetch_subtree(&self, path: &str) -> FetchOutcome {
        self.get(&self.selector_url(path, "infinity.json")).await
    }

    async fn fetch_fragment(&self, pointer: &str) -> FetchOutcome {
        self.get(&self.resolve(pointer)).await
    }
}
