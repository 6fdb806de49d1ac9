//! Google Cloud Storage client authenticated with a service-account key.
//!
//! Access tokens come from the OAuth 2.0 JWT bearer grant: an RS256 assertion
//! signed with the account's private key is exchanged at the key's `token_uri`.
//! Tokens are cached on the client and refreshed shortly before they expire.

use super::ObjectStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_API_BASE: &str = "https://storage.googleapis.com";
pub const DEFAULT_PUBLIC_BASE: &str = "https://storage.googleapis.com";

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The subset of a service-account JSON key this client needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"***")
            .field("private_key_id", &self.private_key_id.as_ref().map(|_| "***"))
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// Base URLs for the JSON API and for public object links.
#[derive(Debug, Clone)]
pub struct GcsEndpoints {
    pub api_base: String,
    pub public_base: String,
}

impl Default for GcsEndpoints {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            public_base: DEFAULT_PUBLIC_BASE.to_string(),
        }
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

struct Inner {
    http: Client,
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    encoding_key: EncodingKey,
    endpoints: GcsEndpoints,
    token: Mutex<Option<CachedToken>>,
}

/// Authenticated handle to Cloud Storage. Cheap to clone.
#[derive(Clone)]
pub struct GcsClient {
    inner: Arc<Inner>,
}

impl GcsClient {
    /// Build a client from a decoded key. Only validates the key; no network I/O
    /// happens until the first write.
    pub fn authenticate(key: &ServiceAccountKey) -> Result<Self> {
        Self::authenticate_with(key, GcsEndpoints::default())
    }

    pub fn authenticate_with(key: &ServiceAccountKey, endpoints: GcsEndpoints) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("service account private_key is not an RSA PEM key")?;
        let http = Client::builder()
            .build()
            .context("build reqwest client")?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                client_email: key.client_email.clone(),
                key_id: key.private_key_id.clone(),
                token_uri: key.token_uri.clone(),
                encoding_key,
                endpoints,
                token: Mutex::new(None),
            }),
        })
    }

    /// Handle to a named bucket. Does not check that the bucket exists.
    pub fn bucket(&self, name: &str) -> GcsBucket {
        GcsBucket {
            client: self.clone(),
            name: name.to_string(),
        }
    }

    fn build_assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.inner.key_id.clone();
        let claims = Claims {
            iss: &self.inner.client_email,
            scope: STORAGE_SCOPE,
            aud: &self.inner.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        encode(&header, &claims, &self.inner.encoding_key).context("encode JWT assertion")
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.inner.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if now < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.build_assertion(now)?;
        let resp = self
            .inner
            .http
            .post(&self.inner.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .context("token request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "token exchange failed: HTTP {}: {}",
                status.as_u16(),
                truncate(&text, 300)
            ));
        }
        let tr = resp.json::<TokenResponse>().await.context("decode token response")?;
        debug!(expires_in = tr.expires_in, "obtained storage access token");
        let lifetime = (tr.expires_in - TOKEN_REFRESH_MARGIN_SECS).max(0);
        *cached = Some(CachedToken {
            value: tr.access_token.clone(),
            refresh_at: now + Duration::seconds(lifetime),
        });
        Ok(tr.access_token)
    }
}

/// A bucket handle bound to an authenticated client.
#[derive(Clone)]
pub struct GcsBucket {
    client: GcsClient,
    name: String,
}

impl GcsBucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn upload_url(&self, key: &str) -> Result<url::Url> {
        let base = self.client.inner.endpoints.api_base.trim_end_matches('/');
        let mut url = url::Url::parse(&format!("{base}/upload/storage/v1/b/{}/o", self.name))
            .with_context(|| format!("invalid upload url for bucket {}", self.name))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for GcsBucket {
    #[instrument(skip(self, bytes), fields(bucket = %self.name, size = bytes.len()))]
    async fn write_object(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        let token = self.client.access_token().await?;
        let url = self.upload_url(key)?;
        let resp = self
            .client
            .inner
            .http
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("upload {key}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "upload of {key} to bucket {} failed: HTTP {}: {}",
                self.name,
                status.as_u16(),
                truncate(&text, 300)
            ));
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        let base = self.client.inner.endpoints.public_base.trim_end_matches('/');
        format!("{base}/{}/{key}", self.name)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
