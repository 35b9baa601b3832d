//! Cloudflare REST API client: account tokens and R2 buckets.
//!
//! Every request carries the bearer token given by the caller, so one client
//! serves both the high-permission token and per-project temp tokens.
//! Requests are retried with exponential backoff on 429 (rate limit).

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use projhub_core::ProjectError;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

const MAX_RETRIES: u32 = 5;
const BASE_DELAY_MS: u64 = 200;

/// Status of a token that can be used.
pub const TOKEN_STATUS_ACTIVE: &str = "active";

/// API response envelope.
#[derive(Deserialize)]
struct ApiResponse<T> {
    success: bool,
    result: Option<T>,
    errors: Option<Vec<ApiError>>,
    result_info: Option<ResultInfo>,
}

/// Paging information attached to list responses.
#[derive(Deserialize, Debug, Clone, Copy)]
struct ResultInfo {
    page: Option<u32>,
    total_pages: Option<u32>,
}

/// Page size used for list requests.
const LIST_PAGE_SIZE: &str = "100";

#[derive(Deserialize)]
struct ApiError {
    code: Option<i64>,
    message: String,
}

fn error_messages(errors: Option<Vec<ApiError>>) -> String {
    errors
        .filter(|errs| !errs.is_empty())
        .map(|errs| {
            errs.into_iter()
                .map(|e| match e.code {
                    Some(code) => format!("{} ({})", e.message, code),
                    None => e.message,
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "unknown Cloudflare API error".to_string())
}

/// An account API token as listed or created.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiToken {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    /// Only present in the response of a creation.
    pub value: Option<String>,
    pub expires_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct R2Bucket {
    pub name: String,
    pub creation_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifiedToken {
    id: String,
    status: String,
}

#[derive(Serialize)]
struct PermissionGroupRef {
    id: String,
}

#[derive(Serialize)]
struct TokenPolicy {
    effect: &'static str,
    resources: serde_json::Map<String, serde_json::Value>,
    permission_groups: Vec<PermissionGroupRef>,
}

#[derive(Serialize)]
struct CreateTokenRequest<'a> {
    name: &'a str,
    policies: Vec<TokenPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_on: Option<String>,
}

#[derive(Serialize)]
struct CreateBucketRequest<'a> {
    name: &'a str,
}

/// What a new token may access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenScope {
    /// The whole account.
    Account,
    /// A single R2 bucket of the account.
    Bucket(String),
}

/// Cloudflare API v4 client scoped to one account.
pub struct CloudflareApi {
    http_client: HttpClient,
    base_url: String,
    account_id: String,
    permission_groups: OnceCell<Vec<PermissionGroup>>,
}

impl CloudflareApi {
    pub fn new(http_client: HttpClient, base_url: &str, account_id: String) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id,
            permission_groups: OnceCell::new(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn account_url(&self) -> String {
        format!("{}/accounts/{}", self.base_url, self.account_id)
    }

    /// Send a request with exponential backoff retry on 429.
    async fn send_with_retry(
        &self,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response, ProjectError> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);

        for attempt in 0..=MAX_RETRIES {
            let response = build_request()
                .send()
                .await
                .map_err(|e| ProjectError::Provider(format!("Cloudflare request failed: {}", e)))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            if attempt == MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                return Err(ProjectError::Provider(format!(
                    "Cloudflare API rate limited after {} retries: {}",
                    MAX_RETRIES, text
                )));
            }

            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Cloudflare API rate limited (429), retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        unreachable!()
    }

    /// Send a request and unwrap the response envelope.
    ///
    /// Returns `None` on 404 or when the envelope carries no result.
    async fn execute<T: DeserializeOwned>(
        &self,
        what: &str,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Option<T>, ProjectError> {
        Ok(self.execute_paged(what, build_request).await?.0)
    }

    /// Like [`Self::execute`], also returning the envelope's paging information.
    async fn execute_paged<T: DeserializeOwned>(
        &self,
        what: &str,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<(Option<T>, Option<ResultInfo>), ProjectError> {
        let response = self.send_with_retry(build_request).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("{}: not found", what);
            return Ok((None, None));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProjectError::Provider(format!("{}: failed to read response: {}", what, e)))?;
        let envelope: ApiResponse<T> = serde_json::from_str(&body).map_err(|e| {
            ProjectError::Provider(format!(
                "{}: unexpected response (status {}): {}: {}",
                what, status, e, body
            ))
        })?;

        if !status.is_success() || !envelope.success {
            return Err(ProjectError::Provider(format!(
                "{} failed with status {}: {}",
                what,
                status,
                error_messages(envelope.errors)
            )));
        }
        Ok((envelope.result, envelope.result_info))
    }

    fn required<T>(what: &str, result: Option<T>) -> Result<T, ProjectError> {
        result.ok_or_else(|| ProjectError::Provider(format!("{}: empty result", what)))
    }

    // =========================================================================
    // Account tokens
    // =========================================================================

    /// Permission groups available to account tokens. Fetched once.
    pub async fn permission_groups(&self, token: &str) -> Result<&[PermissionGroup], ProjectError> {
        let groups = self
            .permission_groups
            .get_or_try_init(|| async {
                let url = format!("{}/tokens/permission_groups", self.account_url());
                let groups: Option<Vec<PermissionGroup>> = self
                    .execute("list permission groups", || {
                        self.http_client.get(&url).bearer_auth(token)
                    })
                    .await?;
                let groups = groups.unwrap_or_default();
                debug!("Fetched {} permission groups", groups.len());
                Ok::<_, ProjectError>(groups)
            })
            .await?;
        Ok(groups.as_slice())
    }

    async fn permission_group_refs(
        &self,
        token: &str,
        names: &[&str],
    ) -> Result<Vec<PermissionGroupRef>, ProjectError> {
        let groups = self.permission_groups(token).await?;
        names
            .iter()
            .map(|name| {
                groups
                    .iter()
                    .find(|g| g.name == *name)
                    .map(|g| PermissionGroupRef { id: g.id.clone() })
                    .ok_or_else(|| {
                        ProjectError::Provider(format!("unknown permission group: {}", name))
                    })
            })
            .collect()
    }

    fn resources(&self, scope: &TokenScope) -> serde_json::Map<String, serde_json::Value> {
        let resource = match scope {
            TokenScope::Account => format!("com.cloudflare.api.account.{}", self.account_id),
            TokenScope::Bucket(bucket) => format!(
                "com.cloudflare.edge.r2.bucket.{}_default_{}",
                self.account_id, bucket
            ),
        };
        let mut resources = serde_json::Map::new();
        resources.insert(resource, serde_json::Value::String("*".to_string()));
        resources
    }

    /// List every account token, following the envelope's paging.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn list_tokens(&self, token: &str) -> Result<Vec<ApiToken>, ProjectError> {
        let url = format!("{}/tokens", self.account_url());
        let mut tokens = Vec::new();
        let mut page: u32 = 1;
        loop {
            let page_param = page.to_string();
            let (batch, info): (Option<Vec<ApiToken>>, _) = self
                .execute_paged("list account tokens", || {
                    self.http_client
                        .get(&url)
                        .bearer_auth(token)
                        .query(&[("page", page_param.as_str()), ("per_page", LIST_PAGE_SIZE)])
                })
                .await?;
            let batch = batch.unwrap_or_default();
            let empty = batch.is_empty();
            tokens.extend(batch);

            let total_pages = info.and_then(|i| i.total_pages).unwrap_or(1);
            let current = info.and_then(|i| i.page).unwrap_or(page);
            if empty || current >= total_pages {
                break;
            }
            page = current + 1;
        }
        debug!("listed {} account tokens over {} page(s)", tokens.len(), page);
        Ok(tokens)
    }

    /// Create an account token. The returned token carries its value.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn create_token(
        &self,
        token: &str,
        name: &str,
        permissions: &[&str],
        scope: &TokenScope,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiToken, ProjectError> {
        let what = format!("create token {}", name);
        let body = CreateTokenRequest {
            name,
            policies: vec![TokenPolicy {
                effect: "allow",
                resources: self.resources(scope),
                permission_groups: self.permission_group_refs(token, permissions).await?,
            }],
            expires_on: expires_at.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        };
        let body = serde_json::to_value(&body)?;

        let url = format!("{}/tokens", self.account_url());
        let created: Option<ApiToken> = self
            .execute(&what, || {
                self.http_client.post(&url).bearer_auth(token).json(&body)
            })
            .await?;
        let created = Self::required(&what, created)?;
        if created.value.is_none() {
            return Err(ProjectError::Provider(format!("{}: no token value returned", what)));
        }
        debug!("Created token {} ({})", name, created.id);
        Ok(created)
    }

    /// Roll the value of a token, returning the new value.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn roll_token(&self, token: &str, token_id: &str) -> Result<String, ProjectError> {
        let what = format!("roll token {}", token_id);
        let url = format!("{}/tokens/{}/value", self.account_url(), token_id);
        let value: Option<String> = self
            .execute(&what, || {
                self.http_client
                    .put(&url)
                    .bearer_auth(token)
                    .json(&serde_json::json!({}))
            })
            .await?;
        Self::required(&what, value)
    }

    /// Delete a token. Returns false if it did not exist.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn delete_token(&self, token: &str, token_id: &str) -> Result<bool, ProjectError> {
        let url = format!("{}/tokens/{}", self.account_url(), token_id);
        let response = self
            .send_with_retry(|| self.http_client.delete(&url).bearer_auth(token))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProjectError::Provider(format!(
                "delete token {} failed with status {}: {}",
                token_id, status, text
            )));
        }
        debug!("Deleted token {}", token_id);
        Ok(true)
    }

    /// Check that `token_value` is a valid, active token of the account.
    #[instrument(skip(self, token_value), level = "debug")]
    pub async fn verify_token(&self, token_value: &str) -> Result<(), ProjectError> {
        let url = format!("{}/tokens/verify", self.account_url());
        let verified: Option<VerifiedToken> = self
            .execute("verify token", || {
                self.http_client.get(&url).bearer_auth(token_value)
            })
            .await?;
        let verified = Self::required("verify token", verified)?;
        if verified.status != TOKEN_STATUS_ACTIVE {
            return Err(ProjectError::Provider(format!(
                "token {} is {}, not active",
                verified.id, verified.status
            )));
        }
        Ok(())
    }

    // =========================================================================
    // R2 buckets
    // =========================================================================

    #[instrument(skip(self, token), level = "debug")]
    pub async fn get_bucket(&self, token: &str, name: &str) -> Result<Option<R2Bucket>, ProjectError> {
        let url = format!("{}/r2/buckets/{}", self.account_url(), name);
        self.execute(&format!("get bucket {}", name), || {
            self.http_client.get(&url).bearer_auth(token)
        })
        .await
    }

    #[instrument(skip(self, token), level = "debug")]
    pub async fn create_bucket(&self, token: &str, name: &str) -> Result<R2Bucket, ProjectError> {
        let what = format!("create bucket {}", name);
        let url = format!("{}/r2/buckets", self.account_url());
        let created: Option<R2Bucket> = self
            .execute(&what, || {
                self.http_client
                    .post(&url)
                    .bearer_auth(token)
                    .json(&CreateBucketRequest { name })
            })
            .await?;
        Ok(created.unwrap_or_else(|| R2Bucket {
            name: name.to_string(),
            creation_date: None,
        }))
    }

    /// Delete an empty bucket. Returns false if it did not exist.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn delete_bucket(&self, token: &str, name: &str) -> Result<bool, ProjectError> {
        let url = format!("{}/r2/buckets/{}", self.account_url(), name);
        let response = self
            .send_with_retry(|| self.http_client.delete(&url).bearer_auth(token))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProjectError::Provider(format!(
                "delete bucket {} failed with status {}: {}",
                name, status, text
            )));
        }
        debug!("Deleted bucket {}", name);
        Ok(true)
    }
}
