use serde::{Deserialize, Serialize};

use crate::credentials::ProviderKind;

/// Where a project's secrets live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsStorage {
    /// Secrets are kept in the project record; no external bucket is used.
    #[default]
    Local,
    /// Secrets are kept in a provider-side bucket.
    Bucket,
}

/// Cloudflare account settings for development-side credential issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareDevConfig {
    pub account_id: String,
    /// API token allowed to create and delete other account tokens.
    pub additional_tokens_api_token: String,
    /// Override of `https://api.cloudflare.com/client/v4`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    /// Override of `https://<account>.r2.cloudflarestorage.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_endpoint: Option<String>,
}

impl CloudflareDevConfig {
    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| "https://api.cloudflare.com/client/v4".to_string())
    }

    /// R2 endpoint URL for the S3-compatible API.
    pub fn s3_endpoint(&self) -> String {
        self.s3_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.r2.cloudflarestorage.com", self.account_id))
    }
}

/// Configuration supplied by the development side when a project is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevSideConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudflare: Option<CloudflareDevConfig>,
    #[serde(default)]
    pub secrets_storage: SecretsStorage,
}

impl DevSideConfig {
    /// Providers this configuration asks to bind.
    pub fn requested_providers(&self) -> Vec<ProviderKind> {
        let mut kinds = Vec::new();
        if self.cloudflare.is_some() {
            kinds.push(ProviderKind::Cloudflare);
        }
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: DevSideConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.secrets_storage, SecretsStorage::Local);
        assert!(config.requested_providers().is_empty());
    }

    #[test]
    fn test_cloudflare_endpoints() {
        let config: DevSideConfig = serde_json::from_str(
            r#"{"cloudflare": {"accountId": "acc1", "additionalTokensApiToken": "tok"},
                "secretsStorage": "bucket"}"#,
        )
        .unwrap();
        let cf = config.cloudflare.as_ref().unwrap();
        assert_eq!(cf.s3_endpoint(), "https://acc1.r2.cloudflarestorage.com");
        assert_eq!(cf.api_base_url(), "https://api.cloudflare.com/client/v4");
        assert_eq!(config.secrets_storage, SecretsStorage::Bucket);
        assert_eq!(config.requested_providers(), vec![ProviderKind::Cloudflare]);
    }
}
