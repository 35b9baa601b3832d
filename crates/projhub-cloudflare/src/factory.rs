use std::sync::Arc;

use projhub_core::{
    CloudflareDevConfig, CredentialProvider, DevSideConfig, KeyValueStore, ProjectError,
    ProjectId, ProviderFactory, ProviderKind, TempTokens,
};
use tracing::debug;

use crate::api::CloudflareApi;
use crate::provider::CloudflareProvider;

/// Builds a [`CloudflareProvider`] for every project whose configuration
/// carries a Cloudflare section.
#[derive(Clone, Default)]
pub struct CloudflareFactory {
    http_client: reqwest::Client,
}

impl CloudflareFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(
        &self,
        project_id: &ProjectId,
        config: &CloudflareDevConfig,
        temp_tokens: Option<&TempTokens>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<CloudflareProvider, ProjectError> {
        if config.account_id.trim().is_empty() {
            return Err(ProjectError::InvalidInput(
                "Cloudflare account id is empty".to_string(),
            ));
        }
        if config.additional_tokens_api_token.trim().is_empty() {
            return Err(ProjectError::InvalidInput(
                "Cloudflare API token is empty".to_string(),
            ));
        }

        let api = Arc::new(CloudflareApi::new(
            self.http_client.clone(),
            &config.api_base_url(),
            config.account_id.clone(),
        ));
        debug!(
            "Building Cloudflare provider for project {} (account {})",
            project_id, config.account_id
        );
        Ok(CloudflareProvider::new(
            project_id.clone(),
            api,
            config.additional_tokens_api_token.clone(),
            config.s3_endpoint(),
            store,
        )
        .with_temp_tokens(temp_tokens))
    }
}

impl ProviderFactory for CloudflareFactory {
    fn create(
        &self,
        kind: ProviderKind,
        project_id: &ProjectId,
        config: &DevSideConfig,
        temp_tokens: Option<&TempTokens>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Option<Arc<dyn CredentialProvider>>, ProjectError> {
        if kind != ProviderKind::Cloudflare {
            return Ok(None);
        }
        let Some(cloudflare) = config.cloudflare.as_ref() else {
            return Ok(None);
        };
        let provider = self.build(project_id, cloudflare, temp_tokens, store)?;
        Ok(Some(Arc::new(provider)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoStore;

    impl KeyValueStore for NoStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, ProjectError> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &[u8]) -> Result<Option<Vec<u8>>, ProjectError> {
            Ok(None)
        }
        fn delete(&self, _key: &str) -> Result<bool, ProjectError> {
            Ok(false)
        }
    }

    fn config(account_id: &str) -> DevSideConfig {
        DevSideConfig {
            cloudflare: Some(CloudflareDevConfig {
                account_id: account_id.to_string(),
                additional_tokens_api_token: "token".to_string(),
                api_base_url: None,
                s3_endpoint: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_create() {
        let id = ProjectId::parse("app-0123456789abcdef").unwrap();
        let factory = CloudflareFactory::new();

        let provider = factory
            .create(ProviderKind::Cloudflare, &id, &config("acc"), None, Arc::new(NoStore))
            .unwrap()
            .unwrap();
        assert_eq!(provider.kind(), ProviderKind::Cloudflare);

        let none = factory
            .create(
                ProviderKind::Cloudflare,
                &id,
                &DevSideConfig::default(),
                None,
                Arc::new(NoStore),
            )
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_rejects_empty_account() {
        let id = ProjectId::parse("app-0123456789abcdef").unwrap();
        let err = CloudflareFactory::new()
            .create(ProviderKind::Cloudflare, &id, &config(" "), None, Arc::new(NoStore))
            .err()
            .unwrap();
        assert!(matches!(err, ProjectError::InvalidInput(_)));
    }

    #[test]
    fn test_default_endpoint() {
        let id = ProjectId::parse("app-0123456789abcdef").unwrap();
        let config = config("acc");
        let provider = CloudflareFactory::new()
            .build(&id, config.cloudflare.as_ref().unwrap(), None, Arc::new(NoStore))
            .unwrap();
        assert_eq!(provider.s3_endpoint(), "https://acc.r2.cloudflarestorage.com");
        assert_eq!(provider.project_id(), &id);
    }
}
