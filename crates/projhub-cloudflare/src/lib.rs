//! Cloudflare credential provider for projhub projects.
//!
//! Issues per-project temp tokens and bucket-scoped R2 S3 credentials through
//! the Cloudflare REST API, and tears buckets down through the S3 API.

pub mod api;
pub mod factory;
pub mod provider;
pub mod s3;
pub mod tokens;

pub use api::{CloudflareApi, TokenScope};
pub use factory::CloudflareFactory;
pub use provider::{bucket_name, credentials_key, s3_secret_key, CloudflareProvider};
pub use tokens::{temp_token_name, TempTokenManager};
