//! Core traits and types for the projhub project registry.
//!
//! This crate defines the contract shared between the registry and its pluggable collaborators:
//! - `ProjectData`: the persisted per-project record
//! - `CredentialProvider` / `ProviderFactory`: cloud credential issuance
//! - `KeyValueStore`: the slice of the metadata store providers may use
//! - `ProjectFilesystem`: the per-project virtual filesystem contract
//! - `CallerContext`: execution-context identity and cancellation

mod config;
mod context;
mod credentials;
mod data;
mod error;
mod fs;
mod ids;
mod store;

pub use config::{CloudflareDevConfig, DevSideConfig, SecretsStorage};
pub use context::{CallerContext, ContextId};
pub use credentials::{
    BucketHandle, CloudflareTempTokens, CredentialProvider, CredentialSet, ProviderFactory,
    ProviderKind, TempTokens,
};
pub use data::{ApplicationRecord, CreationParams, LocalSecret, Member, ProjectData};
pub use error::ProjectError;
pub use fs::{FsEntry, ProjectFilesystem};
pub use ids::{is_valid_bucket_name, is_valid_project_name, MemberId, ProjectId};
pub use store::KeyValueStore;
