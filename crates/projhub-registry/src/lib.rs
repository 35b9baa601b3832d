//! Project registry: the persisted metadata store, per-project filesystems
//! and the cache of open projects.

pub mod config;
pub mod fs;
pub mod lock;
pub mod project;
pub mod registry;
pub mod store;
pub mod templates;

#[cfg(test)]
mod test_support;

pub use project::{OpenProjectParams, Project, SECRETS_BUCKET};
pub use registry::{project_key, Registry};
