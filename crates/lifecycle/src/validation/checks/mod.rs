//! Validators, one per category.
//!
//! Each validator issues a bounded set of read-only checks. Checks within a
//! validator run concurrently and are returned in declaration order.

mod cluster;
mod database;
mod network;
mod prerequisites;
mod resource;
mod security;
mod service;

use async_trait::async_trait;

pub use cluster::ClusterValidator;
pub use database::DatabaseValidator;
pub use network::NetworkValidator;
pub use prerequisites::PrerequisitesValidator;
pub use resource::ResourceValidator;
pub use security::SecurityValidator;
pub use service::ServiceValidator;

use super::context::ValidationContext;
use super::report::{Category, CheckRecord};

/// Produces one category's worth of check records.
#[async_trait]
pub trait Validator: Send + Sync {
    fn category(&self) -> Category;

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord>;
}

/// The standard validator set, in execution order.
#[must_use]
pub fn default_validators() -> Vec<Box<dyn Validator>> {
    vec![
        Box::new(PrerequisitesValidator),
        Box::new(ClusterValidator),
        Box::new(ServiceValidator),
        Box::new(DatabaseValidator),
        Box::new(SecurityValidator),
        Box::new(NetworkValidator),
        Box::new(ResourceValidator),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validators_follow_fixed_order() {
        let categories: Vec<_> = default_validators().iter().map(|v| v.category()).collect();
        assert_eq!(categories, Category::ORDER.to_vec());
    }
}
