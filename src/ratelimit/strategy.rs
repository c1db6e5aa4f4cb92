//! Strategy trait for abstracting the admission algorithms.

use async_trait::async_trait;

use super::context::{AdmissionContext, AdmissionResult, Algorithm};
use crate::error::StoreResult;
use crate::store::AdmissionStore;

/// Trait for rate limiting algorithms.
///
/// Implementations are stateless: every check is one atomic script against
/// the shared store, parameterised entirely by the [`AdmissionContext`].
#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    /// The algorithm this strategy implements.
    fn algorithm(&self) -> Algorithm;

    /// Consume a permit if one is available.
    async fn execute(
        &self,
        store: &dyn AdmissionStore,
        ctx: &AdmissionContext,
    ) -> StoreResult<AdmissionResult>;

    /// Approximate permits left for `ctx.key`, without consuming any.
    async fn remaining(&self, store: &dyn AdmissionStore, ctx: &AdmissionContext) -> StoreResult<u64>;
}
