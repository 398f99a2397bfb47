use async_trait::async_trait;

use crate::{OrderId, OrderSide, Result};

/// Abstraction over order routing.
///
/// `PaperGateway` implements this for simulation. Fills are not returned from
/// these calls: they arrive later on the fill channel the gateway hands out,
/// and pipelines reconcile them on their own task.
///
/// A rejected submission is `Error::OrderRejected`. Cancelling an order that
/// has already executed is `Error::AlreadyFilled`.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit_market(&self, instrument: &str, side: OrderSide, volume: f64)
        -> Result<OrderId>;

    async fn submit_stop(
        &self,
        instrument: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
    ) -> Result<OrderId>;

    async fn submit_limit(
        &self,
        instrument: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
    ) -> Result<OrderId>;

    async fn cancel(&self, order_id: &OrderId) -> Result<()>;
}
