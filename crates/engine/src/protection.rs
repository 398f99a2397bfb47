use std::sync::Arc;

use tracing::{debug, warn};

use common::{Error, OrderGateway, OrderId, ProtectiveLevels, Result, Side};

/// A live protective order and the price it rests at.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveOrder {
    pub id: OrderId,
    pub price: f64,
}

/// Result of [`ProtectiveSlot::replace_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReplace {
    Placed,
    Unchanged,
    /// The old stop executed before it could be cancelled; its fill will
    /// close the position.
    AlreadyFilled,
}

/// The bracket (stop + take) attached to one stream's position.
///
/// Every change to a resting protective order goes through this slot, one
/// cancel-then-place at a time, from the pipeline's own task.
pub struct ProtectiveSlot {
    instrument: String,
    gateway: Arc<dyn OrderGateway>,
    stop: Option<ActiveOrder>,
    take: Option<ActiveOrder>,
}

impl ProtectiveSlot {
    pub fn new(instrument: impl Into<String>, gateway: Arc<dyn OrderGateway>) -> Self {
        Self {
            instrument: instrument.into(),
            gateway,
            stop: None,
            take: None,
        }
    }

    pub fn stop(&self) -> Option<&ActiveOrder> {
        self.stop.as_ref()
    }

    pub fn take(&self) -> Option<&ActiveOrder> {
        self.take.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.stop.is_none() && self.take.is_none()
    }

    /// Place whichever legs of `levels` are not live yet.
    pub async fn place_bracket(
        &mut self,
        side: Side,
        volume: f64,
        levels: &ProtectiveLevels,
    ) -> Result<()> {
        let exit = side.exit_order_side();
        if let (Some(price), None) = (levels.stop_price, &self.stop) {
            let id = self
                .gateway
                .submit_stop(&self.instrument, exit, volume, price)
                .await?;
            debug!(instrument = %self.instrument, order_id = %id, price, "Stop placed");
            self.stop = Some(ActiveOrder { id, price });
        }
        if let (Some(price), None) = (levels.take_price, &self.take) {
            let id = self
                .gateway
                .submit_limit(&self.instrument, exit, volume, price)
                .await?;
            debug!(instrument = %self.instrument, order_id = %id, price, "Take-profit placed");
            self.take = Some(ActiveOrder { id, price });
        }
        Ok(())
    }

    /// Move the stop to `price`: cancel the live stop, then place the new one.
    pub async fn replace_stop(&mut self, side: Side, volume: f64, price: f64) -> Result<StopReplace> {
        if let Some(current) = &self.stop {
            if current.price == price {
                return Ok(StopReplace::Unchanged);
            }
            match self.gateway.cancel(&current.id).await {
                Ok(()) | Err(Error::UnknownOrder(_)) => {}
                Err(Error::AlreadyFilled(id)) => {
                    warn!(
                        instrument = %self.instrument,
                        order_id = %id,
                        "Stop filled before it could be moved"
                    );
                    self.stop = None;
                    return Ok(StopReplace::AlreadyFilled);
                }
                Err(e) => return Err(e),
            }
            self.stop = None;
        }
        let id = self
            .gateway
            .submit_stop(&self.instrument, side.exit_order_side(), volume, price)
            .await?;
        debug!(instrument = %self.instrument, order_id = %id, price, "Stop moved");
        self.stop = Some(ActiveOrder { id, price });
        Ok(StopReplace::Placed)
    }

    /// Bring the live bracket in line with `levels`.
    pub async fn sync(&mut self, side: Side, volume: f64, levels: &ProtectiveLevels) -> Result<StopReplace> {
        let outcome = match levels.stop_price {
            Some(price) => self.replace_stop(side, volume, price).await?,
            None => StopReplace::Unchanged,
        };
        if outcome != StopReplace::AlreadyFilled {
            self.place_bracket(side, volume, levels).await?;
        }
        Ok(outcome)
    }

    /// Cancel both legs. Returns `true` if either had already executed.
    pub async fn cancel_all(&mut self) -> Result<bool> {
        let mut filled = false;
        let mut failure = None;
        for leg in [self.stop.take(), self.take.take()].into_iter().flatten() {
            match self.gateway.cancel(&leg.id).await {
                Ok(()) | Err(Error::UnknownOrder(_)) => {}
                Err(Error::AlreadyFilled(_)) => filled = true,
                Err(e) => {
                    warn!(instrument = %self.instrument, order_id = %leg.id, error = %e, "Cancel failed");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(filled),
        }
    }

    /// Forget a leg whose fill has arrived. Returns `true` if `order_id` was
    /// one of ours.
    pub fn settle(&mut self, order_id: &OrderId) -> bool {
        if self.stop.as_ref().is_some_and(|o| &o.id == order_id) {
            self.stop = None;
            return true;
        }
        if self.take.as_ref().is_some_and(|o| &o.id == order_id) {
            self.take = None;
            return true;
        }
        false
    }
}
