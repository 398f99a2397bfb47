use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use common::{Bar, Error, Fill, Order, OrderGateway, OrderId, OrderKind, OrderSide, Result};

/// Number of filled or cancelled orders remembered for cancel replies.
const CLOSED_ORDERS_CAPACITY: usize = 1024;

/// Final status of an order that is no longer resting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Filled,
    Cancelled,
}

#[derive(Default)]
struct Book {
    /// Resting stop and limit orders.
    resting: Vec<Order>,
    closed: HashMap<OrderId, Closed>,
    closed_order: VecDeque<OrderId>,
    /// Latest bar per instrument, updated via `update_bar`.
    last_bar: HashMap<String, Bar>,
    fill_txs: HashMap<String, mpsc::UnboundedSender<Fill>>,
    /// Stop and limit submissions seen, for fault injection.
    protective_seen: u32,
}

impl Book {
    /// Record a final status. The oldest entries are forgotten past
    /// [`CLOSED_ORDERS_CAPACITY`]; cancelling one of those reports
    /// `UnknownOrder`.
    fn close(&mut self, id: OrderId, status: Closed) {
        if self.closed.insert(id.clone(), status).is_none() {
            self.closed_order.push_back(id);
            while self.closed_order.len() > CLOSED_ORDERS_CAPACITY {
                if let Some(old) = self.closed_order.pop_front() {
                    self.closed.remove(&old);
                }
            }
        }
    }
}

/// Simulated order gateway for paper trading and replays.
///
/// Market orders fill at the latest close with configurable slippage. Stop
/// and limit orders rest until a later bar reaches their price. Resting
/// orders of the same instrument and side are one-cancels-other: when one
/// fills, its siblings are cancelled. No real orders are ever sent anywhere.
pub struct PaperGateway {
    book: Mutex<Book>,
    /// Slippage in basis points applied to market and stop fills.
    slippage_bps: f64,
    /// Reject every n-th stop/limit submission.
    reject_every: Option<u32>,
}

impl PaperGateway {
    pub fn new(slippage_bps: f64, reject_every: Option<u32>) -> Self {
        info!(
            slippage_bps,
            reject_every = ?reject_every,
            "PaperGateway initialized"
        );
        Self {
            book: Mutex::new(Book::default()),
            slippage_bps,
            reject_every: reject_every.filter(|n| *n > 0),
        }
    }

    /// Fill reports for `instrument`. A later call replaces the earlier
    /// receiver.
    pub async fn subscribe_fills(&self, instrument: &str) -> mpsc::UnboundedReceiver<Fill> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.book.lock().await.fill_txs.insert(instrument.to_string(), tx);
        rx
    }

    /// Feed a new bar: records the latest price and triggers resting orders.
    ///
    /// At most one resting order per instrument and side fills per bar;
    /// stops are checked before limits.
    pub async fn update_bar(&self, instrument: &str, bar: &Bar) {
        let mut book = self.book.lock().await;
        book.last_bar.insert(instrument.to_string(), bar.clone());

        let mut fills = Vec::new();
        for side in [OrderSide::Buy, OrderSide::Sell] {
            let mut candidates: Vec<&Order> = book
                .resting
                .iter()
                .filter(|o| o.instrument == instrument && o.side == side)
                .collect();
            candidates.sort_by_key(|o| match o.kind {
                OrderKind::Stop => 0,
                _ => 1,
            });
            let triggered = candidates
                .into_iter()
                .find_map(|o| self.trigger_price(o, bar).map(|px| (o.clone(), px)));
            if let Some((order, price)) = triggered {
                fills.push((order, price));
            }
        }

        for (order, price) in fills {
            // Siblings share instrument and side with the triggered order.
            let siblings: Vec<OrderId> = book
                .resting
                .iter()
                .filter(|o| o.instrument == order.instrument && o.side == order.side)
                .map(|o| o.id.clone())
                .collect();
            book.resting
                .retain(|o| !(o.instrument == order.instrument && o.side == order.side));
            for id in siblings {
                let status = if id == order.id {
                    Closed::Filled
                } else {
                    Closed::Cancelled
                };
                book.close(id, status);
            }
            debug!(
                instrument = %order.instrument,
                order_id = %order.id,
                kind = ?order.kind,
                price,
                "Resting paper order triggered"
            );
            Self::deliver(&book, &order, price, bar.open_time);
        }
    }

    fn trigger_price(&self, order: &Order, bar: &Bar) -> Option<f64> {
        let level = order.price?;
        match (order.kind, order.side) {
            (OrderKind::Stop, OrderSide::Sell) if bar.low <= level => {
                Some(self.slip(OrderSide::Sell, level.min(bar.open)))
            }
            (OrderKind::Stop, OrderSide::Buy) if bar.high >= level => {
                Some(self.slip(OrderSide::Buy, level.max(bar.open)))
            }
            (OrderKind::Limit, OrderSide::Sell) if bar.high >= level => Some(level.max(bar.open)),
            (OrderKind::Limit, OrderSide::Buy) if bar.low <= level => Some(level.min(bar.open)),
            _ => None,
        }
    }

    /// Buys pay more, sells receive less.
    fn slip(&self, side: OrderSide, price: f64) -> f64 {
        match side {
            OrderSide::Buy => price * (1.0 + self.slippage_bps / 10_000.0),
            OrderSide::Sell => price * (1.0 - self.slippage_bps / 10_000.0),
        }
    }

    fn deliver(book: &Book, order: &Order, price: f64, time: DateTime<Utc>) {
        let fill = Fill {
            fill_id: uuid::Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            instrument: order.instrument.clone(),
            side: order.side,
            price,
            volume: order.volume,
            time,
        };
        match book.fill_txs.get(&order.instrument) {
            Some(tx) if tx.send(fill).is_ok() => {}
            _ => warn!(
                instrument = %order.instrument,
                order_id = %order.id,
                "No fill subscriber, paper fill dropped"
            ),
        }
    }

    async fn rest(&self, order: Order) -> Result<OrderId> {
        if !(order.volume.is_finite() && order.volume > 0.0) {
            return Err(Error::OrderRejected {
                reason: format!("volume must be positive, got {}", order.volume),
            });
        }
        let mut book = self.book.lock().await;
        book.protective_seen += 1;
        if let Some(n) = self.reject_every {
            if book.protective_seen % n == 0 {
                warn!(
                    instrument = %order.instrument,
                    kind = ?order.kind,
                    "Paper order rejected by fault injection"
                );
                return Err(Error::OrderRejected {
                    reason: "simulated rejection".into(),
                });
            }
        }
        debug!(
            instrument = %order.instrument,
            order_id = %order.id,
            kind = ?order.kind,
            side = %order.side,
            price = ?order.price,
            "Paper order resting"
        );
        let id = order.id.clone();
        book.resting.push(order);
        Ok(id)
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit_market(
        &self,
        instrument: &str,
        side: OrderSide,
        volume: f64,
    ) -> Result<OrderId> {
        if !(volume.is_finite() && volume > 0.0) {
            return Err(Error::OrderRejected {
                reason: format!("volume must be positive, got {volume}"),
            });
        }
        let mut book = self.book.lock().await;
        let bar = book.last_bar.get(instrument).cloned().ok_or_else(|| {
            Error::OrderRejected {
                reason: format!("no price for '{instrument}' yet"),
            }
        })?;
        let order = Order::market(instrument, side, volume);
        let price = self.slip(side, bar.close);
        debug!(
            instrument,
            side = %side,
            mid = bar.close,
            fill = price,
            volume,
            "Paper market fill simulated"
        );
        book.close(order.id.clone(), Closed::Filled);
        Self::deliver(&book, &order, price, bar.open_time);
        Ok(order.id)
    }

    async fn submit_stop(
        &self,
        instrument: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
    ) -> Result<OrderId> {
        self.rest(Order::stop(instrument, side, volume, price)).await
    }

    async fn submit_limit(
        &self,
        instrument: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
    ) -> Result<OrderId> {
        self.rest(Order::limit(instrument, side, volume, price)).await
    }

    async fn cancel(&self, order_id: &OrderId) -> Result<()> {
        let mut book = self.book.lock().await;
        if let Some(idx) = book.resting.iter().position(|o| &o.id == order_id) {
            book.resting.remove(idx);
            book.close(order_id.clone(), Closed::Cancelled);
            debug!(order_id = %order_id, "Paper order cancelled");
            return Ok(());
        }
        match book.closed.get(order_id) {
            Some(Closed::Filled) => Err(Error::AlreadyFilled(order_id.clone())),
            Some(Closed::Cancelled) => Ok(()),
            None => Err(Error::UnknownOrder(order_id.clone())),
        }
    }
}

/// Forward `bars` to the returned receiver, updating the paper book with each
/// bar first so resting orders trigger before the consumer sees the bar.
pub fn tee_bars(
    gateway: Arc<PaperGateway>,
    instrument: String,
    mut bars: mpsc::Receiver<Bar>,
) -> mpsc::Receiver<Bar> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(bar) = bars.recv().await {
            if bar.is_final {
                gateway.update_bar(&instrument, &bar).await;
            }
            if tx.send(bar).await.is_err() {
                break;
            }
        }
        debug!(instrument = %instrument, "Paper bar feed ended");
    });
    rx
}
