//! Order submission, status tracking and cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::order::{Order, OrderRequest, OrderState, OrderStatus};
use super::validation::{OrderValidator, RiskCheck};
use crate::config::Config;
use crate::error::OrderError;
use crate::metrics;

/// How long finished orders stay queryable.
const FINISHED_RETENTION: Duration = Duration::from_secs(3600);

/// Order submission result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitResult {
    /// Order ID (various field names).
    #[serde(alias = "orderID", alias = "orderId", alias = "order_id", alias = "id")]
    pub order_id: Option<String>,
    /// Error message if any.
    #[serde(alias = "errorMsg")]
    pub error: Option<String>,
    /// Success flag.
    pub success: Option<bool>,
}

/// Exchange operations used by the executor.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Send an order. Transport success may still carry no order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<SubmitResult, OrderError>;

    /// Current status of an order.
    async fn order_status(&self, order_id: &str) -> Result<OrderState, OrderError>;

    /// Cancel an order.
    async fn cancel_order(&self, order_id: &str) -> Result<(), OrderError>;
}

/// Terminal outcome of a tracked order.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// Terminal with matched size; opens a position.
    Filled(Order),
    /// Terminal without any fill.
    Closed(Order),
    /// Tracking budget ran out; status is UNKNOWN.
    TrackingTimedOut(Order),
}

impl OrderEvent {
    /// The order carried by the event.
    pub fn order(&self) -> &Order {
        match self {
            OrderEvent::Filled(o) | OrderEvent::Closed(o) | OrderEvent::TrackingTimedOut(o) => o,
        }
    }
}

/// Tracking cadence.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Give up tracking after this long.
    pub track_timeout: Duration,
}

impl ExecutorSettings {
    /// Settings from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.order_poll_interval(),
            track_timeout: config.order_track_timeout(),
        }
    }
}

struct Shared {
    exchange: Arc<dyn ExchangeApi>,
    orders: DashMap<String, Order>,
    tracking: DashMap<String, CancellationToken>,
    events: mpsc::Sender<OrderEvent>,
    settings: ExecutorSettings,
    shutdown: CancellationToken,
}

impl Shared {
    /// Emit the terminal event once; whoever removes the tracking token wins.
    async fn finish(&self, order_id: &str, event: fn(Order) -> OrderEvent) {
        if self.tracking.remove(order_id).is_none() {
            return;
        }
        let Some(order) = self.orders.get(order_id).map(|o| o.clone()) else {
            return;
        };
        if order.status.is_filled() {
            metrics::inc_orders_filled();
        }
        if self.events.send(event(order)).await.is_err() {
            debug!(order_id, "Order event receiver dropped");
        }
    }
}

fn terminal_event(order: &Order) -> fn(Order) -> OrderEvent {
    if order.exposure() > Decimal::ZERO {
        OrderEvent::Filled
    } else {
        OrderEvent::Closed
    }
}

/// Validates, submits and tracks orders.
pub struct OrderExecutor {
    shared: Arc<Shared>,
    validator: Arc<dyn OrderValidator>,
    risk: Arc<dyn RiskCheck>,
}

impl OrderExecutor {
    /// Create an executor sending terminal events to `events`.
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        validator: Arc<dyn OrderValidator>,
        risk: Arc<dyn RiskCheck>,
        events: mpsc::Sender<OrderEvent>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                exchange,
                orders: DashMap::new(),
                tracking: DashMap::new(),
                events,
                settings,
                shutdown: CancellationToken::new(),
            }),
            validator,
            risk,
        }
    }

    /// Validate, risk-check and submit an order, then start tracking it.
    #[instrument(skip(self, request), fields(token = %request.market_token_id, side = %request.side))]
    pub async fn submit(&self, request: OrderRequest) -> Result<Order, OrderError> {
        self.validator
            .validate(&request)
            .map_err(OrderError::Validation)?;

        if !self.risk.approve(&request) {
            return Err(OrderError::RiskRejected(format!(
                "notional {} refused by risk limits",
                request.notional()
            )));
        }

        debug!(
            price = %request.limit_price,
            size = %request.size,
            tif = %request.tif,
            "Submitting order"
        );

        let result = {
            let _timer = metrics::timer_order_submit();
            self.shared.exchange.place_order(&request).await
        };
        let result = result.inspect_err(|_| metrics::inc_orders_failed())?;

        let order_id = match result.order_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                metrics::inc_orders_failed();
                let reason = result
                    .error
                    .unwrap_or_else(|| "no order id in response".to_string());
                warn!(reason = %reason, "Exchange accepted request without an order id");
                return Err(OrderError::ExchangeRejected { reason });
            }
        };

        let order = Order::submitted(order_id.clone(), &request);
        match self.shared.orders.entry(order_id.clone()) {
            Entry::Occupied(_) => {
                metrics::inc_orders_failed();
                return Err(OrderError::ExchangeRejected {
                    reason: format!("duplicate order id {}", order_id),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
            }
        }

        metrics::inc_orders_submitted();
        info!(
            order_id = %order_id,
            price = %request.limit_price,
            size = %request.size,
            "Order submitted"
        );

        self.track(order_id);
        Ok(order)
    }

    /// Cancel an order. Terminal orders are left alone.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: &str) -> Result<(), OrderError> {
        if let Some(order) = self.shared.orders.get(order_id) {
            if order.status.is_terminal() {
                debug!(status = %order.status, "Order already terminal, nothing to cancel");
                return Ok(());
            }
        }

        self.shared.exchange.cancel_order(order_id).await?;
        info!("Order cancelled");

        let Some(event) = self.shared.orders.get_mut(order_id).map(|mut order| {
            order.apply(&OrderState {
                order_id: order_id.to_string(),
                status: Some(OrderStatus::Cancelled),
                filled_size: None,
            });
            terminal_event(&order)
        }) else {
            return Ok(());
        };

        if let Some(token) = self.shared.tracking.get(order_id).map(|t| t.clone()) {
            token.cancel();
        }
        self.shared.finish(order_id, event).await;
        Ok(())
    }

    /// Snapshot of one order.
    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.shared.orders.get(order_id).map(|o| o.clone())
    }

    /// Snapshot of every known order.
    pub fn orders(&self) -> Vec<Order> {
        self.shared.orders.iter().map(|o| o.value().clone()).collect()
    }

    /// Number of orders still being tracked.
    pub fn tracking_count(&self) -> usize {
        self.shared.tracking.len()
    }

    /// Reload orders from a snapshot and resume tracking the open ones.
    pub fn restore(&self, orders: Vec<Order>) {
        for order in orders {
            let Some(order_id) = order.order_id.clone() else {
                continue;
            };
            let resume = !order.status.is_terminal() && order.status != OrderStatus::Unknown;
            self.shared.orders.insert(order_id.clone(), order);
            if resume {
                info!(order_id = %order_id, "Resuming order tracking");
                self.track(order_id);
            }
        }
    }

    /// Drop finished orders older than the retention window.
    pub fn prune_finished(&self) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(FINISHED_RETENTION).unwrap_or_else(|_| chrono::Duration::hours(1));
        let before = self.shared.orders.len();
        self.shared.orders.retain(|id, order| {
            let finished = order.status.is_terminal() || order.status == OrderStatus::Unknown;
            !(finished && order.updated_at < cutoff && !self.shared.tracking.contains_key(id))
        });
        before - self.shared.orders.len()
    }

    /// Stop every tracking task.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    fn track(&self, order_id: String) {
        let token = self.shared.shutdown.child_token();
        self.shared.tracking.insert(order_id.clone(), token.clone());
        tokio::spawn(track_order(self.shared.clone(), order_id, token));
    }
}

#[instrument(skip(shared, token))]
async fn track_order(shared: Arc<Shared>, order_id: String, token: CancellationToken) {
    let deadline = Instant::now() + shared.settings.track_timeout;

    loop {
        let wait = shared
            .settings
            .poll_interval
            .min(deadline.saturating_duration_since(Instant::now()));

        tokio::select! {
            _ = token.cancelled() => {
                debug!("Order tracking stopped");
                return;
            }
            _ = sleep(wait) => {}
        }

        match shared.exchange.order_status(&order_id).await {
            Ok(state) => {
                let finished = shared.orders.get_mut(&order_id).and_then(|mut order| {
                    order.apply(&state);
                    debug!(status = %order.status, filled = %order.filled_size, "Order status");
                    order.status.is_terminal().then(|| terminal_event(&order))
                });
                if let Some(event) = finished {
                    shared.finish(&order_id, event).await;
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Order status poll failed"),
        }

        if Instant::now() >= deadline {
            if let Some(mut order) = shared.orders.get_mut(&order_id) {
                warn!(
                    status = %order.status,
                    filled = %order.filled_size,
                    "Order tracking timed out"
                );
                order.status = OrderStatus::Unknown;
                order.updated_at = chrono::Utc::now();
            }
            shared.finish(&order_id, OrderEvent::TrackingTimedOut).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::order::Side;
    use crate::trading::position::Direction;
    use rust_decimal_macros::dec;

    #[test]
    fn submit_result_reads_exchange_field_names() {
        let parsed: SubmitResult =
            serde_json::from_str(r#"{"orderID":"0xabc","success":true}"#).unwrap();
        assert_eq!(parsed.order_id.as_deref(), Some("0xabc"));

        let missing: SubmitResult =
            serde_json::from_str(r#"{"success":true,"errorMsg":""}"#).unwrap();
        assert!(missing.order_id.is_none());
    }

    #[tokio::test]
    async fn prune_drops_only_old_finished_orders() {
        let (tx, _rx) = mpsc::channel(4);
        let executor = OrderExecutor::new(
            Arc::new(crate::testing::MockExchange::new()),
            Arc::new(super::super::validation::BasicValidator::default()),
            Arc::new(super::super::validation::RiskLimits::new(dec!(1000), dec!(1000))),
            tx,
            ExecutorSettings {
                poll_interval: Duration::from_millis(5),
                track_timeout: Duration::from_millis(50),
            },
        );
        let request = OrderRequest::buy("1234567890123", "0xabc", Direction::Up, dec!(0.4), dec!(10));

        let mut old = Order::submitted("old".to_string(), &request);
        old.status = OrderStatus::Filled;
        old.updated_at = chrono::Utc::now() - chrono::Duration::hours(2);
        let mut fresh = Order::submitted("fresh".to_string(), &request);
        fresh.status = OrderStatus::Cancelled;
        executor.restore(vec![old, fresh]);

        assert_eq!(executor.prune_finished(), 1);
        assert!(executor.get("old").is_none());
        assert!(executor.get("fresh").is_some());
    }

    #[test]
    fn terminal_event_depends_on_exposure() {
        let request = OrderRequest::buy("1234567890123", "0xabc", Direction::Up, dec!(0.4), dec!(10));
        let mut order = Order::submitted("1".to_string(), &request);
        assert_eq!(order.side, Side::Buy);

        order.status = OrderStatus::Cancelled;
        assert!(matches!(terminal_event(&order)(order.clone()), OrderEvent::Closed(_)));

        order.filled_size = dec!(4);
        assert!(matches!(terminal_event(&order)(order.clone()), OrderEvent::Filled(_)));
    }
}
