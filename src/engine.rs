//! The control loop wiring orders, positions and redemption together.
//!
//! One task owns the loop. It reacts to order events, operator commands,
//! finished redemptions and a fixed-cadence tick. Redemptions run as spawned
//! tasks, at most one per condition id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, PositionError, Result};
use crate::redemption::{RedemptionManager, RedemptionResult};
use crate::store::Store;
use crate::trading::execution::{OrderEvent, OrderExecutor};
use crate::trading::order::{Order, OrderRequest};
use crate::trading::position::{Direction, Position};
use crate::trading::tracker::PositionTracker;

/// How long shutdown waits for running redemptions.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Run one redemption for a position end to end.
///
/// Moves the position to REDEEMING, drives the protocol and applies the
/// result. Invariant violations and unredeemable positions fail the
/// position with an operator alert; other errors leave it REDEEMING so the
/// next cycle resumes it.
#[instrument(skip(tracker, manager, cancel))]
pub async fn redeem_position(
    tracker: &PositionTracker,
    manager: &RedemptionManager,
    condition_id: &str,
    cancel: &CancellationToken,
) -> Result<Position> {
    let position = tracker.begin_redemption(condition_id)?;

    match manager.redeem(&position, cancel).await {
        Ok(result) => tracker.on_redemption_result(condition_id, &result).await,
        Err(e) if halts_redemption(&e) => {
            error!(error = %e, "Redemption halted");
            let mut halted = RedemptionResult::failed(
                Vec::new(),
                None,
                manager.manual_link(condition_id),
            );
            halted.error = Some(e.to_string());
            tracker.on_redemption_result(condition_id, &halted).await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn halts_redemption(e: &EngineError) -> bool {
    e.is_invariant_violation()
        || matches!(e, EngineError::Position(PositionError::UnusableOrder(_)))
}

enum EngineCommand {
    MarketSettled {
        condition_id: String,
        winner: Direction,
        reply: oneshot::Sender<Result<bool>>,
    },
    Retry {
        condition_id: String,
        reply: oneshot::Sender<Result<Position>>,
    },
    CancelRedemption {
        condition_id: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    executor: Arc<OrderExecutor>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Settlement signal. Returns whether a redemption was started.
    pub async fn market_settled(&self, condition_id: &str, winner: Direction) -> Result<bool> {
        self.request(|reply| EngineCommand::MarketSettled {
            condition_id: condition_id.to_string(),
            winner,
            reply,
        })
        .await?
    }

    /// Operator retry of a REDEMPTION_FAILED position.
    pub async fn retry(&self, condition_id: &str) -> Result<Position> {
        self.request(|reply| EngineCommand::Retry {
            condition_id: condition_id.to_string(),
            reply,
        })
        .await?
    }

    /// Stop a running redemption after its current tier.
    pub async fn cancel_redemption(&self, condition_id: &str) -> Result<bool> {
        self.request(|reply| EngineCommand::CancelRedemption {
            condition_id: condition_id.to_string(),
            reply,
        })
        .await
    }

    /// Submit an order through the executor.
    pub async fn submit_order(&self, request: OrderRequest) -> Result<Order> {
        Ok(self.executor.submit(request).await?)
    }

    /// Cancel an order through the executor.
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        Ok(self.executor.cancel(order_id).await?)
    }

    /// Ask the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// The control loop.
pub struct Engine {
    tracker: Arc<PositionTracker>,
    manager: Arc<RedemptionManager>,
    executor: Arc<OrderExecutor>,
    store: Arc<Store>,
    order_events: mpsc::Receiver<OrderEvent>,
    commands: mpsc::Receiver<EngineCommand>,
    in_flight: HashMap<String, CancellationToken>,
    tasks: JoinSet<(String, Result<Position>)>,
    cycle: Duration,
    shutdown: CancellationToken,
}

impl Engine {
    /// Create the engine and its handle.
    pub fn new(
        tracker: Arc<PositionTracker>,
        manager: Arc<RedemptionManager>,
        executor: Arc<OrderExecutor>,
        store: Arc<Store>,
        order_events: mpsc::Receiver<OrderEvent>,
        cycle: Duration,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let handle = EngineHandle {
            commands: tx,
            executor: executor.clone(),
            shutdown: shutdown.clone(),
        };
        let engine = Self {
            tracker,
            manager,
            executor,
            store,
            order_events,
            commands: rx,
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            cycle,
            shutdown,
        };
        (engine, handle)
    }

    /// Run until shutdown. Positions left mid-redemption are resumed first.
    pub async fn run(mut self) -> Result<()> {
        for position in self.tracker.pending_redemption() {
            info!(
                condition_id = %position.condition_id,
                status = %position.status,
                "Resuming redemption"
            );
            self.spawn_redemption(&position.condition_id);
        }

        let mut ticker = interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(cycle_ms = self.cycle.as_millis() as u64, "Engine started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.control_cycle(),
                Some(event) = self.order_events.recv() => self.on_order_event(event).await,
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok((condition_id, result)) => self.on_redemption_done(condition_id, result).await,
                        Err(e) => error!(error = %e, "Redemption task aborted"),
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        info!(in_flight = self.in_flight.len(), "Engine stopping");
        self.executor.shutdown();
        self.save_orders();

        let drain = async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Ok((condition_id, result)) = joined {
                    self.in_flight.remove(&condition_id);
                    log_redemption(&condition_id, &result);
                }
            }
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Redemptions still running at shutdown, they resume on next start"
            );
            self.tasks.abort_all();
        }
        info!("Engine stopped");
    }

    fn control_cycle(&mut self) {
        for position in self.tracker.pending_redemption() {
            self.spawn_redemption(&position.condition_id);
        }
        if let Err(e) = self.tracker.archive_terminal() {
            warn!(error = %e, "Archiving positions failed");
        }
        let pruned = self.executor.prune_finished();
        if pruned > 0 {
            debug!(pruned, "Finished orders pruned");
        }
        self.save_orders();
    }

    fn save_orders(&self) {
        let open: Vec<Order> = self
            .executor
            .orders()
            .into_iter()
            .filter(|o| !o.status.is_terminal())
            .collect();
        if let Err(e) = self.store.save_orders(&open) {
            warn!(error = %e, "Saving order snapshot failed");
        }
    }

    async fn on_order_event(&mut self, event: OrderEvent) {
        let order = event.order();
        let opens_position = match &event {
            OrderEvent::Filled(_) => true,
            OrderEvent::TrackingTimedOut(o) => {
                warn!(order_id = ?o.order_id, filled = %o.filled_size, "Order status unknown after tracking timeout");
                o.exposure() > rust_decimal::Decimal::ZERO
            }
            OrderEvent::Closed(o) => {
                info!(order_id = ?o.order_id, status = %o.status, "Order closed without fill");
                false
            }
        };

        if opens_position {
            if let Err(e) = self.tracker.on_order_filled(order) {
                error!(order_id = ?order.order_id, error = %e, "Could not open position");
                if e.is_invariant_violation() {
                    self.tracker
                        .alert(&format!(
                            "Order {:?} filled but was not tracked: {}",
                            order.order_id, e
                        ))
                        .await;
                }
            }
        }
        self.save_orders();
    }

    fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::MarketSettled {
                condition_id,
                winner,
                reply,
            } => {
                let result = self
                    .tracker
                    .on_market_settled(&condition_id, winner)
                    .map(|settled| match settled {
                        Some(_) => self.spawn_redemption(&condition_id),
                        None => false,
                    });
                let _ = reply.send(result);
            }
            EngineCommand::Retry {
                condition_id,
                reply,
            } => {
                let result = self.tracker.retry_failed(&condition_id);
                if result.is_ok() {
                    self.spawn_redemption(&condition_id);
                }
                let _ = reply.send(result);
            }
            EngineCommand::CancelRedemption {
                condition_id,
                reply,
            } => {
                let cancelled = match self.in_flight.get(&condition_id) {
                    Some(token) => {
                        info!(condition_id = %condition_id, "Redemption cancel requested");
                        token.cancel();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(cancelled);
            }
        }
    }

    /// Start a redemption task unless one is already running for the market.
    fn spawn_redemption(&mut self, condition_id: &str) -> bool {
        if self.in_flight.contains_key(condition_id) {
            debug!(condition_id, "Redemption already in flight");
            return false;
        }

        let cancel = CancellationToken::new();
        self.in_flight
            .insert(condition_id.to_string(), cancel.clone());

        let tracker = self.tracker.clone();
        let manager = self.manager.clone();
        let id = condition_id.to_string();
        let worker = tokio::spawn(async move {
            redeem_position(&tracker, &manager, &id, &cancel).await
        });

        let id = condition_id.to_string();
        self.tasks.spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(EngineError::Io(std::io::Error::other(format!(
                    "redemption task failed: {}",
                    e
                )))),
            };
            (id, result)
        });
        true
    }

    async fn on_redemption_done(&mut self, condition_id: String, result: Result<Position>) {
        self.in_flight.remove(&condition_id);
        log_redemption(&condition_id, &result);
    }
}

fn log_redemption(condition_id: &str, result: &Result<Position>) {
    match result {
        Ok(position) => info!(condition_id, status = %position.status, "Redemption run finished"),
        Err(e) if e.is_invariant_violation() => {
            error!(condition_id, error = %e, "Redemption halted")
        }
        Err(e) => warn!(condition_id, error = %e, "Redemption run failed, retrying next cycle"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{condition_id, Harness, MockExchange};
    use crate::trading::execution::ExecutorSettings;
    use crate::trading::position::PositionStatus;
    use crate::trading::validation::{BasicValidator, RiskLimits};
    use rust_decimal_macros::dec;

    fn engine(harness: &Harness) -> (Engine, EngineHandle) {
        let (tx, rx) = mpsc::channel(16);
        let executor = Arc::new(OrderExecutor::new(
            Arc::new(MockExchange::new()),
            Arc::new(BasicValidator::default()),
            Arc::new(RiskLimits::new(dec!(100), dec!(50))),
            tx,
            ExecutorSettings {
                poll_interval: Duration::from_millis(5),
                track_timeout: Duration::from_millis(100),
            },
        ));
        Engine::new(
            harness.tracker.clone(),
            harness.manager.clone(),
            executor,
            harness.store.clone(),
            rx,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn unredeemable_condition_fails_with_one_alert() {
        let harness = Harness::new("engine-halt");
        harness.settled_position("0xnot-a-condition");

        let err = redeem_position(
            &harness.tracker,
            &harness.manager,
            "0xnot-a-condition",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Position(PositionError::UnusableOrder(_))
        ));
        let position = harness.tracker.get("0xnot-a-condition").unwrap();
        assert_eq!(position.status, PositionStatus::RedemptionFailed);
        assert!(position.redemption_attempts.is_empty());
        assert!(harness.relay.posts().is_empty());
        assert_eq!(harness.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_redemption_resumes_on_start() {
        let harness = Harness::new("engine-resume");
        let id = condition_id(0x41);
        harness.settled_position(&id);
        harness.tracker.begin_redemption(&id).unwrap();

        let restarted = harness.restart();
        restarted.relay.accept(&restarted.relay_urls[0], "0xresumed");
        let (engine, handle) = engine(&restarted);
        let running = tokio::spawn(engine.run());

        let mut status = PositionStatus::Redeeming;
        for _ in 0..100 {
            status = restarted.tracker.get(&id).map(|p| p.status).unwrap_or(status);
            if status == PositionStatus::Redeemed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, PositionStatus::Redeemed);

        handle.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_without_running_redemption_reports_false() {
        let harness = Harness::new("engine-cancel");
        let (engine, handle) = engine(&harness);
        let running = tokio::spawn(engine.run());

        assert!(!handle.cancel_redemption(&condition_id(0x42)).await.unwrap());
        let err = handle.retry(&condition_id(0x42)).await.unwrap_err();
        assert!(matches!(err, EngineError::Position(PositionError::NotFound(_))));

        handle.shutdown();
        running.await.unwrap().unwrap();
        assert!(matches!(
            handle.market_settled(&condition_id(0x42), Direction::Up).await,
            Err(EngineError::Stopped)
        ));
    }
}
