//! Price alerts - band definitions and the polling monitor
//!
//! An alert fires once: after a successful delivery it is marked triggered
//! and drops out of the active set. A failed delivery leaves it active for
//! the next poll.

use super::{exchange_call, store_call, PRICE_TIMEOUT};
use crate::db::{self, Database};
use crate::error::{TradingError, TradingResult};
use crate::exchange::ExchangeGateway;
use crate::notify::NotificationChannel;
use crate::types::{AlertBoundary, PriceAlert};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

const ALERT_SCAN_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct PriceAlertService {
    db: Arc<Database>,
}

impl PriceAlertService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn create_alert(
        &self,
        recipient: &str,
        symbol: &str,
        min_threshold: Decimal,
        max_threshold: Decimal,
    ) -> TradingResult<PriceAlert> {
        let recipient = recipient.trim();
        let symbol = symbol.trim().to_uppercase();
        if recipient.is_empty() {
            return Err(TradingError::validation("Recipient must be provided"));
        }
        if symbol.is_empty() {
            return Err(TradingError::validation("Trading pair must be provided"));
        }
        if min_threshold <= Decimal::ZERO || max_threshold <= Decimal::ZERO {
            return Err(TradingError::validation(
                "Minimum and maximum thresholds must be greater than zero",
            ));
        }
        if min_threshold >= max_threshold {
            return Err(TradingError::validation(
                "Minimum threshold must be lower than maximum threshold",
            ));
        }

        let alert = store_call(
            "create price alert",
            self.db.insert_alert(recipient, &symbol, min_threshold, max_threshold),
        )
        .await?;
        info!(
            "[Alerts] Watching {} between {} and {} for {}",
            alert.symbol, alert.min_threshold, alert.max_threshold, alert.recipient
        );
        Ok(alert)
    }

    pub async fn list_alerts(&self, limit: u32) -> TradingResult<Vec<PriceAlert>> {
        store_call("list price alerts", self.db.list_alerts(limit)).await
    }
}

fn alert_message(alert: &PriceAlert, current_price: Decimal, boundary: AlertBoundary) -> (String, String) {
    let subject = format!("Price alert for {}", alert.symbol);
    let body = format!(
        "The price for {} has reached your {} threshold.\n\n\
         Current price: {}\nMinimum threshold: {}\nMaximum threshold: {}\n\n\
         This alert is now marked as triggered.",
        alert.symbol, boundary, current_price, alert.min_threshold, alert.max_threshold
    );
    (subject, body)
}

pub struct PriceAlertMonitor {
    db: Arc<Database>,
    gateway: Arc<dyn ExchangeGateway>,
    notifier: Arc<dyn NotificationChannel>,
    poll_interval: Duration,
}

impl PriceAlertMonitor {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn ExchangeGateway>,
        notifier: Arc<dyn NotificationChannel>,
        poll_interval: Duration,
    ) -> Self {
        let poll_interval = if poll_interval.is_zero() {
            Duration::from_secs(60)
        } else {
            poll_interval
        };
        Self {
            db,
            gateway,
            notifier,
            poll_interval,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("[Alerts] Monitor started, polling every {}s", self.poll_interval.as_secs());
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate_active_alerts().await {
                        warn!("[Alerts] Evaluation failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("[Alerts] Shutting down");
                    break;
                }
            }
        }
    }

    /// One poll. Returns how many alerts were delivered and retired.
    pub async fn evaluate_active_alerts(&self) -> TradingResult<usize> {
        let alerts = store_call("load active alerts", self.db.active_alerts()).await?;
        if alerts.is_empty() {
            return Ok(0);
        }

        let symbols: BTreeSet<&str> = alerts
            .iter()
            .take(ALERT_SCAN_LIMIT as usize)
            .map(|a| a.symbol.as_str())
            .collect();
        let mut prices: HashMap<&str, Decimal> = HashMap::new();
        for symbol in symbols {
            match exchange_call("alert price lookup", PRICE_TIMEOUT, self.gateway.current_price(symbol)).await {
                Ok(price) if price > Decimal::ZERO => {
                    prices.insert(symbol, price);
                }
                Ok(price) => warn!("[Alerts] Ignoring non-positive price {} for {}", price, symbol),
                Err(e) => warn!("[Alerts] Price lookup failed for {}: {}", symbol, e),
            }
        }

        let mut triggered = 0;
        for alert in alerts.iter().take(ALERT_SCAN_LIMIT as usize) {
            let Some(&price) = prices.get(alert.symbol.as_str()) else {
                continue;
            };
            let Some(boundary) = alert.crossed_boundary(price) else {
                continue;
            };

            let (subject, body) = alert_message(alert, price, boundary);
            if let Err(e) = self.notifier.send(&alert.recipient, &subject, &body).await {
                warn!("[Alerts] Delivery failed for alert {} ({}): {:#}", alert.id, alert.symbol, e);
                continue;
            }

            match store_call("mark alert triggered", self.db.mark_alert_triggered(alert.id, db::now())).await {
                Ok(_) => {
                    info!("[Alerts] Alert {} fired at {} ({} threshold)", alert.id, price, boundary);
                    triggered += 1;
                }
                Err(e) => warn!("[Alerts] Alert {} delivered but not retired: {}", alert.id, e),
            }
        }
        Ok(triggered)
    }
}
