//! Axum server setup and engine wiring

use crate::api::routes;
use crate::exchange::{BinanceClient, ExchangeGateway};
use crate::notify::{LogNotifier, NotificationChannel, WebhookNotifier};
use crate::services::{
    AutomationLoop, CapitalLedger, CredentialManager, CredentialStore, DailyPurchaseLoop, DailyPurchaseSettingsService,
    PriceAlertMonitor, PriceAlertService, PriceHistoryService, PurchaseService, ScheduleStateMachine, SymbolCatalogue,
    TradingParameters, TradingSettings,
};
use crate::{Config, Database};
use anyhow::Result;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<Config>,
    pub settings: TradingSettings,
    pub ledger: CapitalLedger,
    pub schedule: ScheduleStateMachine,
    pub credentials: Arc<CredentialManager>,
    pub purchases: PurchaseService,
    pub automation: Arc<AutomationLoop>,
    pub daily_settings: DailyPurchaseSettingsService,
    pub daily_loop: Arc<DailyPurchaseLoop>,
    pub alerts: PriceAlertService,
    pub alert_monitor: Arc<PriceAlertMonitor>,
    pub symbols: SymbolCatalogue,
    pub history: PriceHistoryService,
    pub gateway: Arc<dyn ExchangeGateway>,
}

impl AppState {
    /// Open the database and wire the engine against the Binance REST API
    pub async fn new(config: Config) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database_path).await?);
        let store = CredentialStore::new(config.environment, &config.api_base_url);
        let gateway: Arc<dyn ExchangeGateway> = Arc::new(BinanceClient::new(store.clone()));
        let notifier: Arc<dyn NotificationChannel> = match &config.alert_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };
        Ok(Self::from_parts(config, db, store, gateway, notifier))
    }

    /// Wire the engine from already-built collaborators
    pub fn from_parts(
        config: Config,
        db: Arc<Database>,
        store: CredentialStore,
        gateway: Arc<dyn ExchangeGateway>,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        let config = Arc::new(config);
        let settings = TradingSettings::new(TradingParameters {
            capital_threshold: config.capital_threshold,
            target_profit_percent: config.target_profit_percent,
        });
        let interval = Duration::from_secs(config.auto_sell_interval_minutes.max(1) * 60);

        let symbols = SymbolCatalogue::new(gateway.clone());
        let credentials = Arc::new(CredentialManager::new(
            db.clone(),
            store,
            gateway.clone(),
            symbols.clone(),
            config.clone(),
        ));
        let ledger = CapitalLedger::new(db.clone(), settings.clone(), &config.trade_symbol);
        let schedule = ScheduleStateMachine::new(db.clone(), settings.clone(), &config.trade_symbol, interval);
        let purchases = PurchaseService::new(
            credentials.clone(),
            ledger.clone(),
            schedule.clone(),
            gateway.clone(),
            symbols.clone(),
            settings.clone(),
        );
        let automation = Arc::new(AutomationLoop::new(
            ledger.clone(),
            schedule.clone(),
            gateway.clone(),
            interval,
        ));
        let daily_settings =
            DailyPurchaseSettingsService::new(db.clone(), &config.trade_symbol, config.daily_purchase_hour_utc);
        let daily_loop = Arc::new(DailyPurchaseLoop::new(
            daily_settings.clone(),
            credentials.clone(),
            ledger.clone(),
            schedule.clone(),
            gateway.clone(),
            symbols.clone(),
            settings.clone(),
        ));
        let alerts = PriceAlertService::new(db.clone());
        let alert_monitor = Arc::new(PriceAlertMonitor::new(
            db.clone(),
            gateway.clone(),
            notifier,
            Duration::from_secs(config.price_alert_poll_seconds),
        ));
        let history = PriceHistoryService::new(gateway.clone());

        Self {
            db,
            config,
            settings,
            ledger,
            schedule,
            credentials,
            purchases,
            automation,
            daily_settings,
            daily_loop,
            alerts,
            alert_monitor,
            symbols,
            history,
            gateway,
        }
    }

    /// Validate credentials, then start the automation, daily purchase and
    /// price alert loops. Each loop exits when `shutdown` fires.
    pub async fn start_background_tasks(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.credentials.initialize().await;

        let mut handles = Vec::new();

        let automation = self.automation.clone();
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            info!("Starting automatic sell loop...");
            automation.run(rx).await;
        }));

        let daily = self.daily_loop.clone();
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            info!("Starting daily purchase loop...");
            daily.run(rx).await;
        }));

        let monitor = self.alert_monitor.clone();
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            info!("Starting price alert monitor...");
            monitor.run(rx).await;
        }));

        handles
    }
}

/// Create the Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    // API routes
    let api_routes = Router::new()
        // Positions and automation
        .route("/operations", get(routes::operations::list_operations))
        .route("/operations/page", get(routes::operations::list_operations_page))
        .route("/operations/purchase", post(routes::operations::purchase))
        .route("/operations/record", post(routes::operations::record_purchase))
        .route("/operations/execute-next", post(routes::operations::execute_next))
        .route("/schedule", get(routes::operations::list_schedule))
        // Execution history
        .route("/executions", get(routes::executions::list_executions))
        .route("/executions/page", get(routes::executions::list_executions_page))
        // Credentials
        .route(
            "/credentials",
            get(routes::credentials::get_status).post(routes::credentials::submit_credentials),
        )
        .route("/credentials/environment", post(routes::credentials::activate_environment))
        .route("/credentials/revalidate", post(routes::credentials::revalidate))
        // Settings
        .route(
            "/settings/trading",
            get(routes::settings::get_trading).put(routes::settings::update_trading),
        )
        .route(
            "/settings/daily-purchase",
            get(routes::settings::get_daily_purchase).put(routes::settings::update_daily_purchase),
        )
        // Price alerts
        .route("/alerts", get(routes::alerts::list_alerts).post(routes::alerts::create_alert))
        // Market data
        .route("/symbols", get(routes::market::list_symbols))
        .route("/open-orders", get(routes::market::list_open_orders))
        .route("/market/history", get(routes::market::price_history));

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
