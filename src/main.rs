//! kwachaflow service entry point.
//!
//! Wiring order: config, logging, durable stores, gateway clients, engine,
//! background retry worker, HTTP surface. With no `postgres_url` configured
//! the service falls back to in-memory stores, which is useful for local
//! development and useless for production.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use kwachaflow::config::AppConfig;
use kwachaflow::corebank::{CoreBankClient, HttpBankClient, MockBankClient};
use kwachaflow::funds::{
    FundCoordinator, MemoryTransactionStore, PgTransactionStore, RetryScheduler, RetryWorker,
    TransactionStore,
};
use kwachaflow::notify::LogNotifier;
use kwachaflow::provider::{HttpProviderGateway, ProviderRegistry};
use kwachaflow::service::{self, AppState};
use kwachaflow::session::MemorySessionStore;
use kwachaflow::workflow::{
    HttpApiDispatcher, MemoryWorkflowStore, OtpEngine, PgWorkflowStore, WorkflowEngine,
    WorkflowStore,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _guard = kwachaflow::logging::init_logging(&config);

    info!(env = %env, "starting kwachaflow");

    // Durable stores: PostgreSQL when configured, in-memory otherwise.
    let (workflow_store, transaction_store): (Arc<dyn WorkflowStore>, Arc<dyn TransactionStore>) =
        match &config.postgres_url {
            Some(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("connect to postgres")?;
                let workflows = PgWorkflowStore::new(pool.clone());
                workflows.ensure_schema().await.context("workflow schema")?;
                let transactions = PgTransactionStore::new(pool);
                transactions.ensure_schema().await.context("transaction schema")?;
                info!("durable store: PostgreSQL");
                (
                    Arc::new(workflows) as Arc<dyn WorkflowStore>,
                    Arc::new(transactions) as Arc<dyn TransactionStore>,
                )
            }
            None => {
                warn!("no postgres_url configured; using in-memory stores (dev only)");
                (
                    Arc::new(MemoryWorkflowStore::new()) as Arc<dyn WorkflowStore>,
                    Arc::new(MemoryTransactionStore::new()) as Arc<dyn TransactionStore>,
                )
            }
        };

    let sessions = Arc::new(MemorySessionStore::new());

    // Core-banking client: HTTP against the configured endpoint, or the
    // in-memory ledger when running fully standalone.
    let bank: Arc<dyn CoreBankClient> = if config.postgres_url.is_some() {
        Arc::new(
            HttpBankClient::new(&config.funds.corebank_endpoint, config.funds.bank_timeout())
                .context("corebank client")?,
        )
    } else {
        warn!("standalone mode: using in-memory core-banking ledger");
        Arc::new(MockBankClient::new())
    };

    let mut providers = ProviderRegistry::new();
    for biller in &config.billers {
        providers.register(
            &biller.code,
            Arc::new(
                HttpProviderGateway::new(
                    &biller.code,
                    &biller.endpoint,
                    config.funds.provider_timeout(),
                    biller.debit_override,
                )
                .with_context(|| format!("provider {}", biller.code))?,
            ),
        );
        info!(biller = %biller.code, endpoint = %biller.endpoint, "registered biller");
    }

    let coordinator = Arc::new(FundCoordinator::new(
        bank.clone(),
        providers,
        transaction_store.clone(),
        config.funds.clone(),
        config.retry.clone(),
    ));

    let otp = OtpEngine::new(sessions.clone(), Arc::new(LogNotifier), config.otp.clone());
    let api = Arc::new(HttpApiDispatcher::new(config.funds.provider_timeout()).context("api dispatcher")?);

    let engine = Arc::new(WorkflowEngine::new(
        workflow_store,
        sessions,
        coordinator,
        otp,
        api,
        config.session.ttl(),
        &config.funds.currency,
    ));

    let scheduler = Arc::new(RetryScheduler::new(
        bank,
        transaction_store.clone(),
        config.retry.clone(),
        config.funds.bank_timeout(),
    ));

    // Background retry sweep on a fixed interval.
    let worker = RetryWorker::new(
        scheduler.clone(),
        std::time::Duration::from_secs(config.retry.sweep_interval_secs),
    );
    tokio::spawn(async move {
        worker.run().await;
    });

    let state = Arc::new(AppState {
        engine,
        scheduler,
        transactions: transaction_store,
    });

    service::serve(state, &config.gateway.host, config.gateway.port).await
}
