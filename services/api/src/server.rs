use crate::cli::{ServeArgs, SweepArgs};
use crate::infra::{open_store, start_of_day, AppState, LoggingNotificationDispatcher};
use crate::routes::with_document_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use eventstaff::config::AppConfig;
use eventstaff::documents::{
    DocumentApi, DocumentEventBus, DocumentRepository, DocumentService, NotificationDispatcher,
    ReuseEvaluator, SweepError, SweepLedger, TransitionNotifier, ValiditySweeper,
};
use eventstaff::error::AppError;
use eventstaff::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let store = Arc::new(open_store(&config.storage)?);
    let dispatcher = Arc::new(LoggingNotificationDispatcher);
    let events =
        DocumentEventBus::new().subscribe(Arc::new(TransitionNotifier::new(dispatcher.clone())));
    let api = Arc::new(DocumentApi {
        documents: DocumentService::new(store.clone(), events.clone()),
        reuse: ReuseEvaluator::new(store.clone(), events.clone()),
    });

    if args.no_sweeper {
        info!("validity sweeper disabled for this process");
    } else {
        let sweeper = Arc::new(
            ValiditySweeper::new(store, dispatcher, &config.sweeper).with_events(events),
        );
        tokio::spawn(sweep_periodically(sweeper, config.sweeper.interval));
    }

    let app = with_document_routes(api)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "document service ready");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn sweep_periodically<R, N>(sweeper: Arc<ValiditySweeper<R, N>>, period: Duration)
where
    R: DocumentRepository + SweepLedger + 'static,
    N: NotificationDispatcher + 'static,
{
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let sweeper = Arc::clone(&sweeper);
        match tokio::task::spawn_blocking(move || sweeper.run(Utc::now())).await {
            Ok(Ok(report)) if !report.failures.is_empty() => {
                error!(
                    failures = report.failures.len(),
                    "validity sweep finished with per-record failures"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(SweepError::AlreadyRunning)) => {
                info!("validity sweep skipped; another run holds the lease");
            }
            Ok(Err(err)) => error!(error = %err, "validity sweep aborted"),
            Err(err) => error!(error = %err, "validity sweep task panicked"),
        }
    }
}

pub(crate) fn sweep_once(args: SweepArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let store = Arc::new(open_store(&config.storage)?);
    let sweeper = ValiditySweeper::new(
        store,
        Arc::new(LoggingNotificationDispatcher),
        &config.sweeper,
    );
    let as_of = args.as_of.map(start_of_day).unwrap_or_else(Utc::now);
    let report = sweeper.run(as_of)?;

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => println!("Report unavailable as JSON: {err}"),
        }
        return Ok(());
    }

    println!("Validity sweep as of {}", as_of.date_naive());
    println!("- notices created: {}", report.notices_created);
    println!("- deliveries: {}", report.deliveries);
    println!("- records expired: {}", report.records_expired);
    println!("- duplicates skipped: {}", report.duplicates_skipped);
    if report.failures.is_empty() {
        println!("- failures: none");
    } else {
        println!("- failures:");
        for failure in &report.failures {
            println!(
                "  - {} ({}): {}",
                failure.document_id, failure.pass, failure.reason
            );
        }
    }
    Ok(())
}
