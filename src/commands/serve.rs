use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use axum::{routing::get, Router};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, Tokio1Executor};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::{Config, EmailConfig},
    database::setup_database,
    delivery::{
        backoff::BackoffPolicy,
        dispatcher::Dispatcher,
        rate_gate::RateGate,
        store::MessageStore,
        worker::{run_prune_loop, DeliveryWorker},
    },
    mailer::Mailer,
};

pub async fn handle_serve_command(config: Config) {
    // The liveness endpoint comes up first and stays up independently of
    // job processing, so orchestrators can tell the process is alive
    // while migrations run.
    let liveness_task = config
        .liveness
        .enabled
        .then(|| tokio::spawn(start_liveness_server(config.liveness.port)));

    let (db, migration_receiver) = setup_database(&config.database).await;

    match migration_receiver.await {
        Ok(Ok(())) => {
            info!("✅ Database is ready!");
        }
        Ok(Err(e)) => {
            error!("❌ Database setup failed: {e}");
            process::exit(1);
        }
        Err(_) => {
            error!("❌ Database setup channel closed unexpectedly");
            process::exit(1);
        }
    }

    let mailer = build_mailer(&config.email);
    let store = MessageStore::Database(db);
    let shutdown = CancellationToken::new();

    let dispatcher = Dispatcher::new(
        store.clone(),
        mailer,
        BackoffPolicy::from_config(&config.delivery),
        Arc::new(RateGate::per_second(config.delivery.rate_per_second)),
        config.delivery.concurrency,
        Duration::from_secs(config.delivery.send_timeout_secs),
    );
    let worker = DeliveryWorker::new(
        store.clone(),
        dispatcher,
        config.delivery.clone(),
        shutdown.clone(),
    );

    let worker_task = tokio::spawn(worker.run());
    let prune_task = tokio::spawn(run_prune_loop(store, config.prune, shutdown.clone()));

    shutdown_signal().await;
    info!("🛑 Shutdown signal received, letting in-flight work finish");
    shutdown.cancel();

    if let Err(e) = worker_task.await {
        error!("Delivery worker task failed: {e}");
    }
    if let Err(e) = prune_task.await {
        error!("Retention sweep task failed: {e}");
    }

    if let Some(task) = liveness_task {
        task.abort();
        let _ = task.await;
    }

    info!("👋 Shutdown complete");
}

fn build_mailer(email: &EmailConfig) -> Mailer {
    match email {
        EmailConfig::Mock => Mailer::mock(),
        EmailConfig::Smtp {
            host,
            port,
            sender,
            username,
            password,
            use_tls,
        } => {
            let mut transport_builder = if *use_tls {
                AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                    .expect("Failed to create mailer transport")
                    .port(*port)
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(*port)
            };

            if let (Some(username), Some(password)) = (username, password) {
                transport_builder = transport_builder
                    .credentials(Credentials::new(username.clone(), password.clone()));
            }

            Mailer::smtp(transport_builder.build(), sender.clone())
        }
    }
}

pub(crate) fn liveness_router() -> Router {
    Router::new()
        .route("/liveness", get(ok))
        .layer(TraceLayer::new_for_http())
}

async fn ok() -> &'static str {
    "OK"
}

async fn start_liveness_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind liveness port");

    info!("🌐 Liveness endpoint on http://{addr}/liveness");
    axum::serve(listener, liveness_router())
        .await
        .expect("Liveness server failed");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        _ = terminate => {},
    }
}
