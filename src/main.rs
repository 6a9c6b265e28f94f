use std::{process, sync::Arc};

use quire::{
    application::{
        chain::{ChainMaintainer, RetryPolicy, repair_with_retry},
        error::AppError,
    },
    config::{self, Command},
    infra::{db::PostgresDocumentStore, error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "quire::cli";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Relink(_) => run_relink(settings).await,
        Command::Verify(_) => run_verify(settings).await,
        Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn connect(settings: &config::Settings) -> Result<PostgresDocumentStore, AppError> {
    let url = settings.database.url.as_deref().ok_or_else(|| {
        AppError::validation("database.url is required (set QUIRE__DATABASE__URL or --database-url)")
    })?;

    let pool = PostgresDocumentStore::connect(url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    let store = PostgresDocumentStore::new(pool);
    store
        .health_check()
        .await
        .map_err(InfraError::from)?;
    Ok(store)
}

async fn run_relink(settings: config::Settings) -> Result<(), AppError> {
    let store = connect(&settings).await?;
    let maintainer = ChainMaintainer::new(Arc::new(store));
    let site = &settings.site.key;

    let report = repair_with_retry(&maintainer, site, RetryPolicy::from(&settings.relink)).await?;

    info!(
        target: SOURCE,
        %site,
        members = report.members,
        updated = report.updated.len(),
        "Relink finished"
    );
    Ok(())
}

async fn run_verify(settings: config::Settings) -> Result<(), AppError> {
    let store = connect(&settings).await?;
    let maintainer = ChainMaintainer::new(Arc::new(store));
    let site = &settings.site.key;

    let violations = maintainer.verify_chain(site).await?;
    if violations.is_empty() {
        info!(target: SOURCE, %site, "Chain is consistent");
        return Ok(());
    }

    for violation in &violations {
        warn!(target: SOURCE, %site, %violation, "Chain link out of order");
    }
    Err(AppError::validation(format!(
        "{} chain link(s) disagree with creation order; run `quire relink`",
        violations.len()
    )))
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let store = connect(&settings).await?;
    PostgresDocumentStore::run_migrations(store.pool())
        .await
        .map_err(InfraError::from)?;
    info!(target: SOURCE, "Migrations applied");
    Ok(())
}
