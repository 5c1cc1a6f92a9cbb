use std::{process, sync::Arc};

use offsite::{
    application::{
        context::{AppContext, Backends},
        error::AppError,
        storage::ObjectStorageClient,
    },
    config::{self, Command, SchedulerSettings},
    domain::{keys::LookupKey, types::TaskState},
    infra::{
        db::PostgresRepositories, error::InfraError, memory::MemoryRepositories,
        object_storage::HttpObjectStorage, telemetry,
    },
};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "offsite::main";

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

    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    let serving = matches!(command, Command::Serve(_));
    let ctx = build_context(&settings, serving).await?;

    match command {
        Command::Serve(_) => {
            run_serve(&ctx, &settings.scheduler, settings.offload.batch_size.get()).await
        }
        Command::Resolve(args) => {
            let mut resolutions = Vec::with_capacity(args.keys.len());
            for key in &args.keys {
                resolutions.push(ctx.resolver.resolve(key).await?);
            }
            print_json(&resolutions)
        }
        Command::Enqueue(args) => {
            let task_id = ctx
                .queue
                .enqueue_local(args.identity, &args.local_path, args.remote_name.as_deref())
                .await?;
            print_json(&serde_json::json!({ "task_id": task_id }))
        }
        Command::Cancel(args) => print_json(&ctx.queue.cancel(args.identity).await?),
        Command::ProcessingComplete(args) => {
            print_json(&ctx.queue.processing_complete(args.identity).await?)
        }
        Command::Tick(_) => print_json(&ctx.queue.tick(settings.offload.batch_size.get()).await),
        Command::Sweep(_) => print_json(&ctx.janitor.run_sweep().await),
        Command::Trim(_) => print_json(&ctx.janitor.run_trim().await),
        Command::RepairIndex(_) => print_json(&ctx.index.repair_uniqueness().await?),
        Command::Stats(_) => print_json(&ctx.stats().await?),
        Command::ScanIndex(args) => {
            let prefix = LookupKey::parse(&args.prefix)
                .map(|key| key.as_str().to_string())
                .unwrap_or_default();
            print_json(&ctx.index.scan_prefix(&prefix, args.limit).await?)
        }
        Command::Task(args) => print_json(&ctx.queue.task_for(args.identity).await?),
        Command::Tasks(args) => {
            let state = TaskState::try_from(args.state.as_str()).map_err(|_| {
                AppError::validation(format!("unknown task state `{}`", args.state))
            })?;
            print_json(&ctx.queue.tasks_in_state(state, args.limit).await?)
        }
    }
}

async fn build_context(
    settings: &config::Settings,
    serving: bool,
) -> Result<AppContext, AppError> {
    let storage = HttpObjectStorage::new(&settings.storage)?;
    if !storage.is_configured() {
        warn!(
            target = SOURCE,
            "storage endpoint is not configured; every upload will be abandoned as fatal"
        );
    }
    let storage: Arc<dyn ObjectStorageClient> = Arc::new(storage);

    let backends = match settings.database.url.as_deref() {
        Some(url) => {
            let pool = PostgresRepositories::connect(url, settings.database.max_connections.get())
                .await
                .map_err(|err| InfraError::database(err.to_string()))?;
            PostgresRepositories::run_migrations(&pool)
                .await
                .map_err(|err| InfraError::database(err.to_string()))?;
            Backends::from_repositories(Arc::new(PostgresRepositories::new(pool)), storage)
        }
        None => {
            if serving {
                warn!(
                    target = SOURCE,
                    "no database url configured; state lives in memory and is lost on exit"
                );
            } else {
                warn!(
                    target = SOURCE,
                    "no database url configured; this command runs against an empty in-memory store"
                );
            }
            Backends::from_repositories(Arc::new(MemoryRepositories::new()), storage)
        }
    };

    AppContext::build(settings, backends)
}

async fn run_serve(
    ctx: &AppContext,
    scheduler: &SchedulerSettings,
    batch_size: u32,
) -> Result<(), AppError> {
    let start = Instant::now();
    let mut tick = interval_at(start, scheduler.tick_interval);
    let mut trim = interval_at(start + scheduler.trim_interval, scheduler.trim_interval);
    let mut sweep = interval_at(start + scheduler.sweep_interval, scheduler.sweep_interval);
    for timer in [&mut tick, &mut trim, &mut sweep] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    info!(
        target = SOURCE,
        tick_secs = scheduler.tick_interval.as_secs(),
        trim_secs = scheduler.trim_interval.as_secs(),
        sweep_secs = scheduler.sweep_interval.as_secs(),
        "scheduler started"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.map_err(InfraError::from)?;
                info!(target = SOURCE, "shutdown requested");
                break;
            }
            _ = tick.tick() => {
                ctx.queue.tick(batch_size).await;
            }
            _ = trim.tick() => {
                ctx.janitor.run_trim().await;
            }
            _ = sweep.tick() => {
                ctx.janitor.run_sweep().await;
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
