use std::{process, sync::Arc};

use tailview::{
    application::{
        backend::{Backend, ClusterBackend},
        demo::DemoBackend,
        error::AppError,
        session::{self, SessionConfig},
    },
    config::{self, Command},
    infra::telemetry,
    presentation,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, causes = ?error.messages(), "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(Command::Watch(Box::<config::WatchArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let backend: Arc<dyn Backend> = match command {
        Command::Watch(_) => {
            info!(
                dashboard = %settings.cluster.dashboard_url,
                base_path = %settings.cluster.base_path,
                "Watching cluster"
            );
            Arc::new(ClusterBackend::new(
                settings.cluster.clone(),
                &settings.session,
            )?)
        }
        Command::Demo(_) => {
            info!(
                pods = settings.demo.pods.get(),
                containers_per_pod = settings.demo.containers_per_pod.get(),
                "Starting demo feed"
            );
            Arc::new(DemoBackend::start(&settings.demo)?)
        }
    };

    run_session(backend, SessionConfig::from_settings(&settings.session)).await
}

async fn run_session(backend: Arc<dyn Backend>, config: SessionConfig) -> Result<(), AppError> {
    let handle = session::spawn(backend, config);
    let mut snapshots = handle.snapshots();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "Failed to listen for ctrl-c; stopping");
                }
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", presentation::render(&snapshot));
            }
        }
    }

    info!("Shutting down");
    handle.shutdown().await
}
