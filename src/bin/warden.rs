use std::time::Duration;

use clap::Parser;
use node_warden::{
    config::{Config, ServerConfig, read_config_file},
    session::Session,
};
use tokio::{join, spawn};
use tracing::{debug, error, info, instrument, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("node_warden", LevelFilter::TRACE),
        ("warden", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let servers = dispatch_servers(&config);

    join!(servers);

    Ok(())
}

async fn dispatch_servers(config: &Config) {
    let mut handles = vec![];
    if let Some(servers) = &config.servers {
        for server in servers {
            let server = server.clone();

            handles.push(spawn(server_warden(
                server,
                config.alerts.clone().unwrap_or_default(),
                config.data_dir.clone(),
                config.poll_interval,
            )));
        }
    }

    for handler in handles {
        if let Err(e) = handler.await {
            error!("{e}");
        }
    }
}

#[instrument(skip_all, fields(server = %config.id))]
async fn server_warden(
    config: ServerConfig,
    alerts: node_warden::config::AlertConfig,
    data_dir: std::path::PathBuf,
    poll_interval: u64,
) {
    let display_name = config.display_name();
    debug!("starting node warden for {display_name} with interval {poll_interval}s");

    let session = match Session::connect(&config, alerts, &data_dir).await {
        Ok(session) => session,
        Err(e) => {
            error!("{display_name}: {e}");
            return;
        }
    };

    session.start_alerts().await;

    // Drain accepted alerts alongside the reconcile loop.
    let alert_stream = session.alert_stream();
    let drain = spawn(async move {
        while let Some(alert) = alert_stream.next().await {
            info!(
                "[{:?}] {}: {}",
                alert.severity, alert.title, alert.message
            );
        }
    });

    let reconcile_loop = async {
        loop {
            let summary = session.reconcile().await;
            trace!(
                "{display_name}: {} nodes ({} active, {} inactive)",
                summary.total, summary.active, summary.inactive
            );

            tokio::time::sleep(Duration::from_secs(poll_interval)).await;
        }
    };

    tokio::select! {
        _ = reconcile_loop => {}
        _ = tokio::signal::ctrl_c() => {
            debug!("{display_name}: shutting down");
        }
    }

    session.close().await;
    let _ = drain.await;
}
