use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;
use tracing::{info, trace};

#[macro_use]
extern crate quick_error;

mod arming;
mod automations;
mod config;
mod drivers;
mod model;
mod pipeline;
mod sessions;
mod store;

use arming::{schedule::ArmingScheduler, ArmingService};
use automations::{AutomationEngine, LiveActionSink};
use drivers::hub::HttpTokenRefresher;
use drivers::Drivers;
use pipeline::{EventPipeline, EventSubmitter};
use sessions::SessionManager;
use store::{CredentialStore, Store};

#[derive(Debug, StructOpt)]
#[structopt(name = "fusion-bridge", about = "Multi-tenant security/IoT event bridge.")]
struct CliArgs {
    #[structopt(
        parse(from_os_str),
        short = "c",
        long = "config",
        default_value = "config.toml",
        help = "Path to configuration file. See sample_config.toml for format.",
        env = "FUSION_CONFIG"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::from_args();
    let cfg = config::load_config(args.config).unwrap();

    let filter = tracing_subscriber::EnvFilter::new(&cfg.system.log_level);
    let stdout_subscriber = tracing_subscriber::fmt()
        // Filter from user
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(stdout_subscriber).unwrap();

    info!("Fusion bridge running");
    trace!("Config: {:?}", cfg);

    let store = Arc::new(Store::open(&cfg.system.database_path).unwrap());
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap();

    let drivers = Drivers::new(http.clone());
    let credentials = Arc::new(CredentialStore::new(
        store.clone(),
        Arc::new(HttpTokenRefresher::new(http)),
    ));

    let submitter = EventSubmitter::new(cfg.system.event_queue_capacity);
    let arming = Arc::new(ArmingService::new(store.clone(), submitter.clone()));
    let sink = Arc::new(LiveActionSink::new(
        drivers,
        credentials.clone(),
        arming.clone(),
        cfg.push.clone(),
    ));
    let engine = Arc::new(AutomationEngine::new(
        store.clone(),
        sink,
        cfg.system.org_execution_cap,
    ));
    let events = EventPipeline::new(store.clone(), engine.clone(), arming.clone(), submitter.clone());

    // Long-lived daemons: pipeline consumer, scheduled-automation tick,
    // area-arming tick.
    tokio::spawn(events.run());
    tokio::spawn(engine.run_scheduled_daemon());
    tokio::spawn(Arc::new(ArmingScheduler::new(arming, store.clone())).run());

    // Bring up a session for every enabled connector.
    let sessions = Arc::new(SessionManager::new(store, credentials, submitter));
    sessions.initialize_all().await.unwrap();

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown requested; draining sessions");
    sessions.shutdown().await;
}
