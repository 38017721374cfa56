use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use config::{CONFIG, CONFIG_PATH};
use log::{debug, error, info};
use modect::MotionDetector;
use person::{HogPersonDetector, NoPersonDetector, PersonDetect};
use pipeline::Pipeline;
use storage::{ConfigRegistry, FileEventLog, FileLastFrameStore};

mod config;
mod event;
mod frame;
mod modect;
mod person;
mod pipeline;
mod pushover;
mod storage;
mod web;

lazy_static::lazy_static! {
    static ref ARGS: Args = Args::parse();
}

/// Camera frame intake with motion and person detection
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Validates the config file (and person model, if any) and exits
    #[clap(long)]
    check_config: bool,
}

fn person_detector() -> anyhow::Result<Arc<dyn PersonDetect>> {
    Ok(match &CONFIG.person {
        Some(config) => Arc::new(
            HogPersonDetector::load(config)
                .with_context(|| format!("loading person model {}", config.model.display()))?,
        ),
        None => {
            info!("no person model configured, events are classified as motion only");
            Arc::new(NoPersonDetector)
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lazy_static::initialize(&ARGS);

    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let config = config::Config::load(&CONFIG_PATH)
        .with_context(|| format!("loading {}", CONFIG_PATH.display()))?;
    let person = person_detector()?;
    if ARGS.check_config {
        info!(
            "{} ok: {} devices ({} active)",
            CONFIG_PATH.display(),
            config.devices.len(),
            config.devices.values().filter(|x| x.active).count()
        );
        return Ok(());
    }
    drop(config);

    if let Some(prometheus_bind) = CONFIG.prometheus_bind {
        prometheus_exporter::start(prometheus_bind).context("failed to load prometheus_exporter")?;
    }

    let last_frames = Arc::new(FileLastFrameStore::open(
        &CONFIG.live_dir,
        CONFIG.snapshot.live_quality,
    )?);
    let events = Arc::new(FileEventLog::open(
        &CONFIG.event_dir,
        CONFIG.snapshot.event_quality,
    )?);
    let pipeline = Arc::new(Pipeline::new(
        MotionDetector::new(CONFIG.motion.clone()),
        person,
        Arc::new(ConfigRegistry::new(&CONFIG.devices)),
        last_frames.clone(),
        events.clone(),
    ));

    let sweep = pipeline.clone();
    tokio::spawn(async move {
        let ttl = sweep.motion().config().idle_timeout();
        let mut interval = tokio::time::interval((ttl / 2).max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            let evicted = sweep.motion().evict_idle(ttl);
            if evicted > 0 {
                debug!(
                    "evicted {evicted} idle streams, {} tracked",
                    sweep.motion().stream_count()
                );
            }
        }
    });

    let state = Arc::new(web::AppState {
        pipeline,
        last_frames,
        events,
    });
    loop {
        let server = axum::Server::bind(&CONFIG.web_bind);
        info!("listening @ {}", CONFIG.web_bind);
        if let Err(e) = server
            .serve(web::route(state.clone()).into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            error!("failed to start api server: {:?}", e);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
