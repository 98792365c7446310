mod adapters;
mod codec;
mod config;
mod controller;
mod db;
mod engine;
mod events;
mod mqtt;
mod options;
mod program;
mod queue;
mod scheduler;
mod sensor;
mod state;
mod station;
mod valve;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use adapters::HttpDispatcher;
use controller::{local_time, Controller, TickOutcome};
use db::{Db, RunRecord};
use options::Options;
use state::SystemState;
use station::STATIONS_PER_BOARD;
use valve::ValveBoard;

/// Commands buffered between the web API and the control loop.
const COMMAND_QUEUE: usize = 32;
const FLOW_POLL: Duration = Duration::from_millis(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:sprinkler.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed options, stations, programs) ─────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // The store is the source of truth from here on.
    let options = db.load_options(&Options::default()).await?;
    let stations = db.load_stations().await?;
    let programs = db.load_programs().await?;
    if programs.is_empty() {
        warn!("no programs configured; only manual runs will water");
    }
    info!(
        boards = options.boards,
        stations = stations.len(),
        programs = programs.len(),
        "store loaded"
    );

    // ── Controller ──────────────────────────────────────────────────
    let board = ValveBoard::new(options.station_count() / STATIONS_PER_BOARD)?;
    let net = HttpDispatcher::new()?;
    let mut controller = Controller::new(options, stations, programs, board, net);

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(controller.snapshot())));
    {
        let mut st = shared.write().await;
        st.record_system("controller started".to_string());
    }

    // ── Web server ──────────────────────────────────────────────────
    let (command_tx, mut command_rx) = mpsc::channel(COMMAND_QUEUE);
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        commands: command_tx,
        db: db.clone(),
    };
    tokio::spawn(async move {
        web::serve(web_state).await;
    });

    // ── MQTT (publish only) ─────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("sprinkler-controller", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    let mqtt_state = Arc::clone(&shared);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    let mut st = mqtt_state.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                    info!("mqtt disconnected");
                    let mut st = mqtt_state.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. reconnecting...");
                    let mut st = mqtt_state.write().await;
                    if st.mqtt_connected {
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    st.mqtt_connected = false;
                    drop(st);

                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // ── Control loop ────────────────────────────────────────────────
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flow_ticker = interval(FLOW_POLL);
    flow_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let flow_enabled = controller.options().flow_sensor_enabled();

    info!(flow_enabled, "control loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = local_time(
                    OffsetDateTime::now_utc().unix_timestamp(),
                    controller.options().utc_offset_minutes,
                );

                while let Ok(command) = command_rx.try_recv() {
                    controller.handle_command(command, now);
                }
                let outcome = controller.tick(now);
                let events = controller.drain_events();

                // ── Sinks ───────────────────────────────────────
                for event in &events {
                    debug!(?event, "event");
                    if let Some(run) = RunRecord::from_event(event) {
                        if let Err(e) = db.insert_run(&run).await {
                            warn!("db: run log write failed: {e:#}");
                        }
                    }
                }
                let opts = controller.options();
                mqtt::publish_events(&client, &opts.mqtt_topic_prefix, opts.notify_mask, &events);

                if controller.take_options_dirty() {
                    if let Err(e) = db.save_runtime_options(controller.options()).await {
                        warn!("db: saving options failed, keeping in-memory values: {e:#}");
                    }
                }

                {
                    let mut st = shared.write().await;
                    st.controller = controller.snapshot();
                    for event in &events {
                        st.record_event(event);
                    }
                }

                if let TickOutcome::Reboot(cause) = outcome {
                    controller.reset_all_stations_immediate(now);
                    info!(?cause, "exiting for reboot");
                    return Ok(());
                }
            }
            _ = flow_ticker.tick(), if flow_enabled => {
                controller.poll_flow();
            }
        }
    }
}
