//! EPC MME daemon
//!
//! Wires the EMM attach control plane to its runtime: a central event
//! queue consumed by worker threads, a timer thread feeding expiries back
//! onto the queue, and the collaborator seams towards the access stratum
//! and session management. Uplink NAS ingestion is owned by the S1AP task
//! and enters through the queue.

use anyhow::Result;
use clap::Parser;
use epc_mmed::config::MmeConfig;
use epc_mmed::emm_sap::{AsMessageSink, EmmAsPrimitive};
use epc_mmed::esm_sap::ScriptedEsm;
use epc_mmed::event::{process_event, MmeEvent};
use epc_mmed::mme_api::MmeRuntime;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// EPC MME - EPS Mobility Management Entity
#[derive(Parser, Debug)]
#[command(name = "epc-mmed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC Mobility Management Entity")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/epc/mme.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Number of worker threads
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

/// Downlink sink handing EMMAS primitives to the S1AP task
#[derive(Debug, Default)]
struct S1apDownlinkSink;

impl AsMessageSink for S1apDownlinkSink {
    fn deliver(&self, primitive: EmmAsPrimitive) {
        match &primitive {
            EmmAsPrimitive::SecurityReq(req) => {
                log::info!("ue_id={} downlink NAS request {:?}", req.ue_id, req.request)
            }
            EmmAsPrimitive::EstablishCnf(cnf) => {
                log::info!("ue_id={} downlink ATTACH ACCEPT guti={}", cnf.ue_id, cnf.guti)
            }
            EmmAsPrimitive::EstablishRej(rej) => {
                log::info!(
                    "ue_id={} downlink ATTACH REJECT cause={:?}",
                    rej.ue_id,
                    rej.cause
                )
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    log::info!("EPC MME v{}", env!("CARGO_PKG_VERSION"));

    let config_path = Path::new(&args.config);
    let config = if config_path.exists() {
        MmeConfig::load(config_path)?
    } else {
        log::warn!("configuration {} not found, using defaults", args.config);
        MmeConfig::default()
    };

    let rt = Arc::new(MmeRuntime::new(
        config,
        Arc::new(S1apDownlinkSink),
        Arc::new(ScriptedEsm::new()),
    ));

    let (tx, rx) = mpsc::channel::<MmeEvent>();
    let rx = Arc::new(Mutex::new(rx));
    let running = Arc::new(AtomicBool::new(true));

    {
        let tx = tx.clone();
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            log::info!("received shutdown signal");
            running.store(false, Ordering::SeqCst);
            let _ = tx.send(MmeEvent::Shutdown);
        })?;
    }

    // Timer thread: drains expired timers onto the queue.
    let timer_thread = {
        let rt = Arc::clone(&rt);
        let tx = tx.clone();
        let running = Arc::clone(&running);
        std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                let now = Instant::now();
                for expiry in rt.timers.drain_expired(now) {
                    let _ = tx.send(MmeEvent::Timer(expiry));
                }
                let sleep = rt
                    .timers
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or(Duration::from_millis(100))
                    .min(Duration::from_millis(100));
                std::thread::sleep(sleep);
            }
        })
    };

    // Worker threads: pop events off the shared queue and run them through
    // the dispatcher.
    let workers: Vec<_> = (0..args.workers.max(1))
        .map(|n| {
            let rt = Arc::clone(&rt);
            let rx = Arc::clone(&rx);
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("emm-worker-{n}"))
                .spawn(move || loop {
                    let event = { rx.lock().unwrap().recv() };
                    match event {
                        Ok(MmeEvent::Shutdown) => {
                            // Wake the next worker, then exit.
                            let _ = tx.send(MmeEvent::Shutdown);
                            break;
                        }
                        Err(_) => break,
                        Ok(event) => process_event(&rt, event),
                    }
                })
                .expect("spawn worker")
        })
        .collect();

    log::info!("MME running with {} workers", args.workers.max(1));

    for worker in workers {
        let _ = worker.join();
    }
    running.store(false, Ordering::SeqCst);
    let _ = timer_thread.join();

    log::info!("EPC MME terminated");
    Ok(())
}
