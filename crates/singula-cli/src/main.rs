//! `singula-cli` – operator host for a singulation cell
//!
//! This binary is the entry point for running the stack on the simulated
//! bus.  It:
//!
//! 1. Initialises tracing (`RUST_LOG`, `SINGULA_LOG_FORMAT`, optional OTLP).
//! 2. Loads `~/.singula/config.toml`, writing the defaults on first run.
//! 3. Opens a [`SingulationSession`] and prints machine state changes.
//! 4. Intercepts **Ctrl-C** to request an emergency stop and exit safely.
//! 5. Drops the operator into an interactive REPL.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use singula_hal::{BusAdapter, DriveRegistry, SimBus};
use singula_middleware::Topic;
use singula_runtime::SingulationSession;
use singula_types::{EventPayload, SafetyTriggerKind, SystemState};

fn main() {
    let _telemetry = singula_runtime::init_tracing("singula");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&config::Config::default()) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the tokio runtime");
            std::process::exit(1);
        }
    };

    let bus: Arc<dyn BusAdapter> = Arc::new(SimBus::new(cfg.session.sim_axes));
    let opened = rt.block_on(SingulationSession::open(
        cfg.session_config(),
        bus,
        DriveRegistry::with_builtin(),
        None,
    ));
    let session = match opened {
        Ok(session) => session,
        Err(e) => {
            println!("{}: {}", "Failed to open session".red(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  Session open: {} axes on vendor {} ({:?} mode)",
        session.controller().axis_count().to_string().bold(),
        cfg.session.vendor.bold(),
        cfg.session.control_mode
    );

    // ── State change printer ──────────────────────────────────────────────
    let mut safety_events = session.events().subscribe_to(Topic::Safety);
    rt.spawn(async move {
        while let Ok(event) = safety_events.recv().await {
            if let EventPayload::SystemStateChanged { from, to } = event.payload {
                let to_label = format!("{to:?}");
                let to_label = match to {
                    SystemState::Running => to_label.green(),
                    SystemState::Alarm => to_label.red().bold(),
                    _ => to_label.yellow(),
                };
                println!("\n  {} {:?} → {}", "machine".dimmed(), from, to_label);
            }
        }
    });

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let pipeline = Arc::clone(session.pipeline());
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – emergency stop …".yellow().bold());
        pipeline.request_stop(SafetyTriggerKind::EmergencyStop, "operator Ctrl-C", false);
        println!("{}", "  ✓ Emergency stop requested. Press Enter to exit.".green());
        shutdown_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not stop the axes");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&session, &rt, shutdown);

    if let Err(e) = rt.block_on(session.shutdown()) {
        println!("{}: {}", "Shutdown error".red(), e);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _____ _                   __     "#.bold().cyan());
    println!("{}", r#"  / ___/(_)___  ____ ___  __/ /___ _"#.bold().cyan());
    println!("{}", r#"  \__ \/ / __ \/ __ `/ / / / / __ `/"#.bold().cyan());
    println!("{}", r#" ___/ / / / / / /_/ / /_/ / / /_/ / "#.bold().cyan());
    println!("{}", r#"/____/_/_/ /_/\__, /\__,_/_/\__,_/  "#.bold().cyan());
    println!("{}", r#"             /____/                 "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Singula".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Parcel singulation axis control");
    println!();
}
