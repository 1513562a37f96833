//! `aegis-cli` – aegiscan Command Line Interface
//!
//! The operator console for the sensor-to-bus gateway. It:
//!
//! 1. Checks for `~/.aegiscan/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Builds the pipeline on a virtual CAN bus with an in-memory telemetry
//!    buffer.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/start`, `/stop`, `/attack`, `/status`, `/telemetry`, `/help`).
//! 4. Intercepts **Ctrl-C** to stop the pipeline gracefully and exit.

mod config;
mod repl;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use aegis_hal::{CanBus, VirtualCanBus};
use aegis_middleware::{MemorySink, TelemetrySink};
use aegis_runtime::PipelineSupervisor;
use colored::Colorize;
use tracing::{error, warn};

fn main() {
    // Hold the guard for the whole process so OTLP spans are flushed on exit.
    // AEGIS_LOG_FORMAT=json switches the console to JSON; AEGIS_LOG_DIR adds
    // rotated log files. The CLI's user-facing output still uses println!.
    let _tracing = aegis_runtime::init_tracing("aegiscan");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Runtime ───────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("aegis-worker")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build Tokio runtime");
            std::process::exit(1);
        }
    };

    // ── Pipeline ──────────────────────────────────────────────────────────
    let telemetry = Arc::new(MemorySink::new(cfg.telemetry_capacity));
    let can: Arc<dyn CanBus> = Arc::new(VirtualCanBus::new(cfg.can_channel.clone()));
    let pipeline = match PipelineSupervisor::new(
        cfg.to_pipeline_config(),
        can,
        Arc::clone(&telemetry) as Arc<dyn TelemetrySink>,
    ) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            println!("{}: {}", "Invalid configuration".red(), e);
            std::process::exit(2);
        }
    };

    println!(
        "  CAN interface {} · tick {} ms · channel capacity {}",
        cfg.can_channel.bold(),
        cfg.tick_ms,
        cfg.channel_capacity
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let pipeline = Arc::clone(&pipeline);
        let handle = runtime.handle().clone();
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!(
                "{}",
                "⚠  Ctrl-C received – stopping the gateway …".yellow().bold()
            );
            shutdown.store(true, Ordering::SeqCst);
            if let Err(e) = handle.block_on(pipeline.stop()) {
                println!("  {} {}", "Stop reported failures:".yellow(), e);
            }
            println!("{}", "  ✓ Exiting aegiscan.".green());
            std::process::exit(0);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
        }
    }

    println!();
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(pipeline, telemetry, runtime.handle().clone(), shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      aegiscan First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up the gateway.\n");

    let mut cfg = config::Config::default();

    cfg.can_channel = prompt_line(
        &format!("  CAN interface [{}]: ", cfg.can_channel),
        &cfg.can_channel,
    );

    let tick = prompt_line(
        &format!("  Sample tick in ms [{}]: ", cfg.tick_ms),
        &cfg.tick_ms.to_string(),
    );
    match tick.parse::<u64>() {
        Ok(ms) if ms > 0 => cfg.tick_ms = ms,
        _ => println!("  {} keeping {} ms", "Invalid tick:".yellow(), cfg.tick_ms),
    }

    let capacity = prompt_line(
        &format!("  Channel capacity [{}]: ", cfg.channel_capacity),
        &cfg.channel_capacity.to_string(),
    );
    match capacity.parse::<usize>() {
        Ok(c) if c > 0 => cfg.channel_capacity = c,
        _ => println!(
            "  {} keeping {}",
            "Invalid capacity:".yellow(),
            cfg.channel_capacity
        ),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___              _                   "#.bold().cyan());
    println!("{}", r#"  / _ |___ ___ ___ (_)__ ________ ____  "#.bold().cyan());
    println!("{}", r#" / __ / -_) _ `/ _ `/ (_-</ __/ _ `/ _ \ "#.bold().cyan());
    println!("{}", r#"/_/ |_\__/\_, /\_, /_/___/\__/\_,_/_//_/ "#.bold().cyan());
    println!("{}", r#"         /___//___/                      "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "aegiscan".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  BLE → CAN gateway simulator");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
