//! REPL – Read-Eval-Print Loop for the gateway control shell.
//!
//! Supported slash-commands:
//!   /help              – show this list
//!   /start             – start the pipeline
//!   /stop              – stop the pipeline
//!   /attack <mode>     – set the attack mode (none, dos, flip, heart)
//!   /status            – pipeline status snapshot
//!   /telemetry [n]     – last n telemetry records (default 10)
//!   /quit | /exit      – stop the pipeline and exit

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use aegis_middleware::MemorySink;
use aegis_runtime::PipelineSupervisor;
use aegis_types::{AttackMode, EventPayload, TelemetryRecord};
use colored::Colorize;
use tokio::runtime::Handle;

const DEFAULT_TELEMETRY_ROWS: usize = 10;

/// One parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Start,
    Stop,
    Attack(AttackMode),
    Status,
    Telemetry(usize),
    Quit,
}

/// Parse one input line. Errors carry a message for the user.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments for {cmd}"));
    }

    match (cmd, arg) {
        ("/help", None) => Ok(Command::Help),
        ("/start", None) => Ok(Command::Start),
        ("/stop", None) => Ok(Command::Stop),
        ("/attack", Some(mode)) => mode
            .parse::<AttackMode>()
            .map(Command::Attack)
            .map_err(|e| e.to_string()),
        ("/attack", None) => Err("usage: /attack <none|dos|flip|heart>".to_string()),
        ("/status", None) => Ok(Command::Status),
        ("/telemetry", None) => Ok(Command::Telemetry(DEFAULT_TELEMETRY_ROWS)),
        ("/telemetry", Some(n)) => n
            .parse::<usize>()
            .map(Command::Telemetry)
            .map_err(|_| format!("'{n}' is not a record count")),
        ("/quit" | "/exit", None) => Ok(Command::Quit),
        _ => Err(format!("unknown command '{line}'")),
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits. The
/// pipeline is stopped on the way out.
pub fn run(
    pipeline: Arc<PipelineSupervisor>,
    telemetry: Arc<MemorySink>,
    runtime: Handle,
    shutdown: Arc<AtomicBool>,
) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "aegiscan>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Start) => cmd_start(&pipeline, &runtime),
            Ok(Command::Stop) => cmd_stop(&pipeline, &runtime),
            Ok(Command::Attack(mode)) => cmd_attack(&pipeline, &runtime, mode),
            Ok(Command::Status) => cmd_status(&pipeline, &runtime),
            Ok(Command::Telemetry(n)) => cmd_telemetry(&telemetry, n),
            Ok(Command::Quit) => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg.yellow(),
                "/help".bold()
            ),
        }
    }

    cmd_stop(&pipeline, &runtime);
    println!("{}", "Goodbye.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "aegiscan Commands".bold().underline());
    println!("  {}            – start the pipeline", "/start".bold().cyan());
    println!("  {}             – stop the pipeline", "/stop".bold().cyan());
    println!("  {}   – none | dos | flip | heart", "/attack <mode>".bold().cyan());
    println!("  {}           – pipeline status", "/status".bold().cyan());
    println!("  {}    – last n telemetry records", "/telemetry [n]".bold().cyan());
    println!("  {}      – stop and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_start(pipeline: &PipelineSupervisor, runtime: &Handle) {
    match runtime.block_on(pipeline.start()) {
        Ok(()) => println!(
            "  {} Gateway is {}.",
            "✓".green().bold(),
            "RUNNING".green().bold()
        ),
        Err(e) => println!("  {} {}", "Start failed:".red(), e),
    }
}

fn cmd_stop(pipeline: &PipelineSupervisor, runtime: &Handle) {
    if !runtime.block_on(pipeline.is_running()) {
        return;
    }
    match runtime.block_on(pipeline.stop()) {
        Ok(()) => println!("  {} Gateway stopped.", "✓".green().bold()),
        Err(e) => println!("  {} {}", "Stop reported failures:".yellow(), e),
    }
}

fn cmd_attack(pipeline: &PipelineSupervisor, runtime: &Handle, mode: AttackMode) {
    // Fault tasks are spawned onto the runtime.
    let _guard = runtime.enter();
    pipeline.set_attack_mode(mode);
    if mode == AttackMode::None {
        println!("  {} Attack mode cleared.", "✓".green().bold());
    } else {
        println!("  {} Attack mode {}.", "⚠".yellow().bold(), mode.to_string().red().bold());
    }
}

fn cmd_status(pipeline: &PipelineSupervisor, runtime: &Handle) {
    let status = runtime.block_on(pipeline.status());
    let state = if status.running {
        "RUNNING".green().bold()
    } else {
        "STOPPED".yellow().bold()
    };

    println!("{}", "Gateway Status".bold().underline());
    println!("  State          : {}", state);
    println!("  Attack mode    : {}", status.attack_mode.to_string().yellow());
    println!("  Queue depth    : {}", status.queue_depth);
    println!("  Frames sent    : {}", status.frames_sent);
    println!("  Producer drops : {}", status.producer_drops);
    if let Some(m) = status.metrics {
        println!(
            "  Host           : cpu {:.1}% · ram {:.1}% · disk {:.1}% · {} live tasks",
            m.cpu_percent, m.ram_percent, m.disk_percent, m.live_tasks
        );
    }

    let mut tasks: Vec<_> = status.tasks.into_iter().collect();
    tasks.sort();
    for (name, alive) in tasks {
        let marker = if alive { "🟢" } else { "🔴" };
        println!("    {} {}", marker, name);
    }
}

fn cmd_telemetry(sink: &MemorySink, n: usize) {
    let records = sink.latest(n);
    if records.is_empty() {
        println!("  {}", "No telemetry yet.".dimmed());
        return;
    }
    for record in &records {
        println!("  {}", summarize(record));
    }
}

/// One-line rendering of a telemetry record.
fn summarize(record: &TelemetryRecord) -> String {
    let time = record.event.timestamp.format("%H:%M:%S%.3f");
    match &record.event.payload {
        EventPayload::FrameSent(t) => format!(
            "{time} {:<7} angle={:>5} latency={}us depth={} delay={}us",
            record.kind, t.angle, t.latency_us, t.queue_depth, t.injected_delay_us
        ),
        EventPayload::Attack(a) => format!(
            "{time} {:<7} {:?} severity={:?} #{} {}",
            record.kind, a.kind, a.severity, a.event_count, a.description
        ),
        other => format!(
            "{time} {:<7} {}",
            record.kind,
            serde_json::to_string(other).unwrap_or_default()
        ),
    }
}
