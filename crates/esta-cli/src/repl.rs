//! REPL – Read-Eval-Print Loop for the ESTA operator shell.
//!
//! Supported slash-commands:
//!   /help               – show this list
//!   /status             – kernel counters
//!   /admit <name|all>   – admit signed bundles from the bundle directory
//!   /run [n]            – run `n` epochs (default 1)
//!   /ps                 – list processes
//!   /caps <pid>         – capabilities held by a process
//!   /kill <pid>         – terminate a process
//!   /audit [verify]     – tail or verify the audit chain
//!   /schema             – print the manifest JSON schema
//!   /quit | /exit       – shut the kernel down and exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use esta_runtime::{Kernel, bundle};
use esta_types::ProcessId;
use tokio::runtime::Runtime;

use crate::config::Config;

const AUDIT_TAIL: usize = 10;

/// Everything a command handler needs.
pub struct Shell<'a> {
    pub kernel: Arc<Kernel>,
    pub rt: &'a Runtime,
    pub config: &'a Config,
    pub workers: usize,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shell: &Shell<'_>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "esta>".bold().cyan());
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

        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            continue;
        };
        let arg = words.next();

        match cmd {
            "/help" => cmd_help(),
            "/status" => cmd_status(shell),
            "/admit" => cmd_admit(shell, arg),
            "/run" => cmd_run(shell, arg),
            "/ps" => cmd_ps(shell),
            "/caps" => cmd_caps(shell, arg),
            "/kill" => cmd_kill(shell, arg),
            "/audit" => cmd_audit(shell, arg),
            "/schema" => cmd_schema(),
            "/quit" | "/exit" => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            other => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "ESTA Commands".bold().underline());
    println!("  {}           – kernel counters", "/status".bold().cyan());
    println!("  {} – admit bundles from the bundle directory", "/admit <name|all>".bold().cyan());
    println!("  {}          – run n epochs (default 1)", "/run [n]".bold().cyan());
    println!("  {}               – list processes", "/ps".bold().cyan());
    println!("  {}      – capabilities held by a process", "/caps <pid>".bold().cyan());
    println!("  {}      – terminate a process", "/kill <pid>".bold().cyan());
    println!("  {}  – tail or verify the audit chain", "/audit [verify]".bold().cyan());
    println!("  {}           – manifest JSON schema", "/schema".bold().cyan());
    println!("  {}     – shut down and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(shell: &Shell<'_>) {
    let s = shell.kernel.status();
    println!("{}", "Kernel Status".bold().underline());
    println!("  version          : {}", s.version);
    println!("  epoch            : {}", s.epoch);
    println!("  modules          : {} ({} runnable)", s.modules, s.runnable);
    println!("  drivers          : {}", s.drivers);
    println!("  pending restarts : {}", s.pending_restarts);
    println!(
        "  capabilities     : {} live, {} revoked, {} delegated",
        s.capabilities.live, s.capabilities.revoked, s.capabilities.delegated
    );
    let chain = if s.audit.corrupted { "CORRUPTED".red() } else { "intact".green() };
    println!("  audit            : {} entries, chain {}", s.audit.entries, chain);
    println!("  runtimes         : {}", s.runtimes.join(", "));
}

fn cmd_admit(shell: &Shell<'_>, arg: Option<&str>) {
    let Some(target) = arg else {
        println!("{} /admit <name|all>", "Usage:".yellow());
        return;
    };
    let root = Path::new(&shell.config.bundle_dir);
    let dirs = if target == "all" {
        match bundle::discover(root) {
            Ok(d) => d,
            Err(e) => {
                println!("{}: {}", "Bundle error".red(), e);
                return;
            }
        }
    } else {
        vec![root.join(target)]
    };
    if dirs.is_empty() {
        println!("  No bundles under {}", root.display().to_string().dimmed());
        return;
    }

    let mut requests = Vec::with_capacity(dirs.len());
    for dir in &dirs {
        match bundle::load_bundle(dir) {
            Ok(req) => requests.push(req),
            Err(e) => {
                println!("{}: {}", "Bundle error".red(), e);
                return;
            }
        }
    }
    let names: Vec<String> = requests.iter().map(|r| r.manifest.name.clone()).collect();
    match shell.kernel.admit_batch(requests) {
        Ok(pids) => {
            for (name, pid) in names.iter().zip(pids) {
                println!("  {} {} as {}", "✓".green().bold(), name.bold(), pid);
            }
        }
        Err(e) => println!("{}: {}", "Admission rejected".red(), e),
    }
}

fn cmd_run(shell: &Shell<'_>, arg: Option<&str>) {
    let epochs = match arg.map(str::parse::<u32>) {
        None => 1,
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            println!("{} /run [n]  (n ≥ 1)", "Usage:".yellow());
            return;
        }
    };
    for _ in 0..epochs {
        match shell.rt.block_on(shell.kernel.run_epoch_async(shell.workers)) {
            Ok(r) => {
                println!(
                    "  epoch {} : {} slices, {} ms, per class [low {} normal {} high {} critical {}], {} driver requests",
                    r.epoch,
                    r.slices,
                    r.cpu_ms,
                    r.per_class[0],
                    r.per_class[1],
                    r.per_class[2],
                    r.per_class[3],
                    r.driver_requests
                );
                for (pid, reason) in &r.terminated {
                    println!("    {} {} terminated: {}", "✗".red(), pid, reason);
                }
                for name in &r.restarted {
                    println!("    {} {} restarted", "↻".yellow(), name);
                }
            }
            Err(e) => {
                println!("{}: {}", "Epoch failed".red(), e);
                return;
            }
        }
    }
}

fn cmd_ps(shell: &Shell<'_>) {
    let procs = shell.kernel.processes();
    if procs.is_empty() {
        println!("  No processes.");
        return;
    }
    println!(
        "  {:<8} {:<20} {:<9} {:<24} {:>10} {:>7}",
        "PID", "MODULE", "PRIORITY", "STATE", "USED ms", "SLICES"
    );
    for p in procs {
        println!(
            "  {:<8} {:<20} {:<9} {:<24} {:>10} {:>7}",
            p.pid.to_string(),
            p.module.to_string(),
            format!("{:?}", p.priority),
            format!("{:?}", p.state),
            p.runtime_used_ms,
            p.slices
        );
    }
}

fn cmd_caps(shell: &Shell<'_>, arg: Option<&str>) {
    let Some(pid) = arg.and_then(parse_pid) else {
        println!("{} /caps <pid>", "Usage:".yellow());
        return;
    };
    let caps = shell.kernel.capabilities_of(pid);
    if caps.is_empty() {
        println!("  {} holds no capabilities.", pid);
        return;
    }
    for cap in caps {
        let state = if cap.revoked { "revoked".red() } else { "live".green() };
        let origin = cap.parent.map(|p| format!(" (from {p})")).unwrap_or_default();
        println!("  {} {} {:?} [{}]{}", cap.id, cap.resource, cap.rights, state, origin.dimmed());
    }
}

fn cmd_kill(shell: &Shell<'_>, arg: Option<&str>) {
    let Some(pid) = arg.and_then(parse_pid) else {
        println!("{} /kill <pid>", "Usage:".yellow());
        return;
    };
    match shell.kernel.terminate(pid) {
        Ok(true) => println!("  {} {} terminated", "✓".green().bold(), pid),
        Ok(false) => println!("  {} is not running", pid),
        Err(e) => println!("{}: {}", "Terminate failed".red(), e),
    }
}

fn cmd_audit(shell: &Shell<'_>, arg: Option<&str>) {
    if arg == Some("verify") {
        let v = shell.kernel.verify_audit();
        if v.valid {
            println!("  {} {} entries verified", "✓".green().bold(), v.entries_checked);
        } else {
            let at = v.first_invalid.map(|s| s.to_string()).unwrap_or_else(|| "?".into());
            println!("  {} chain broken at sequence {}", "✗".red().bold(), at.bold());
        }
        return;
    }

    let log = shell.kernel.audit();
    let entries = log.export();
    for e in entries.iter().skip(entries.len().saturating_sub(AUDIT_TAIL)) {
        println!(
            "  #{:<5} {:<14} {:<10} {}",
            e.sequence,
            e.timestamp,
            e.source,
            event_name(&e.event)
        );
    }
}

fn cmd_schema() {
    match serde_json::to_string_pretty(&esta_types::manifest_schema()) {
        Ok(s) => println!("{s}"),
        Err(e) => println!("{}: {}", "Schema error".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts `3` or `pid:3`.
pub(crate) fn parse_pid(raw: &str) -> Option<ProcessId> {
    raw.strip_prefix("pid:").unwrap_or(raw).parse().ok().map(ProcessId)
}

fn event_name(event: &esta_kernel::AuditEvent) -> String {
    serde_json::to_value(event)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "?".to_string())
}
