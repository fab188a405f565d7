//! `esta-cli` – ESTA operator console
//!
//! This binary boots an ESTA kernel on the operator's machine.  It:
//!
//! 1. Checks for `~/.esta/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent.
//! 2. Boots the kernel with the configured trusted key, authority table and
//!    fairness floors, and attaches the clock driver.
//! 3. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/admit`, `/run`, `/ps`, `/caps`, `/audit`, `/help`).
//! 4. Intercepts **Ctrl-C** to shut the kernel down and exit safely.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use esta_kernel::SystemClock;
use esta_runtime::{ClockDriver, Kernel, init_tracing};

fn main() {
    // RUST_LOG filters, ESTA_LOG_FORMAT=json switches to JSON lines and
    // OTEL_EXPORTER_OTLP_ENDPOINT enables span export.  User-facing output
    // stays on println!.
    let _telemetry = init_tracing("esta");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(c)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            c
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut c = config::Config::default();
            config::apply_env_overrides(&mut c);
            c
        }
    };

    let kernel_config = match cfg.to_kernel_config() {
        Ok(k) => k,
        Err(e) => {
            println!("{}: {}", "Cannot boot".red().bold(), e);
            println!(
                "  Set {} in {} or export {}.",
                "trusted_public_key".bold(),
                config::config_path().display(),
                "ESTA_TRUSTED_KEY".bold()
            );
            std::process::exit(1);
        }
    };

    // ── Boot ──────────────────────────────────────────────────────────────
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            std::process::exit(1);
        }
    };
    let kernel = match Kernel::boot(kernel_config) {
        Ok(k) => Arc::new(k),
        Err(e) => {
            println!("{}: {}", "Boot failed".red().bold(), e);
            std::process::exit(1);
        }
    };
    match kernel.attach_driver(Arc::new(ClockDriver::new(Arc::new(SystemClock)))) {
        Ok(pid) => info!(%pid, driver = ClockDriver::NAME, "driver attached"),
        Err(e) => warn!(error = %e, "clock driver unavailable"),
    }
    println!(
        "  Kernel booted. Trusted key {}, bundles in {}",
        cfg.key_fingerprint().bold(),
        cfg.bundle_dir.dimmed()
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let kernel_ctrlc = kernel.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the kernel down …".yellow().bold());
        match kernel_ctrlc.shutdown("operator interrupt") {
            Ok(()) => println!("{}", "  ✓ All modules stopped. Exiting ESTA.".green()),
            Err(e) => println!("{}: {}", "  Shutdown error".red(), e),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    let shell = repl::Shell {
        kernel: kernel.clone(),
        rt: &rt,
        config: &cfg,
        workers,
    };
    repl::run(&shell, shutdown);

    if !kernel.is_shutting_down() {
        match kernel.shutdown("operator quit") {
            Ok(()) => println!("{}", "Goodbye.".green()),
            Err(e) => println!("{}: {}", "Shutdown error".red(), e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        ESTA First-Run Wizard         ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up ESTA.\n");

    let mut cfg = config::Config::default();

    println!("  Modules are admitted only if signed by your trusted Ed25519 key.");
    cfg.trusted_public_key = prompt_line("  Trusted public key (64 hex chars): ", "");

    cfg.bundle_dir = prompt_line(
        &format!("  Bundle directory [{}]: ", cfg.bundle_dir),
        &cfg.bundle_dir,
    );

    let epoch = prompt_line(
        &format!("  Epoch length [{}]: ", cfg.epoch_length),
        &cfg.epoch_length.to_string(),
    );
    if let Ok(n) = epoch.trim().parse::<u32>()
        && n > 0
    {
        cfg.epoch_length = n;
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
    println!("{}", r#"   ____________________ "#.bold().cyan());
    println!("{}", r#"  / __/ __/_  __/ _  | "#.bold().cyan());
    println!("{}", r#" / _/_\ \  / / / __ | "#.bold().cyan());
    println!("{}", r#"/___/___/ /_/ /_/ |_| "#.bold().cyan());
    println!();
    println!("  {} {}",
        "ESTA".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Capability-Secured Microkernel");
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
