//! ferry - push one file to a ferry daemon
//!
//! Prompts for whatever the command line leaves out, connects with retry
//! and reports the receiver's verdict through the exit status.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::time::Duration;

use ferry::cli::{prompt_file, prompt_server, resolve_file, ClientOpts};
use ferry::config::{load_config, ClientConfig};
use ferry::logger::build_logger;
use ferry::net_async::client;
use ferry::protocol::timeouts::BOOTSTRAP_WAIT_MS;
use ferry::protocol_core::ensure_dir_exists;
use ferry::url::parse_server_addr;
use ferry::TransferOutcome;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // Exit immediately with 130 (128 + SIGINT)
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = ClientOpts::parse();
    let mut cfg: ClientConfig = load_config(opts.config.as_deref())?;
    if let Some(root) = opts.root.clone() {
        cfg.root = root;
    }
    if opts.max_attempts.is_some() {
        cfg.max_connect_attempts = opts.max_attempts;
    }
    if opts.no_progress {
        cfg.progress = false;
    }
    let logger = build_logger("ferry", opts.verbose, opts.log_file.as_deref())?;

    if ensure_dir_exists(&cfg.root)? {
        logger.info(&format!("A directory \"{}\" was created", cfg.root.display()));
        logger.info(&format!("Please supply the file to the \"{}\" directory", cfg.root.display()));
        std::thread::sleep(Duration::from_millis(BOOTSTRAP_WAIT_MS));
    }

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();

    let remote = match opts.server.as_deref() {
        Some(s) => parse_server_addr(s, cfg.port).ok_or_else(|| anyhow!("invalid server address: {}", s))?,
        None => prompt_server(&mut input, &mut output, cfg.port, logger.as_ref())?,
    };

    // Pick the file before connecting so the daemon never waits on a prompt
    let path = match opts.file.as_deref() {
        Some(name) => resolve_file(&cfg.root, name).ok_or_else(|| {
            anyhow!("{} doesn't exist in the {} directory", name, cfg.root.display())
        })?,
        None => prompt_file(&mut input, &mut output, &cfg.root, logger.as_ref())?,
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let report = rt
        .block_on(client::push(&remote.host, remote.port, &path, &cfg, logger.as_ref()))
        .with_context(|| format!("sending {} to {}:{}", path.display(), remote.host, remote.port))?;

    match report.outcome {
        TransferOutcome::Completed | TransferOutcome::Skipped => Ok(()),
        TransferOutcome::Truncated => bail!(
            "receiver got {} of {} bytes of {}",
            report.bytes,
            report.request.size,
            path.display()
        ),
    }
}
