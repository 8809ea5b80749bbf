use anyhow::{Context, Result};
use clap::Parser;

use ferry::cli::DaemonOpts;
use ferry::config::{load_config, ServerConfig};
use ferry::logger::build_logger;
use ferry::net_async::server;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = DaemonOpts::parse();
    let mut cfg: ServerConfig = load_config(opts.config.as_deref())?;
    if let Some(bind) = opts.bind.clone() {
        cfg.bind = bind;
    }
    if let Some(root) = opts.root.clone() {
        cfg.root = root;
    }
    if opts.journal.is_some() {
        cfg.journal = opts.journal.clone();
    }
    cfg.verify_digest |= opts.verify;
    cfg.progress |= opts.progress;

    let logger = build_logger("ferryd", opts.verbose, opts.log_file.as_deref())?;

    if cfg.root.exists() && !cfg.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", cfg.root.display());
    }

    // Security warning for 0.0.0.0 binding
    if cfg.bind.starts_with("0.0.0.0") {
        logger.info("WARNING: binding to 0.0.0.0 exposes the daemon to all network interfaces");
        logger.info("This protocol is UNENCRYPTED and UNAUTHENTICATED; only use on trusted networks");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let bind = cfg.bind.clone();
    rt.block_on(server::serve(cfg, logger))
        .with_context(|| format!("serving on {}", bind))
}
