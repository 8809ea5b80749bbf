//! Shared CLI helpers and small reusable Clap fragments

use crate::logger::Logger;
use crate::url::{parse_server_addr, RemoteDest};
use anyhow::{bail, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Receiver daemon options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ferry receiver: stores pushed files under a storage root")]
pub struct DaemonOpts {
    /// Bind address (host:port) [default: 127.0.0.1:3254]
    #[arg(long)]
    pub bind: Option<String>,

    /// Storage root [default: server]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append key=value event lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// JSON-lines record of every connection
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Re-hash received payloads and discard mismatches
    #[arg(long)]
    pub verify: bool,

    /// Show a progress bar per transfer
    #[arg(long)]
    pub progress: bool,

    /// Debug output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Sender options; anything missing is asked for interactively
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ferry sender: pushes one file to a ferry daemon")]
pub struct ClientOpts {
    /// Server address (host, host:port or ferry://host:port)
    #[arg(long, short)]
    pub server: Option<String>,

    /// File name under the client storage root
    #[arg(long, short)]
    pub file: Option<String>,

    /// Client storage root [default: client]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append key=value event lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Give up after this many connection attempts (default: retry forever)
    #[arg(long = "max-attempts")]
    pub max_attempts: Option<u32>,

    /// Hide the progress bar
    #[arg(long = "no-progress")]
    pub no_progress: bool,

    /// Debug output
    #[arg(short, long)]
    pub verbose: bool,
}

fn prompt_line<R: BufRead, W: Write>(input: &mut R, output: &mut W, prompt: &str) -> Result<String> {
    write!(output, "{}", prompt)?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("input closed");
    }
    Ok(line.trim().to_string())
}

/// Ask for a server address until one parses
pub fn prompt_server<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    default_port: u16,
    logger: &dyn Logger,
) -> Result<RemoteDest> {
    loop {
        let line = prompt_line(input, output, "Server address: ")?;
        match parse_server_addr(&line, default_port) {
            Some(dest) => return Ok(dest),
            None => logger.error("input", &format!("{:?} is not a valid server address", line)),
        }
    }
}

/// Ask for a file name until it names an existing file under `root`
pub fn prompt_file<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    root: &Path,
    logger: &dyn Logger,
) -> Result<PathBuf> {
    loop {
        let name = prompt_line(input, output, "File to transfer: ")?;
        if let Some(path) = resolve_file(root, &name) {
            return Ok(path);
        }
        logger.error(
            "input",
            &format!("{} doesn't exist in the {} directory", name, root.display()),
        );
    }
}

/// `root/name` if that is an existing regular file
pub fn resolve_file(root: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let path = root.join(name);
    path.is_file().then_some(path)
}
