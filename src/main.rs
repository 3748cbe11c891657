//! CLI entrypoint for `bofhound`.
//!
//! Collects beacon log files from the given inputs, parses them into
//! attribute and session records, runs the correlation engine, prints an
//! import summary, and writes the graph JSON files to the output
//! directory.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Result, bail};
use bofhound::{engine::Engine, local, local::LocalBroker, parser, report, writer};
use clap::Parser;
use colored::Colorize;
use log::{LevelFilter, error, warn};

#[derive(Parser, Debug)]
#[command(name = "bofhound", version, about = "AD object-graph rebuilder for beacon LDAP logs")]
struct Args {
    /// Beacon log file(s) or directories to search for .log files
    #[arg(short = 'i', long = "input", required = true)]
    input: Vec<PathBuf>,

    /// Session/local-group record file(s), one JSON record per line
    #[arg(short = 's', long = "sessions")]
    sessions: Vec<PathBuf>,

    /// Directory to write the graph JSON files into
    #[arg(short = 'o', long = "output", default_value = ".")]
    output: PathBuf,

    /// Parse input log files in parallel
    #[arg(long = "parallel")]
    parallel: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress banner and summary output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

const ASCII_TITLE: &str = r#"
 ____   ___  _____ _   _  ___  _   _ _   _ ____
| __ ) / _ \|  ___| | | |/ _ \| | | | \ | |  _ \
|  _ \| | | | |_  | |_| | | | | | | |  \| | | | |
| |_) | |_| |  _| |  _  | |_| | |_| | |\  | |_| |
|____/ \___/|_|   |_| |_|\___/ \___/|_| \_|____/
"#;

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

/// Expand input arguments into an ordered list of log files: explicit
/// files as given, directories searched recursively for `.log` files
/// sorted by modification time so later captures merge over earlier ones.
fn collect_logs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut logs = Vec::new();
    for input in inputs {
        if input.is_file() {
            logs.push(input.clone());
        } else if input.is_dir() {
            let mut found = Vec::new();
            find_log_files(input, &mut found)?;
            found.sort_by_key(|p| {
                fs::metadata(p)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH)
            });
            logs.extend(found);
        } else {
            bail!("input not found: {}", input.display());
        }
    }
    if logs.is_empty() {
        bail!("no log files found in the given inputs");
    }
    Ok(logs)
}

fn find_log_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            find_log_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "log") {
            out.push(path);
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);

    let logs = match collect_logs(&args.input) {
        Ok(logs) => logs,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    let parsed = if args.parallel {
        parser::parse_files_parallel(&logs)
    } else {
        parser::parse_files(&logs)
    };
    let records = match parsed {
        Ok(records) => records,
        Err(e) => {
            error!("failed to parse inputs: {e}");
            std::process::exit(3);
        }
    };
    log::info!("parsed {} records from {} log files", records.len(), logs.len());

    let mut broker = LocalBroker::new();
    for path in &args.sessions {
        if !path.exists() {
            warn!("session file not found: {} (continuing)", path.display());
            continue;
        }
        match local::load_file(path) {
            Ok(session_records) => broker.import_records(session_records),
            Err(e) => warn!("failed to read {}: {e} (continuing)", path.display()),
        }
    }

    let mut engine = Engine::new();
    engine.import_objects(records);
    engine.process();
    if !broker.is_empty() {
        engine.process_local_objects(&mut broker);
    }

    if !args.quiet {
        println!("{}", ASCII_TITLE.bold().green());
        println!("{}", report::render_summary(&engine));
    }

    if let Err(e) = fs::create_dir_all(&args.output) {
        error!(
            "failed to create output directory {}: {e}",
            args.output.display()
        );
        std::process::exit(4);
    }
    match writer::write_all(&engine, &args.output) {
        Ok(written) => {
            if !args.quiet {
                println!("{} output files written to {}", written.len(), args.output.display());
            }
        }
        Err(e) => {
            error!("failed to write output: {e}");
            std::process::exit(5);
        }
    }
}
