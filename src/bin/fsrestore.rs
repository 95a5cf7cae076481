use std::{
    fs::File,
    io::{self, BufRead, BufReader, Write},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use clap::Parser;

use fsrestore::{protocol::Decoder, RestoreOptions, RestoreSession};

/// fsrestore
#[derive(Debug, Parser)]
#[clap(name = "fsrestore", version)]
pub struct App {
    /// Read the stream but don't change anything on disk
    #[clap(long, short = 'n')]
    dry_run: bool,

    /// Print each path; given twice, also the operation, uid and gid
    #[clap(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Remove this many leading components from every path in the stream
    #[clap(long, short = 's', default_value_t = 0)]
    strip: usize,

    /// Read the stream from this file instead of stdin
    #[clap(long)]
    input: Option<PathBuf>,

    /// The directory to restore into
    destination: PathBuf,
}

fn restore(args: &App, input: impl BufRead) -> Result<()> {
    let options = RestoreOptions {
        dry_run: args.dry_run,
        verbosity: args.verbose,
    };

    let mut decoder = Decoder::new(input, &args.destination).strip(args.strip);
    let mut session = RestoreSession::new(&args.destination, options);

    let mut stdout = io::stdout().lock();
    let summary = session
        .run(&mut decoder, &mut stdout)
        .with_context(|| format!("Restoring into {:?}", args.destination))?;
    stdout.flush()?;

    log::debug!(
        "{} entries, {} failed",
        summary.entries,
        summary.failures
    );
    if !summary.is_success() {
        bail!(
            "{} of {} entries could not be restored",
            summary.failures,
            summary.entries
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.input {
        Some(ref path) => {
            let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
            restore(&args, BufReader::new(file))
        }
        None => restore(&args, io::stdin().lock()),
    }
}
