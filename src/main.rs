use std::path::PathBuf;

use anyhow::{Context, Error, bail};
use clap::Parser;
use lockdoc::ConvertPaths;
use lockdoc_core::{ConvertConfig, FatalError};
use lockdoc_error::exit;
use log::{error, info, warn};

mod logging;

/// Reconstructs which locks were held during which memory accesses from a
/// trace of an instrumented kernel.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// The trace to convert (plain or gzip-compressed)
    input: PathBuf,

    /// The directory the output tables are written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// The column delimiter of the trace and the output tables
    #[arg(short, long, default_value_t = ';')]
    delimiter: char,

    /// Also write transactions without any memory access
    #[arg(long)]
    keep_empty_txns: bool,

    /// A prefix to strip from the source file paths of the trace
    #[arg(long)]
    kernel_dir: Option<String>,

    /// Output of `nm -S` for the traced kernel, used to name static locks
    #[arg(long)]
    symbols: Option<PathBuf>,

    /// A file listing the data types to track, one per line
    #[arg(long)]
    data_types: Option<PathBuf>,

    /// Write a JSON summary of the conversion to this file
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Write all warnings and errors to this file
    #[arg(long)]
    error_log: Option<PathBuf>,

    /// Log more (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() {
    let args = Cli::parse();

    if let Err(err) = logging::init(
        logging::console_level(args.verbose, args.quiet),
        args.error_log.as_deref(),
    ) {
        eprintln!("error: Cannot set up logging: {err:#}");
        std::process::exit(exit::FAILURE);
    }

    std::process::exit(match run(args) {
        Ok(()) => exit::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<FatalError>()
                .map_or(exit::FAILURE, FatalError::exit_code);
            error!("{err:#}");
            eprintln!("error: {err:#}");
            info!("Exiting with {code}: {}", lockdoc_error::exit_description(code));
            code
        }
    })
}

fn run(args: Cli) -> Result<(), Error> {
    if args.delimiter == '\n' || args.delimiter == '\r' {
        bail!("The delimiter cannot be a line break");
    }

    let config = ConvertConfig {
        skip_empty_txns: !args.keep_empty_txns,
        delimiter: args.delimiter,
        kernel_dir: args.kernel_dir,
        data_types: None,
    };
    let paths = ConvertPaths {
        input: args.input,
        output_dir: args.output,
        symbols: args.symbols,
        data_types: args.data_types,
    };

    let summary = lockdoc::convert_file(&paths, config)?;

    let inconsistencies = summary.inconsistency_count();
    if inconsistencies > 0 {
        warn!("The trace contained {inconsistencies} inconsistencies");
        for (kind, count) in &summary.inconsistencies {
            warn!("  {kind}: {count}");
        }
    }

    if let Some(path) = args.summary {
        std::fs::write(&path, summary.to_json()?)
            .with_context(|| format!("Cannot write summary {}", path.display()))?;
    }

    Ok(())
}
