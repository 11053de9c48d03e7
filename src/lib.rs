use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use flate2::read::MultiGzDecoder;
use log::info;

use lockdoc_core::{
    ConversionSummary, ConvertConfig, DelimitedParser,
    symbols::{NoSymbols, SymbolLookup, SymbolTable},
    tables::{Table, TableWriter},
};

/// The first two bytes of every gzip stream
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Where a conversion reads its input from and writes its output to.
#[derive(Debug, Clone)]
pub struct ConvertPaths {
    /// The trace, plain or gzip-compressed
    pub input: PathBuf,
    /// The directory the output tables are written to. It is created if needed.
    pub output_dir: PathBuf,
    /// Output of `nm` or `nm -S` for the traced kernel image
    pub symbols: Option<PathBuf>,
    /// A file listing the tracked data types, one per line
    pub data_types: Option<PathBuf>,
}

/// Opens `path` for reading and transparently decompresses it if it is a gzip file.
pub fn open_trace<P: AsRef<Path>>(path: P) -> Result<Box<dyn Read>, Error> {
    let path = path.as_ref();
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("Cannot open trace {}", path.display()))?,
    );

    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        info!("Reading gzip-compressed trace {}", path.display());
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Reads a list of data type names, one per line.
///
/// Empty lines and lines starting with `#` are skipped.
pub fn read_data_types<R: BufRead>(input: R) -> Result<Vec<String>, Error> {
    let mut types = Vec::new();

    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        types.push(line.to_string());
    }

    Ok(types)
}

fn load_symbols(path: &Path) -> Result<SymbolTable, Error> {
    let file =
        File::open(path).with_context(|| format!("Cannot open symbols {}", path.display()))?;
    let table = SymbolTable::from_nm(BufReader::new(file))?;
    info!("Loaded {} symbols from {}", table.len(), path.display());

    Ok(table)
}

/// Converts the trace at `paths.input` into the output tables in `paths.output_dir`.
///
/// Settings in `config` are kept, except that a data-type file in `paths`
/// replaces `config.data_types`.
pub fn convert_file(
    paths: &ConvertPaths,
    mut config: ConvertConfig,
) -> Result<ConversionSummary, Error> {
    if let Some(path) = &paths.data_types {
        let file = File::open(path)
            .with_context(|| format!("Cannot open data types {}", path.display()))?;
        config.data_types = Some(read_data_types(BufReader::new(file))?);
    }

    match &paths.symbols {
        Some(path) => convert_with(paths, config, load_symbols(path)?),
        None => convert_with(paths, config, NoSymbols),
    }
}

fn convert_with<L: SymbolLookup>(
    paths: &ConvertPaths,
    config: ConvertConfig,
    symbols: L,
) -> Result<ConversionSummary, Error> {
    let input = open_trace(&paths.input)?;

    std::fs::create_dir_all(&paths.output_dir).with_context(|| {
        format!(
            "Cannot create output directory {}",
            paths.output_dir.display()
        )
    })?;

    let mut tables = TableWriter::new(config.delimiter, |table: Table| {
        OpenOptions::new()
            .truncate(true)
            .write(true)
            .create(true)
            .open(paths.output_dir.join(table.file_name()))
            .map(BufWriter::new)
    })?;

    let mut parser = DelimitedParser::new(config.delimiter);
    let summary = lockdoc_core::convert(&mut parser, input, config, symbols, &mut tables)?;

    info!(
        "Wrote {} TXNs and {} accesses to {}",
        summary.txns.emitted,
        summary.accesses,
        paths.output_dir.display()
    );

    Ok(summary)
}
