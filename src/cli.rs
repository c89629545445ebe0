//! Command-line façade (§6). Wires [`clap`] subcommands onto the library's
//! `repack`/`index_builder`/`retrieve` operations and maps `gzipi::Error`
//! onto the exit codes the operations section of the spec defines.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::codec::{self, CodecKind};
use crate::error::Error;
use crate::index_builder;
use crate::key::KeyFormat;
use crate::opener::{LocalOpener, Opener, TempOutput};
use crate::repack::{self, RepackOptions};
use crate::retrieve::{self, Index};

#[derive(Parser)]
#[command(name = "gzipi", version, about = "Random-like access to line-oriented records in block-compressed gzip/zstd archives")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Repack an input record stream into a compressed archive and index.
    Repack {
        #[arg(short = 'f', long = "input-file")]
        input_file: PathBuf,
        #[arg(short = 'o', long = "output-file")]
        output_file: PathBuf,
        #[arg(short = 'i', long = "index-file")]
        index_file: PathBuf,
        #[command(flatten)]
        key: KeyFormatArgs,
        #[arg(long, default_value = "gzip")]
        codec: String,
        #[arg(long)]
        level: Option<i32>,
        #[arg(long = "member-records", default_value_t = repack::DEFAULT_MEMBER_RECORD_COUNT)]
        member_records: usize,
        /// Abort on the first record whose key cannot be extracted, instead
        /// of skipping and counting it.
        #[arg(long)]
        strict: bool,
    },
    /// Build (or rebuild) the index for an already-chunked archive.
    Index {
        #[arg(short = 'f', long = "input-file")]
        input_file: PathBuf,
        #[arg(short = 'i', long = "index-file")]
        index_file: PathBuf,
        #[command(flatten)]
        key: KeyFormatArgs,
        #[arg(long, default_value = "gzip")]
        codec: String,
        #[arg(long)]
        level: Option<i32>,
        #[arg(long)]
        strict: bool,
    },
    /// Retrieve one or more records by key.
    Retrieve {
        #[arg(short = 'f', long = "input-file")]
        input_file: PathBuf,
        #[arg(short = 'i', long = "index-file")]
        index_file: PathBuf,
        #[arg(short = 'o', long = "output-file")]
        output_file: Option<PathBuf>,
        #[arg(short = 'k', long = "keys-file")]
        keys_file: Option<PathBuf>,
        #[arg(long = "key")]
        keys: Vec<String>,
        #[command(flatten)]
        key_format: KeyFormatArgs,
        #[arg(long, default_value = "gzip")]
        codec: String,
    },
    /// Check whether a single key is present, printing its record if so.
    Search {
        #[arg(short = 'f', long = "input-file")]
        input_file: PathBuf,
        #[arg(short = 'i', long = "index-file")]
        index_file: PathBuf,
        #[arg(long = "key")]
        key: String,
        #[command(flatten)]
        key_format: KeyFormatArgs,
        #[arg(long, default_value = "gzip")]
        codec: String,
    },
    /// Diagnostic: scan an archive's frames and cross-check them against its index.
    Verify {
        #[arg(short = 'f', long = "input-file")]
        input_file: PathBuf,
        #[arg(short = 'i', long = "index-file")]
        index_file: PathBuf,
        #[arg(long, default_value = "gzip")]
        codec: String,
    },
}

#[derive(Args)]
pub struct KeyFormatArgs {
    /// Record format: json, csv, or raw (whole line is the key).
    #[arg(long, default_value = "raw")]
    format: String,
    #[arg(long)]
    field: Option<String>,
    #[arg(long)]
    column: Option<usize>,
    #[arg(long, default_value = ",")]
    delimiter: String,
}

impl KeyFormatArgs {
    fn resolve(&self) -> Result<KeyFormat, Error> {
        match self.format.as_str() {
            "raw" => Ok(KeyFormat::Raw),
            "json" => {
                let field = self
                    .field
                    .clone()
                    .ok_or_else(|| Error::Usage("--format json requires --field".into()))?;
                Ok(KeyFormat::json(field))
            }
            "csv" => {
                let column = self
                    .column
                    .ok_or_else(|| Error::Usage("--format csv requires --column".into()))?;
                let delim = self.delimiter.as_bytes();
                if delim.len() != 1 {
                    return Err(Error::Usage("--delimiter must be exactly one byte".into()));
                }
                Ok(KeyFormat::csv(column, delim[0]))
            }
            other => Err(Error::Usage(format!("unknown --format {other:?}, expected json, csv, or raw"))),
        }
    }
}

fn resolve_codec(name: &str) -> Result<CodecKind, Error> {
    CodecKind::from_name(name).ok_or_else(|| Error::Usage(format!("unknown --codec {name:?}, expected gzip or zstd")))
}

/// Entry point called by `main`. Returns the process exit code.
pub fn run() -> i32 {
    env_logger::init();
    let cli = Cli::parse();
    match run_command(cli.command) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("gzipi: {e}");
            e.exit_code()
        }
    }
}

fn run_command(command: Command) -> Result<(), Error> {
    match command {
        Command::Repack { input_file, output_file, index_file, key, codec, level, member_records, strict } => {
            cmd_repack(input_file, output_file, index_file, key, codec, level, member_records, strict)
        }
        Command::Index { input_file, index_file, key, codec, level, strict } => {
            cmd_index(input_file, index_file, key, codec, level, strict)
        }
        Command::Retrieve { input_file, index_file, output_file, keys_file, keys, key_format, codec } => {
            cmd_retrieve(input_file, index_file, output_file, keys_file, keys, key_format, codec)
        }
        Command::Search { input_file, index_file, key, key_format, codec } => {
            cmd_search(input_file, index_file, key, key_format, codec)
        }
        Command::Verify { input_file, index_file, codec } => cmd_verify(input_file, index_file, codec),
    }
}

fn cmd_repack(
    input_file: PathBuf,
    output_file: PathBuf,
    index_file: PathBuf,
    key: KeyFormatArgs,
    codec: String,
    level: Option<i32>,
    member_records: usize,
    strict: bool,
) -> Result<(), Error> {
    let codec = resolve_codec(&codec)?;
    let opts = RepackOptions {
        member_record_count: member_records,
        key_format: key.resolve()?,
        codec,
        level: level.unwrap_or_else(|| codec.default_level()),
        strict,
    };

    let opener = LocalOpener;
    let mut input_source = opener.open_read(&input_file)?;
    let input = BufReader::new(&mut *input_source);
    let mut archive_out = TempOutput::new(&opener, &output_file)?;
    let mut raw_index = tempfile::tempfile()?;

    let stats = repack::repack(input, archive_out.writer(), BufWriter::new(&mut raw_index), &opts)?;
    log::info!(
        "repack: {} record(s) written, {} skipped, {} member(s)",
        stats.records_written,
        stats.records_skipped,
        stats.members_written
    );

    raw_index.seek(SeekFrom::Start(0))?;
    let mut index_out = TempOutput::new(&opener, &index_file)?;
    let index_stats = index_builder::build_index(BufReader::new(raw_index), index_out.writer(), codec, opts.level)?;
    log::info!(
        "index: {} distinct key(s), {} duplicate(s) collapsed",
        index_stats.distinct_keys,
        index_stats.duplicates_collapsed
    );

    archive_out.commit()?;
    index_out.commit()?;
    println!("repacked {} record(s) into {} member(s): {}", stats.records_written, stats.members_written, output_file.display());
    Ok(())
}

fn cmd_index(
    input_file: PathBuf,
    index_file: PathBuf,
    key: KeyFormatArgs,
    codec: String,
    level: Option<i32>,
    strict: bool,
) -> Result<(), Error> {
    let codec = resolve_codec(&codec)?;
    let level = level.unwrap_or_else(|| codec.default_level());
    let key_format = key.resolve()?;

    let opener = LocalOpener;
    let mut archive_source = opener.open_read(&input_file)?;
    let mut raw_index = tempfile::tempfile()?;

    let stats = repack::index_only(&mut *archive_source, BufWriter::new(&mut raw_index), codec, &key_format, strict)?;
    log::info!("scanned {} member(s), {} key(s)", stats.members_written, stats.records_written);

    raw_index.seek(SeekFrom::Start(0))?;
    let mut index_out = TempOutput::new(&opener, &index_file)?;
    let index_stats = index_builder::build_index(BufReader::new(raw_index), index_out.writer(), codec, level)?;
    index_out.commit()?;
    println!("indexed {} distinct key(s) from {} member(s)", index_stats.distinct_keys, stats.members_written);
    Ok(())
}

fn cmd_retrieve(
    input_file: PathBuf,
    index_file: PathBuf,
    output_file: Option<PathBuf>,
    keys_file: Option<PathBuf>,
    keys: Vec<String>,
    key_format: KeyFormatArgs,
    codec: String,
) -> Result<(), Error> {
    let codec = resolve_codec(&codec)?;
    let key_format = key_format.resolve()?;

    let mut wanted: Vec<Vec<u8>> = keys.into_iter().map(String::into_bytes).collect();
    if let Some(path) = keys_file {
        let mut text = String::new();
        File::open(&path)?.read_to_string(&mut text)?;
        for line in text.lines() {
            if !line.is_empty() {
                wanted.push(line.as_bytes().to_vec());
            }
        }
    }
    if wanted.is_empty() {
        return Err(Error::Usage("retrieve requires --key or --keys-file".into()));
    }

    let opener = LocalOpener;
    let mut index_reader = opener.open_read(&index_file)?;
    let index = Index::load(&mut *index_reader, codec)?;
    let mut archive_source = opener.open_read(&input_file)?;

    let stats = match output_file {
        Some(path) => {
            let file = File::create(&path)?;
            retrieve::retrieve_bulk(&index, &mut *archive_source, codec, &key_format, &wanted, BufWriter::new(file))?
        }
        None => retrieve::retrieve_bulk(&index, &mut *archive_source, codec, &key_format, &wanted, io::stdout().lock())?,
    };

    log::info!("retrieve: {} found, {} missing, {} codec error(s)", stats.keys_found, stats.keys_missing, stats.codec_errors);
    if stats.codec_errors > 0 {
        eprintln!("gzipi: {} member(s) failed to decompress and were skipped", stats.codec_errors);
    }
    Ok(())
}

fn cmd_search(
    input_file: PathBuf,
    index_file: PathBuf,
    key: String,
    key_format: KeyFormatArgs,
    codec: String,
) -> Result<(), Error> {
    let codec = resolve_codec(&codec)?;
    let key_format = key_format.resolve()?;

    let opener = LocalOpener;
    let mut index_reader = opener.open_read(&index_file)?;
    let index = Index::load(&mut *index_reader, codec)?;
    let mut archive_source = opener.open_read(&input_file)?;

    match retrieve::retrieve_one(&index, &mut *archive_source, codec, &key_format, key.as_bytes())? {
        Some(line) => {
            io::stdout().write_all(&line)?;
            io::stdout().write_all(b"\n")?;
        }
        None => log::info!("key {key:?} not found"),
    }
    Ok(())
}

fn cmd_verify(input_file: PathBuf, index_file: PathBuf, codec: String) -> Result<(), Error> {
    let codec = resolve_codec(&codec)?;
    let opener = LocalOpener;

    let mut archive_source = opener.open_read(&input_file)?;
    let frames = codec::scan_frames(codec, &mut *archive_source)?;
    let archive_len: u64 = frames.iter().map(|(_, len)| len).sum();

    let mut index_reader = opener.open_read(&index_file)?;
    let index_bytes_source = codec::decode_one_member(codec, &mut *index_reader)?;
    let entries: Vec<_> = crate::index_codec::read_entries(io::Cursor::new(index_bytes_source))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::from)?;

    let known_members: std::collections::HashSet<(u64, u64)> = frames.iter().copied().collect();
    let mut orphaned = 0u64;
    for entry in &entries {
        if !known_members.contains(&(entry.offset, entry.length)) {
            orphaned += 1;
        }
    }

    println!("archive: {} member(s), {} byte(s) of frame payload", frames.len(), archive_len);
    println!("index:   {} key(s)", entries.len());
    println!("orphaned index entries (no matching frame): {orphaned}");
    if orphaned > 0 {
        return Err(Error::Usage(format!("index references {orphaned} member(s) absent from the archive")));
    }
    Ok(())
}
