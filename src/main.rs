use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::info;

use tokweave::block_index::BlockIndex;
use tokweave::char_index::{CharIndex, CxFormat, CxWriter};
use tokweave::error::PipelineError;
use tokweave::indexer::{index_document, IndexerConfig};
use tokweave::io::{read_input, OutputSet};
use tokweave::merge::{merge_document, MergeFormat};
use tokweave::reverse_index::OffsetIndex;
use tokweave::standoff::{default_xml_base, standoff_tokens};
use tokweave::tokens::TokenData;

#[derive(Parser, Debug)]
#[command(name = "tokweave")]
#[command(about = "Character-precise tokenization wrapper for XML documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the character index, structure index and derived text
    Index(IndexArgs),
    /// Merge tokenizer output back into the source document
    Merge(MergeArgs),
    /// Rewrite tokenizer output as standoff token XML
    Standoff(StandoffArgs),
}

#[derive(Args, Debug)]
struct IndexArgs {
    /// Source XML document (- for stdin)
    input: String,

    /// Character index output (- for stdout, empty string discards)
    #[arg(default_value = "-")]
    cx: String,

    /// Structure index output (empty string discards)
    #[arg(default_value = "")]
    sx: String,

    /// Derived text output (empty string discards)
    #[arg(default_value = "")]
    tx: String,

    /// Write the tab-separated character index instead of binary
    #[arg(long)]
    text_index: bool,

    /// Keep whitespace-only character data in the structure index
    #[arg(long)]
    keep_ws: bool,

    /// Omit comment lines from the tab-separated character index
    #[arg(long)]
    no_comments: bool,

    /// Omit the column-name line from the tab-separated character index
    #[arg(long)]
    no_colnames: bool,

    /// Use memory-mapped I/O for file inputs
    #[arg(long)]
    use_mmap: bool,

    /// Stats output file path
    #[arg(long)]
    stats_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Tokenizer output document (- for stdin)
    tokens: String,

    /// Source XML document
    source: String,

    /// Character index file
    cx: String,

    /// Block index file (empty string treats the text as one block)
    #[arg(default_value = "")]
    bx: String,

    /// Merged output (- for stdout, empty string discards)
    #[arg(default_value = "-")]
    output: String,

    /// Element name for inserted sentence markup
    #[arg(long, default_value = "s")]
    sentence_elt: String,

    /// Element name for inserted token markup
    #[arg(long, default_value = "w")]
    token_elt: String,

    /// Back-reference attribute on continuation segments
    #[arg(long, default_value = "n")]
    ref_attr: String,

    /// Use memory-mapped I/O for file inputs
    #[arg(long)]
    use_mmap: bool,

    /// Stats output file path
    #[arg(long)]
    stats_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StandoffArgs {
    /// Tokenizer output document (- for stdin)
    input: String,

    /// Standoff output (- for stdout, empty string discards)
    #[arg(default_value = "-")]
    output: String,

    /// Value of the xml:base attribute (default: input name with .t.xml -> .xml)
    #[arg(long)]
    xml_base: Option<String>,

    /// Use memory-mapped I/O for file inputs
    #[arg(long)]
    use_mmap: bool,

    /// Stats output file path
    #[arg(long)]
    stats_out: Option<PathBuf>,
}

/// Stage stats plus wall-clock time, as written to `--stats-out`.
#[derive(Serialize)]
struct RunStats<'a, S: Serialize> {
    elapsed_ms: u128,
    #[serde(flatten)]
    stage: &'a S,
}

fn main() -> ExitCode {
    // WHY: structured JSON logging enables observability and debugging in production
    tracing_subscriber::fmt()
        .with_target(false)
        .json()
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            eprintln!("Error: {err:#}");
            ExitCode::from(code as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Index(args) => cmd_index(args),
        Command::Merge(args) => cmd_merge(args),
        Command::Standoff(args) => cmd_standoff(args),
    }
}

fn cmd_index(args: IndexArgs) -> Result<()> {
    info!(?args, "Starting index stage");
    let started = Instant::now();

    let input = read_input(&args.input, args.use_mmap)?;
    let mut outputs = OutputSet::new();
    let cx_out = outputs.open(&args.cx)?;
    let mut sx_out = outputs.open(&args.sx)?;
    let mut tx_out = outputs.open(&args.tx)?;

    let format = if args.text_index {
        CxFormat::Text
    } else {
        CxFormat::Binary
    };
    let cx_writer = match cx_out {
        Some(w) => Some(CxWriter::new(w, format, !args.no_comments, !args.no_colnames)?),
        None => None,
    };

    let config = IndexerConfig { keep_ws: args.keep_ws };
    let stats = index_document(
        &input,
        &args.input,
        cx_writer,
        sx_out.as_mut(),
        tx_out.as_mut(),
        &config,
    )?;
    outputs.flush_all()?;

    write_stats(args.stats_out.as_deref(), started, &stats)?;
    println!(
        "tokweave index: {} records ({} chars, {} line breaks), {} text bytes",
        stats.records, stats.chars, stats.line_breaks, stats.text_bytes
    );
    Ok(())
}

fn cmd_merge(args: MergeArgs) -> Result<()> {
    info!(?args, "Starting merge stage");
    let started = Instant::now();

    let token_bytes = read_input(&args.tokens, args.use_mmap)?;
    let source = read_input(&args.source, args.use_mmap)?;
    let cx_bytes = read_input(&args.cx, args.use_mmap)?;
    let cx = CharIndex::read(&args.cx, &cx_bytes)?;
    info!(records = cx.len(), "Loaded character index");

    let text_index = OffsetIndex::over_text(&cx);
    let bx = if args.bx.is_empty() {
        BlockIndex::whole_stream(cx.text_len())
    } else {
        let bx_bytes = read_input(&args.bx, args.use_mmap)?;
        BlockIndex::read(&args.bx, &bx_bytes)?
    };
    info!(blocks = bx.len(), "Loaded block index");
    let txt_index = OffsetIndex::over_tokenizer(&bx, &text_index);

    let data = TokenData::load(&args.tokens, &token_bytes, &cx, &txt_index)?;

    let format = MergeFormat {
        sentence_elt: args.sentence_elt.clone(),
        token_elt: args.token_elt.clone(),
        ref_attr: args.ref_attr.clone(),
    };
    let mut outputs = OutputSet::new();
    let stats = match outputs.open(&args.output)? {
        Some(mut out) => merge_document(&source, &args.source, &cx, &data, &format, &mut out)?,
        // Discarded output still runs the full consistency walk.
        None => merge_document(
            &source,
            &args.source,
            &cx,
            &data,
            &format,
            &mut std::io::sink(),
        )?,
    };
    outputs.flush_all()?;

    write_stats(args.stats_out.as_deref(), started, &stats)?;
    println!(
        "tokweave merge: {} records, {} sentence segments, {} token segments",
        stats.records, stats.sentence_segs, stats.token_segs
    );
    if stats.offset_drift > 0 {
        println!("  Offsets drifted on {} records", stats.offset_drift);
    }
    Ok(())
}

fn cmd_standoff(args: StandoffArgs) -> Result<()> {
    info!(?args, "Starting standoff stage");
    let started = Instant::now();

    let input = read_input(&args.input, args.use_mmap)?;
    let xml_base = args
        .xml_base
        .clone()
        .unwrap_or_else(|| default_xml_base(&args.input));

    let mut outputs = OutputSet::new();
    let stats = match outputs.open(&args.output)? {
        Some(mut out) => standoff_tokens(&input, &args.input, &xml_base, &mut out)?,
        None => standoff_tokens(&input, &args.input, &xml_base, &mut std::io::sink())?,
    };
    outputs.flush_all()?;

    write_stats(args.stats_out.as_deref(), started, &stats)?;
    println!(
        "tokweave standoff: {} tokens, {} character references",
        stats.tokens, stats.refs
    );
    Ok(())
}

fn write_stats<S: Serialize>(path: Option<&std::path::Path>, started: Instant, stage: &S) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    let stats = RunStats {
        elapsed_ms: started.elapsed().as_millis(),
        stage,
    };
    let json = serde_json::to_string_pretty(&stats).context("failed to serialize run stats")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write stats file {}", path.display()))?;
    info!("Stats written to {}", path.display());
    Ok(())
}
