//! vibelob - load a file as a CLOB or BLOB and report how it is stored

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, ValueEnum};
use log::info;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use vibelob::database::{Database, DatabaseConfig};
use vibelob::value::{LobKind, LobStorage, LobValue};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Clob,
    Blob,
}

impl From<Kind> for LobKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Clob => LobKind::Clob,
            Kind::Blob => LobKind::Blob,
        }
    }
}

/// vibelob - load a file as a large object
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File to load; reads standard input when omitted
    input: Option<PathBuf>,

    /// Kind of large object to create
    #[arg(short, long, value_enum, default_value = "blob")]
    kind: Kind,

    /// Largest object kept inline, in bytes or characters
    #[arg(short, long, default_value = "256")]
    inline_limit: usize,

    /// Read at most this many bytes or characters
    #[arg(short, long)]
    max_length: Option<u64>,

    /// Link the object to this table id
    #[arg(short, long)]
    link: Option<i32>,

    /// Name of the LOB compression algorithm
    #[arg(short, long)]
    compress: Option<String>,

    /// Data directory
    #[arg(short = 'D', long, default_value = "./vibelob_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    std::fs::create_dir_all(&args.data_dir).context("Failed to create data directory")?;
    let config = DatabaseConfig {
        max_length_inplace_lob: args.inline_limit,
        lob_compression_algorithm: args.compress.clone(),
        ..Default::default()
    };
    let database = Database::open(&args.data_dir.join("vibelob.db"), config)
        .context("Failed to open database")?;
    let handler = database.handler();

    let source: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };

    let mut lob =
        LobValue::create_temp_from_stream(args.kind.into(), source, args.max_length, &handler)
            .context("Failed to create large object")?;
    info!("Created {}", lob);

    if let Some(table_id) = args.link {
        lob = lob
            .link(&handler, table_id)
            .with_context(|| format!("Failed to link to table {}", table_id))?;
        info!("Linked {}", lob);
    }

    let storage = match lob.storage() {
        LobStorage::Inline(_) => "inline".to_string(),
        LobStorage::TempFile(file) => format!("temp file {}", file.path().display()),
        LobStorage::Durable {
            lob_id, table_id, ..
        } => format!("lob {} in table {}", lob_id, table_id),
    };
    println!("kind:      {}", lob.kind());
    println!("precision: {}", lob.precision());
    println!("storage:   {}", storage);
    println!("memory:    {}", lob.memory());
    println!("trace:     {}", lob.trace_sql());

    let temp_files = database.temp_files()?;
    if !temp_files.is_empty() {
        println!("temp files:");
        for path in temp_files {
            println!("  {}", path.display());
        }
    }

    lob.close()?;
    Ok(())
}
