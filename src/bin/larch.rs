//! Command-line front end for a larch store.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use larch::storage::btree::{
    AppendPrependResult, DeleteResult, IncrDecrResult, SetResult, StoredValue,
};
use larch::{BTreeSlice, LarchConfig, PageStore, Pager};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "larch",
    version,
    about = "Run single-key operations against a larch store",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "LARCH_DB", value_name = "PATH", help = "Store file")]
    db: Option<PathBuf>,

    #[arg(long, global = true, env = "LARCH_CONFIG", value_name = "TOML", help = "Config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    key: String,
    value: String,
    #[arg(long, default_value_t = 0, help = "Client flags stored with the value")]
    flags: u32,
    #[arg(long, help = "Treat the value as hex")]
    hex: bool,
}

#[derive(Args, Debug)]
struct DataArgs {
    key: String,
    data: String,
    #[arg(long, help = "Treat the data as hex")]
    hex: bool,
}

#[derive(Args, Debug)]
struct DeltaArgs {
    key: String,
    #[arg(default_value_t = 1)]
    delta: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value unconditionally.
    Set(StoreArgs),
    /// Store a value only if the key is absent.
    Add(StoreArgs),
    /// Store a value only if the key is present.
    Replace(StoreArgs),
    /// Store a value only if the current cas token matches.
    Cas {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        cas: u64,
    },
    /// Append bytes to an existing value.
    Append(DataArgs),
    /// Prepend bytes to an existing value.
    Prepend(DataArgs),
    /// Increment a decimal counter.
    Incr(DeltaArgs),
    /// Decrement a decimal counter, stopping at zero.
    Decr(DeltaArgs),
    /// Remove a key.
    Delete { key: String },
    /// Print a value with its flags and stamps.
    Get { key: String },
    /// Check the tree's structural invariants.
    Verify,
    /// Print tree, pager and large-value statistics.
    Stats,
}

fn main() {
    install_tracing_subscriber();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn bytes(text: &str, hex: bool) -> Result<Vec<u8>, Box<dyn Error>> {
    if hex {
        Ok(hex::decode(text)?)
    } else {
        Ok(text.as_bytes().to_vec())
    }
}

fn render(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", hex::encode(bytes)),
    }
}

fn report_set(result: SetResult) -> i32 {
    let reply = match result {
        SetResult::Stored => "STORED",
        SetResult::NotStored => "NOT_STORED",
        SetResult::Exists => "EXISTS",
        SetResult::NotFound => "NOT_FOUND",
        SetResult::TooLarge => "SERVER_ERROR object too large for cache",
    };
    println!("{reply}");
    if result == SetResult::Stored {
        0
    } else {
        2
    }
}

fn report_get(key: &str, value: Option<StoredValue>) -> i32 {
    let Some(value) = value else {
        println!("NOT_FOUND");
        return 2;
    };
    println!(
        "{key} flags={} cas={} recency={} len={}{}",
        value.meta.flags,
        value.meta.cas,
        value.meta.recency,
        value.bytes.len(),
        if value.large.is_some() { " large" } else { "" }
    );
    println!("{}", render(&value.bytes));
    0
}

fn open(cli: &Cli) -> Result<(Arc<Pager>, BTreeSlice), Box<dyn Error>> {
    let config = match &cli.config {
        Some(path) => LarchConfig::load(path)?,
        None => LarchConfig::default(),
    };
    let db = cli
        .db
        .clone()
        .ok_or("no store given; pass --db or set LARCH_DB")?;
    let pager = Arc::new(Pager::open_or_create(&db, config.pager)?);
    let store: Arc<dyn PageStore> = pager.clone();
    let slice = BTreeSlice::open(store, config.tree)?;
    Ok((pager, slice))
}

fn run() -> Result<i32, Box<dyn Error>> {
    let cli = Cli::parse();
    let (pager, slice) = open(&cli)?;
    let code = match &cli.command {
        Command::Set(args) => {
            report_set(slice.set(args.key.as_bytes(), &bytes(&args.value, args.hex)?, args.flags)?)
        }
        Command::Add(args) => {
            report_set(slice.add(args.key.as_bytes(), &bytes(&args.value, args.hex)?, args.flags)?)
        }
        Command::Replace(args) => report_set(slice.replace(
            args.key.as_bytes(),
            &bytes(&args.value, args.hex)?,
            args.flags,
        )?),
        Command::Cas { store, cas } => report_set(slice.cas(
            store.key.as_bytes(),
            &bytes(&store.value, store.hex)?,
            store.flags,
            *cas,
        )?),
        Command::Append(args) | Command::Prepend(args) => {
            let data = bytes(&args.data, args.hex)?;
            let result = if matches!(cli.command, Command::Prepend(_)) {
                slice.prepend(args.key.as_bytes(), &data)?
            } else {
                slice.append(args.key.as_bytes(), &data)?
            };
            match result {
                AppendPrependResult::Success => {
                    println!("STORED");
                    0
                }
                AppendPrependResult::NotFound => {
                    println!("NOT_STORED");
                    2
                }
                AppendPrependResult::TooLarge => {
                    println!("TOO_LARGE");
                    2
                }
            }
        }
        Command::Incr(args) | Command::Decr(args) => {
            let result = if matches!(cli.command, Command::Incr(_)) {
                slice.incr(args.key.as_bytes(), args.delta)?
            } else {
                slice.decr(args.key.as_bytes(), args.delta)?
            };
            match result {
                IncrDecrResult::Value(value) => {
                    println!("{value}");
                    0
                }
                IncrDecrResult::NotFound => {
                    println!("NOT_FOUND");
                    2
                }
                IncrDecrResult::NotNumeric => {
                    println!("CLIENT_ERROR cannot increment or decrement non-numeric value");
                    2
                }
            }
        }
        Command::Delete { key } => match slice.delete(key.as_bytes())? {
            DeleteResult::Deleted => {
                println!("DELETED");
                0
            }
            DeleteResult::NotFound => {
                println!("NOT_FOUND");
                2
            }
        },
        Command::Get { key } => report_get(key, slice.get(key.as_bytes())?),
        Command::Verify => {
            let report = slice.verify()?;
            let counts = &report.counts;
            println!(
                "depth={} internal={} leaves={} entries={} large_values={} large_pages={} delete_queue={}",
                counts.depth,
                counts.internal_nodes,
                counts.leaves,
                counts.entries,
                counts.large_values,
                counts.large_pages,
                counts.delete_queue_len
            );
            for finding in &report.findings {
                println!("error: {finding}");
            }
            if report.success {
                println!("ok");
                0
            } else {
                2
            }
        }
        Command::Stats => {
            let tree = slice.stats();
            let pager_stats = pager.stats();
            let vstore = slice.tree().vstore().metrics_snapshot();
            let meta = pager.meta()?;
            let sb = slice.superblock()?;
            println!("root={} depth={} last_recency={}", sb.root, sb.depth, sb.last_recency);
            println!(
                "pages: next={} free={} page_size={}",
                meta.next_page, meta.free_count, meta.page_size
            );
            println!("pager: {pager_stats:?}");
            println!("tree: {tree:?}");
            println!(
                "large values: allocated={} freed={} live={} bytes_written={} bytes_read={}",
                vstore.pages_allocated,
                vstore.pages_freed,
                vstore.live_pages(),
                vstore.bytes_written,
                vstore.bytes_read
            );
            slice.tree().stats().emit_tracing();
            0
        }
    };
    Ok(code)
}
