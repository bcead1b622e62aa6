//! Binary entry point for the mvbtree inspection CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use mvbtree::{
    run_atomic, Key, KeyDefinition, KeyType, MemPager, MultiValueTree, PagerOptions, Rid,
    TreeOptions, VerifyReport,
};
use mvbtree::storage::mvbtree::{TreeStatsSnapshot, NULL_BUCKET_FILE_EXTENSION};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "mvbtree",
    version,
    about = "Build and inspect multi-value B+ tree snapshots",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct TreeArgs {
    #[arg(value_name = "SNAPSHOT")]
    snapshot: PathBuf,

    #[arg(long, default_value = "demo", help = "Name of the tree inside the snapshot")]
    tree: String,

    #[arg(
        long = "key-type",
        value_enum,
        action = ArgAction::Append,
        help = "Key component type (repeat for composite keys, default long)"
    )]
    key_types: Vec<KeyTypeArg>,

    #[arg(
        long,
        value_name = "FILE",
        env = "MVBTREE_CONFIG",
        help = "TOML file with tree options"
    )]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DemoCmd {
    #[arg(value_name = "SNAPSHOT")]
    snapshot: PathBuf,

    #[arg(long, default_value = "demo", help = "Name of the tree to create")]
    tree: String,

    #[arg(long, default_value_t = 1000, help = "Number of distinct keys")]
    keys: i64,

    #[arg(
        long,
        default_value_t = 3,
        help = "Record ids stored under every tenth key; other keys get one"
    )]
    fanout: i64,

    #[arg(long, default_value_t = 8192, help = "Page size of the new snapshot")]
    page_size: usize,

    #[arg(long, help = "Overwrite an existing snapshot")]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a snapshot holding a sample tree of long keys")]
    Demo(DemoCmd),

    #[command(about = "Print size, boundary keys and counters of a tree")]
    Stats(TreeArgs),

    #[command(about = "Check the structural invariants of a tree")]
    Verify(TreeArgs),

    #[command(about = "Print (key, rid) pairs in key order")]
    Dump {
        #[command(flatten)]
        tree: TreeArgs,

        #[arg(long, value_name = "KEY", help = "Inclusive lower bound")]
        from: Option<String>,

        #[arg(long, value_name = "KEY", help = "Inclusive upper bound")]
        to: Option<String>,

        #[arg(long, help = "Walk keys from largest to smallest")]
        descending: bool,

        #[arg(long, value_name = "N", help = "Stop after N pairs")]
        limit: Option<usize>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum KeyTypeArg {
    Bool,
    Long,
    Double,
    Text,
    Binary,
}

impl From<KeyTypeArg> for KeyType {
    fn from(arg: KeyTypeArg) -> Self {
        match arg {
            KeyTypeArg::Bool => KeyType::Bool,
            KeyTypeArg::Long => KeyType::Long,
            KeyTypeArg::Double => KeyType::Double,
            KeyTypeArg::Text => KeyType::Text,
            KeyTypeArg::Binary => KeyType::Binary,
        }
    }
}

#[derive(Serialize, Debug)]
struct DemoReport {
    snapshot: String,
    tree: String,
    keys: i64,
    values: u64,
    null_values: u64,
}

#[derive(Serialize, Debug)]
struct StatsReport {
    tree: String,
    page_size: usize,
    files: Vec<String>,
    size: u64,
    first_key: Option<String>,
    last_key: Option<String>,
    null_values: usize,
    counters: TreeStatsSnapshot,
}

#[derive(Serialize, Debug)]
struct DumpRow {
    key: String,
    rid: String,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MVBTREE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Demo(cmd) => {
            let report = run_demo(&cmd)?;
            emit(cli.format, &report, || {
                println!(
                    "Created tree '{}' in {} with {} keys, {} values and {} null values",
                    report.tree, report.snapshot, report.keys, report.values, report.null_values
                );
            })?;
        }
        Command::Stats(args) => {
            let report = run_stats(&args)?;
            emit(cli.format, &report, || print_stats_text(&report))?;
        }
        Command::Verify(args) => {
            let report = run_verify(&args)?;
            emit(cli.format, &report, || print_verify_text(&args.tree, &report))?;
            if !report.is_ok() {
                std::process::exit(2);
            }
        }
        Command::Dump {
            tree,
            from,
            to,
            descending,
            limit,
        } => {
            let rows = run_dump(&tree, from.as_deref(), to.as_deref(), descending, limit)?;
            emit(cli.format, &rows, || {
                for row in &rows {
                    println!("{}\t{}", row.key, row.rid);
                }
            })?;
        }
    }
    Ok(())
}

fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    printer: impl FnOnce(),
) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn run_demo(cmd: &DemoCmd) -> Result<DemoReport, Box<dyn Error>> {
    if cmd.snapshot.exists() && !cmd.force {
        return Err(format!(
            "{} already exists (pass --force to overwrite)",
            cmd.snapshot.display()
        )
        .into());
    }
    let pager = MemPager::new(PagerOptions {
        page_size: cmd.page_size,
    })?;
    let definition = KeyDefinition::scalar(KeyType::Long).with_null_key(true);
    let tree = run_atomic(&pager, |op| {
        MultiValueTree::create(op, &cmd.tree, definition, TreeOptions::default())
    })?;
    let mut values = 0u64;
    run_atomic(&pager, |op| {
        for key in 0..cmd.keys {
            let copies = if key % 10 == 0 { cmd.fanout.max(1) } else { 1 };
            for copy in 0..copies {
                let rid = Rid::new((key % 16) as i16, key * 1000 + copy);
                if tree.put(op, Some(&Key::Long(key)), rid)? {
                    values += 1;
                }
            }
        }
        Ok(())
    })?;
    let null_values = run_atomic(&pager, |op| {
        let mut stored = 0u64;
        for n in 0..3 {
            if tree.put(op, None, Rid::new(-1, n))? {
                stored += 1;
            }
        }
        Ok(stored)
    })?;
    pager.checkpoint(&cmd.snapshot)?;
    tree.close();
    Ok(DemoReport {
        snapshot: cmd.snapshot.display().to_string(),
        tree: cmd.tree.clone(),
        keys: cmd.keys,
        values,
        null_values,
    })
}

fn key_types(args: &TreeArgs) -> Vec<KeyType> {
    if args.key_types.is_empty() {
        vec![KeyType::Long]
    } else {
        args.key_types.iter().copied().map(KeyType::from).collect()
    }
}

fn open_tree(args: &TreeArgs) -> Result<(MemPager, MultiValueTree), Box<dyn Error>> {
    let options = match &args.config {
        Some(path) => TreeOptions::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => TreeOptions::default(),
    };
    let pager = MemPager::open(&args.snapshot, PagerOptions::default())?;
    // The null bucket file only exists for trees created with null key support.
    let null_file = format!("{}{NULL_BUCKET_FILE_EXTENSION}", args.tree);
    let null_key = pager.file_names().contains(&null_file);
    let types = key_types(args);
    let definition = if types.len() == 1 {
        KeyDefinition::scalar(types[0])
    } else {
        KeyDefinition::composite(types)
    }
    .with_null_key(null_key);
    let tree = {
        let read = pager.begin_read();
        MultiValueTree::load(&read, &args.tree, definition, options)?
    };
    Ok((pager, tree))
}

fn run_stats(args: &TreeArgs) -> Result<StatsReport, Box<dyn Error>> {
    let (pager, tree) = open_tree(args)?;
    let read = pager.begin_read();
    let size = tree.size(&read)?;
    let first_key = tree.first_key(&read)?.map(|key| key.to_string());
    let last_key = tree.last_key(&read)?.map(|key| key.to_string());
    let null_values = if tree.null_key_supported() {
        tree.get(&read, None)?.len()
    } else {
        0
    };
    Ok(StatsReport {
        tree: tree.name().to_string(),
        page_size: pager.options().page_size,
        files: pager.file_names(),
        size,
        first_key,
        last_key,
        null_values,
        counters: tree.stats_snapshot(),
    })
}

fn run_verify(args: &TreeArgs) -> Result<VerifyReport, Box<dyn Error>> {
    let (pager, tree) = open_tree(args)?;
    let read = pager.begin_read();
    Ok(tree.verify(&read)?)
}

fn run_dump(
    args: &TreeArgs,
    from: Option<&str>,
    to: Option<&str>,
    descending: bool,
    limit: Option<usize>,
) -> Result<Vec<DumpRow>, Box<dyn Error>> {
    let (pager, tree) = open_tree(args)?;
    let types = key_types(args);
    let from = from.map(|text| parse_key(text, &types)).transpose()?;
    let to = to.map(|text| parse_key(text, &types)).transpose()?;
    let read = pager.begin_read();
    let ascending = !descending;
    let cursor = match (&from, &to) {
        (Some(from), Some(to)) => {
            tree.iterate_entries_between(&read, from, true, to, true, ascending)?
        }
        (Some(from), None) => tree.iterate_entries_major(&read, from, true, ascending)?,
        (None, Some(to)) => tree.iterate_entries_minor(&read, to, true, ascending)?,
        (None, None) => tree.iterate_all(&read, ascending)?,
    };
    let mut rows = Vec::new();
    for item in cursor.take(limit.unwrap_or(usize::MAX)) {
        let (key, rid) = item?;
        rows.push(DumpRow {
            key: key.to_string(),
            rid: rid.to_string(),
        });
    }
    Ok(rows)
}

/// Parses a command line key. Composite keys are comma separated and may name a prefix.
fn parse_key(text: &str, types: &[KeyType]) -> Result<Key, Box<dyn Error>> {
    if types.len() == 1 {
        return parse_component(text, types[0]);
    }
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() > types.len() {
        return Err(format!("key '{text}' has more than {} components", types.len()).into());
    }
    let components = parts
        .iter()
        .zip(types)
        .map(|(part, key_type)| parse_component(part.trim(), *key_type))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Key::Composite(components))
}

fn parse_component(text: &str, key_type: KeyType) -> Result<Key, Box<dyn Error>> {
    Ok(match key_type {
        KeyType::Bool => Key::Bool(text.parse()?),
        KeyType::Long => Key::Long(text.parse()?),
        KeyType::Double => Key::Double(text.parse()?),
        KeyType::Text => Key::Text(text.to_string()),
        KeyType::Binary => Key::Binary(hex::decode(text.trim_start_matches("0x"))?),
    })
}

fn print_stats_text(report: &StatsReport) {
    println!("Tree '{}':", report.tree);
    println!("  page_size={} files={}", report.page_size, report.files.join(","));
    println!("  size={} null_values={}", report.size, report.null_values);
    println!(
        "  first_key={} last_key={}",
        report.first_key.as_deref().unwrap_or("-"),
        report.last_key.as_deref().unwrap_or("-")
    );
    let counters = &report.counters;
    println!(
        "  searches={} sibling_walks={} cursor_batches={}",
        counters.searches, counters.sibling_walks, counters.cursor_batches
    );
}

fn print_verify_text(tree: &str, report: &VerifyReport) {
    println!(
        "Verify '{}' => ok={} buckets={} leaves={} depth={} keys={} values={} null_values={} overflow_rows={}",
        tree,
        report.is_ok(),
        report.buckets,
        report.leaves,
        report.depth,
        report.keys,
        report.values,
        report.null_values,
        report.overflow_rows,
    );
    for issue in &report.issues {
        println!("- {issue}");
    }
}
