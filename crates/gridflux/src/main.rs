mod commands;
mod script;

use gridflux_core::{CallerId, GridConfig, GridConfigStore};
use std::path::PathBuf;
use std::process;

const USAGE: &str = "Usage: gridflux [options] <command>

Commands:
  create <name>        Create a table owned by the caller
  tables               List the caller's tables
  show <table-id>      Print a table snapshot as JSON
  apply <script|->     Queue every mutation in a JSON-lines script

Options:
  --db <path>          Database file (default: <data dir>/gridflux/grid.sqlite)
  --owner <id>         Caller identity (default: $USER)
  --config <path>      Config file (default: <config dir>/gridflux/config.json)";

enum Command {
    Create(String),
    Tables,
    Show(String),
    Apply(String),
}

struct Args {
    db: PathBuf,
    owner: CallerId,
    config: Option<PathBuf>,
    command: Command,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args();
    let config = load_config(args.config.as_ref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| fatal(&format!("Failed to start runtime: {e}")));

    let code = runtime.block_on(run(args, config));
    process::exit(code);
}

async fn run(args: Args, config: GridConfig) -> i32 {
    let gateway = commands::open_gateway(&args.db, &config).unwrap_or_else(|e| {
        fatal(&format!(
            "Failed to open database '{}': {e}",
            args.db.display()
        ))
    });

    log::debug!("Opened {} as {}", args.db.display(), args.owner);

    let result = match args.command {
        Command::Create(name) => commands::create_table(&gateway, &args.owner, &name)
            .await
            .map(|_| 0),
        Command::Tables => commands::list_tables(&gateway, &args.owner)
            .await
            .map(|_| 0),
        Command::Show(table) => match commands::parse_table_id(&table) {
            Ok(table_id) => commands::show_table(&gateway, &args.owner, table_id)
                .await
                .map(|_| 0),
            Err(e) => Err(e),
        },
        Command::Apply(source) => {
            let text = read_script(&source);
            match script::parse_script(&text) {
                Ok(entries) => {
                    let report = commands::apply_script(&gateway, &args.owner, entries).await;
                    Ok(if report.is_clean() { 0 } else { 2 })
                }
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

fn read_script(source: &str) -> String {
    if source == "-" {
        return std::io::read_to_string(std::io::stdin())
            .unwrap_or_else(|e| fatal(&format!("Failed to read stdin: {e}")));
    }

    std::fs::read_to_string(source)
        .unwrap_or_else(|e| fatal(&format!("Failed to read script '{source}': {e}")))
}

fn load_config(path: Option<&PathBuf>) -> GridConfig {
    let store = match path {
        Some(path) => GridConfigStore::from_path(path.clone()),
        None => match GridConfigStore::new() {
            Ok(store) => store,
            Err(e) => {
                log::warn!("No config directory, using defaults: {e}");
                return GridConfig::default();
            }
        },
    };

    store
        .load()
        .unwrap_or_else(|e| fatal(&format!("Failed to load {}: {e}", store.path().display())))
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("gridflux"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("grid.sqlite")
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut db = None;
    let mut owner = None;
    let mut config = None;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => db = args.next().map(PathBuf::from),
            "--owner" => owner = args.next(),
            "--config" => config = args.next().map(PathBuf::from),
            "--help" | "-h" => {
                eprintln!("{USAGE}");
                process::exit(0);
            }
            other if other.starts_with("--") => fatal(&format!("Unknown argument: {other}")),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("create") => Command::Create(
            positional
                .next()
                .unwrap_or_else(|| fatal("create needs a table name")),
        ),
        Some("tables") => Command::Tables,
        Some("show") => Command::Show(
            positional
                .next()
                .unwrap_or_else(|| fatal("show needs a table id")),
        ),
        Some("apply") => Command::Apply(
            positional
                .next()
                .unwrap_or_else(|| fatal("apply needs a script path or '-'")),
        ),
        Some(other) => fatal(&format!("Unknown command: {other}")),
        None => {
            eprintln!("{USAGE}");
            process::exit(1);
        }
    };

    if let Some(extra) = positional.next() {
        fatal(&format!("Unexpected argument: {extra}"));
    }

    let owner = owner
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| fatal("--owner is required when $USER is not set"));

    Args {
        db: db.unwrap_or_else(default_db_path),
        owner: CallerId::new(owner),
        config,
        command,
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("Error: {message}");
    process::exit(1)
}
