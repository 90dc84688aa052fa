use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

use photovault::config::Config;
use photovault::db::Database;
use photovault::metadata::{FieldValue, PendingOperation};
use photovault::{logging, ImageCache, MetadataService};

enum Command {
    Submit {
        image_id: i64,
        add: Vec<FieldValue>,
        remove: Vec<FieldValue>,
        actor_id: Option<i64>,
    },
    Pending {
        image_id: Option<i64>,
    },
    Sweep,
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {message}");
    print_help();
    std::process::exit(1);
}

fn parse_id(value: Option<&String>, what: &str) -> i64 {
    match value.map(|v| v.parse::<i64>()) {
        Some(Ok(id)) => id,
        Some(Err(_)) => fail(&format!("{what} must be an integer")),
        None => fail(&format!("missing {what}")),
    }
}

fn parse_field_value(value: Option<&String>, flag: &str) -> FieldValue {
    let Some(value) = value else {
        fail(&format!("{flag} requires FIELD=VALUE"));
    };
    FieldValue::parse(value).unwrap_or_else(|e| fail(&e.to_string()))
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut add = Vec::new();
    let mut remove = Vec::new();
    let mut actor_id = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("photovault {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                match args.get(i + 1) {
                    Some(path) => config_path = Some(PathBuf::from(path)),
                    None => fail("--config requires a path argument"),
                }
                i += 1;
            }
            "--add" | "-a" => {
                add.push(parse_field_value(args.get(i + 1), "--add"));
                i += 1;
            }
            "--remove" | "-r" => {
                remove.push(parse_field_value(args.get(i + 1), "--remove"));
                i += 1;
            }
            "--actor" => {
                actor_id = Some(parse_id(args.get(i + 1), "--actor"));
                i += 1;
            }
            arg if arg.starts_with('-') => fail(&format!("unknown argument: {arg}")),
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    let command = match positional.first().map(String::as_str) {
        Some("submit") => {
            let image_id = parse_id(positional.get(1), "image id");
            if add.is_empty() && remove.is_empty() {
                fail("submit needs at least one --add or --remove");
            }
            Command::Submit {
                image_id,
                add,
                remove,
                actor_id,
            }
        }
        Some("pending") => Command::Pending {
            image_id: positional.get(1).map(|_| parse_id(positional.get(1), "image id")),
        },
        Some("sweep") => Command::Sweep,
        Some(other) => fail(&format!("unknown command: {other}")),
        None => fail("missing command"),
    };

    Args {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"photovault - queue metadata edits for write-back into photo files

USAGE:
    photovault [OPTIONS] <COMMAND>

COMMANDS:
    submit <IMAGE_ID>   Queue edits for an image
        --add, -a FIELD=VALUE       Add or set a value (repeatable)
        --remove, -r FIELD=VALUE    Remove or clear a value (repeatable)
        --actor ID                  User id recorded with the edits
    pending [IMAGE_ID]  Show queued operations
    sweep               Delete finished operations past the retention window

FIELDS:
    keyword, caption, description, copyright, rating (0-5),
    rotation (0, 90, 180, 270), face_region (JSON {{"name","x","y","w","h"}})

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PHOTOVAULT_CONFIG   Path to config file (overrides default location)
    PHOTOVAULT_LOG      Log filter (trace, debug, info, warn, error)

Edits are written to files by photovault-daemon."#
    );
}

fn print_operation(op: &PendingOperation) {
    println!(
        "{:>8}  image {:<8} {:<10} {:<6} {:<9} {}  {:?}",
        op.id,
        op.image_id,
        op.field.as_str(),
        op.op.as_str(),
        op.state.as_str(),
        op.timestamp.format("%Y-%m-%d %H:%M:%S"),
        op.payload
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    db.initialize()?;

    match args.command {
        Command::Submit {
            image_id,
            add,
            remove,
            actor_id,
        } => {
            let cache = Arc::new(ImageCache::new(db.clone(), config.cache.ttl()));
            let service = MetadataService::new(db, cache);
            let ids = service
                .submit_operations(image_id, &add, &remove, actor_id)
                .with_context(|| format!("Failed to submit edits for image {image_id}"))?;
            println!(
                "Queued {} operation(s) for image {}; they will be written after {}s",
                ids.len(),
                image_id,
                config.metadata_write.debounce_secs
            );
        }
        Command::Pending { image_id: Some(image_id) } => {
            let operations = db.operations_for_image(image_id)?;
            if operations.is_empty() {
                println!("No operations for image {image_id}");
            }
            for op in &operations {
                print_operation(op);
            }
        }
        Command::Pending { image_id: None } => {
            for (state, count) in db.count_operations_by_state()? {
                println!("{:<10} {}", state.as_str(), count);
            }
            let pending = db.list_pending_operations(50)?;
            if !pending.is_empty() {
                println!();
            }
            for op in &pending {
                print_operation(op);
            }
        }
        Command::Sweep => {
            let retention = chrono::Duration::days(i64::from(config.metadata_write.retention_days));
            let removed = db.sweep_terminal_operations(Utc::now() - retention)?;
            println!("Removed {removed} finished operation(s)");
        }
    }

    Ok(())
}
