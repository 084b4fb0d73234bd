use clap::{Parser, Subcommand, ValueEnum};
use skilldb::query::{AggregateField, GroupByArgs, UniqueWhere};
use skilldb::schema::SchemaRegistry;
use skilldb::{FindManyArgs, FindUniqueArgs, Filter, Include, OrderBy, Store, StoreConfig, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// skilldb CLI: inspect and edit a skilldb store from the command line
#[derive(Parser)]
#[command(name = "skilldb", version, about)]
struct Cli {
    /// SQLite journal to open (overrides the config file and SKILLDB_DATABASE_PATH)
    #[arg(long)]
    database: Option<PathBuf>,

    /// YAML store config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Entity schema YAML to use instead of the built-in one
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Show schema hash, row counts and transaction activity
    Status,

    /// Get a single row by id
    Get {
        /// Entity name (e.g. User, Skill)
        entity: String,
        /// Row id
        id: String,
        /// Relations to include (repeatable)
        #[arg(long = "include")]
        includes: Vec<String>,
    },

    /// List rows of an entity
    List {
        /// Entity name
        entity: String,
        /// Equality filters (e.g. --where category=backend)
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Sort field, suffixed with :desc for descending (e.g. --order levelScore:desc)
        #[arg(long = "order")]
        order: Vec<String>,
        #[arg(long)]
        take: Option<i64>,
        #[arg(long)]
        skip: Option<usize>,
        /// Relations to include (repeatable)
        #[arg(long = "include")]
        includes: Vec<String>,
    },

    /// Count rows of an entity
    Count {
        entity: String,
        /// Equality filters (e.g. --where verified=true)
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Create a row
    Create {
        entity: String,
        /// Field values (e.g. --field email=ann@example.com)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Full JSON payload, nested writes included
        #[arg(long)]
        data: Option<String>,
    },

    /// Update a row by id
    Update {
        entity: String,
        id: String,
        /// Field values to update (e.g. --field name=Ann)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Full JSON payload, operation objects and nested writes included
        #[arg(long)]
        data: Option<String>,
    },

    /// Delete a row by id, cascading per the schema
    Delete {
        entity: String,
        id: String,
        /// Show what would be deleted without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Group rows and compute aggregates
    GroupBy {
        entity: String,
        /// Fields to group by (repeatable)
        #[arg(long = "by", required = true)]
        by: Vec<String>,
        /// Aggregates as fn:field (e.g. --agg avg:levelScore, --agg count:_all)
        #[arg(long = "agg")]
        aggregates: Vec<String>,
        /// Equality filters applied before grouping
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        // Machine-readable error on stderr
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn open_store(cli: &Cli) -> Result<Store, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    }
    .apply_env()?;
    if let Some(path) = &cli.database {
        config.database_path = Some(path.clone());
    }
    log::debug!("opening store with {config:?}");
    let store = match &cli.schema {
        Some(path) => Store::open_with_registry(Arc::new(SchemaRegistry::from_file(path)?), &config)?,
        None => Store::open(&config)?,
    };
    Ok(store)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&cli)?;
    let registry = store.registry();

    let output = match &cli.command {
        Command::Status => store.status()?,

        Command::Get {
            entity,
            id,
            includes,
        } => {
            let args = FindUniqueArgs::new(UniqueWhere::id(id.as_str()))
                .include(include_of(includes));
            store.find_unique_or_throw(entity, args)?.to_json()?
        }

        Command::List {
            entity,
            filters,
            order,
            take,
            skip,
            includes,
        } => {
            let mut args = FindManyArgs::new().include(include_of(includes));
            args.filter = filter_of(registry, entity, filters)?;
            args.take = *take;
            args.skip = *skip;
            for spec in order {
                args = args.order_by(order_of(spec));
            }
            let rows = store.find_many(entity, &args)?;
            serde_json::to_value(rows)?
        }

        Command::Count { entity, filters } => {
            let args = FindManyArgs {
                filter: filter_of(registry, entity, filters)?,
                ..FindManyArgs::default()
            };
            serde_json::json!({ "count": store.count(entity, &args)? })
        }

        Command::Create {
            entity,
            fields,
            data,
        } => {
            let payload = payload_of(fields, data.as_deref())?;
            let created = store.collection(entity)?.create_json(&payload)?;
            created.to_json()
        }

        Command::Update {
            entity,
            id,
            fields,
            data,
        } => {
            let payload = payload_of(fields, data.as_deref())?;
            let updated = store.collection(entity)?.update_json(id, &payload)?;
            updated.to_json()
        }

        Command::Delete {
            entity,
            id,
            dry_run,
        } => {
            let key = UniqueWhere::id(id.as_str());
            if *dry_run {
                let impact = store.deletion_impact(entity, &key)?;
                serde_json::json!({ "dry_run": true, "impact": impact })
            } else {
                let impact = store.deletion_impact(entity, &key)?;
                store.delete(entity, &key)?;
                serde_json::json!({ "ok": true, "deleted": id, "impact": impact })
            }
        }

        Command::GroupBy {
            entity,
            by,
            aggregates,
            filters,
        } => {
            let mut args = GroupByArgs::new(by.clone());
            if let Some(filter) = filter_of(registry, entity, filters)? {
                args = args.filter(filter);
            }
            for spec in aggregates {
                args = args.select(aggregate_of(spec)?);
            }
            serde_json::to_value(store.group_by(entity, &args)?)?
        }
    };

    print_output(&output, &cli.format)
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn include_of(relations: &[String]) -> Include {
    relations
        .iter()
        .fold(Include::new(), |include, name| include.relation(name.as_str()))
}

/// `name` or `name:desc`.
fn order_of(spec: &str) -> OrderBy {
    match spec.split_once(':') {
        Some((field, dir)) if dir.eq_ignore_ascii_case("desc") => OrderBy::desc(field),
        Some((field, _)) => OrderBy::asc(field),
        None => OrderBy::asc(spec),
    }
}

/// `fn:field`, where `count:_all` counts every row.
fn aggregate_of(spec: &str) -> Result<AggregateField, Box<dyn std::error::Error>> {
    let (func, field) = spec
        .split_once(':')
        .ok_or_else(|| format!("Invalid aggregate '{spec}': expected fn:field"))?;
    Ok(match func {
        "count" if field == "_all" => AggregateField::count_all(),
        "count" => AggregateField::count(field),
        "avg" => AggregateField::avg(field),
        "sum" => AggregateField::sum(field),
        "min" => AggregateField::min(field),
        "max" => AggregateField::max(field),
        _ => return Err(format!("Unknown aggregate function '{func}'").into()),
    })
}

/// AND of equality filters, with each value parsed as its field's type.
/// List fields match rows whose list has the element.
fn filter_of(
    registry: &SchemaRegistry,
    entity: &str,
    pairs: &[(String, String)],
) -> Result<Option<Filter>, Box<dyn std::error::Error>> {
    let mut filters = Vec::with_capacity(pairs.len());
    for (name, raw) in pairs {
        let field = registry.field_type(entity, name)?;
        let value = Value::parse_as(raw, field.ty).ok_or_else(|| {
            format!("'{raw}' is not a valid {} for {entity}.{name}", field.ty.name())
        })?;
        filters.push(if field.list {
            Filter::has(name.as_str(), value)
        } else if value.is_null() {
            Filter::is_null(name.as_str())
        } else {
            Filter::eq(name.as_str(), value)
        });
    }
    Ok(match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(Filter::and(filters)),
    })
}

/// JSON payload from `--data`, with `--field` pairs laid over it.
fn payload_of(
    fields: &[(String, String)],
    data: Option<&str>,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let mut map = match data {
        Some(text) => match serde_json::from_str(text)? {
            serde_json::Value::Object(map) => map,
            _ => return Err("--data must be a JSON object".into()),
        },
        None => serde_json::Map::new(),
    };
    for (key, val) in fields {
        // Numbers, booleans, arrays and null parse as JSON; anything else is a string
        let json_val =
            serde_json::from_str(val).unwrap_or_else(|_| serde_json::Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    Ok(serde_json::Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_aggregate_specs() {
        assert_eq!(order_of("levelScore:desc"), OrderBy::desc("levelScore"));
        assert_eq!(order_of("name"), OrderBy::asc("name"));
        assert_eq!(aggregate_of("avg:levelScore").unwrap(), AggregateField::avg("levelScore"));
        assert_eq!(aggregate_of("count:_all").unwrap(), AggregateField::count_all());
        assert!(aggregate_of("median:levelScore").is_err());
        assert!(aggregate_of("levelScore").is_err());
    }

    #[test]
    fn test_filters_parse_as_field_types() {
        let registry = SchemaRegistry::builtin().unwrap();
        let filter = filter_of(
            &registry,
            "Skill",
            &[
                ("levelScore".to_string(), "80".to_string()),
                ("verified".to_string(), "true".to_string()),
            ],
        )
        .unwrap();
        assert_eq!(
            filter,
            Some(Filter::and(vec![
                Filter::eq("levelScore", 80),
                Filter::eq("verified", true),
            ]))
        );
        assert!(filter_of(&registry, "Skill", &[("levelScore".into(), "high".into())]).is_err());
        assert!(filter_of(&registry, "Skill", &[("rating".into(), "1".into())]).is_err());
    }

    #[test]
    fn test_payload_fields_override_data() {
        let payload = payload_of(
            &[
                ("levelScore".to_string(), "42".to_string()),
                ("name".to_string(), "Go".to_string()),
            ],
            Some(r#"{"name": "Rust", "verified": true}"#),
        )
        .unwrap();
        assert_eq!(
            payload,
            serde_json::json!({ "name": "Go", "levelScore": 42, "verified": true })
        );
        assert!(payload_of(&[], Some("[1, 2]")).is_err());
    }
}
