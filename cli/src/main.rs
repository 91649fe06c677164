use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use kasane::spec::{CompileOptions, compile};
use kasane::{InlineTables, PreTransformOptions, Runtime, RuntimeConfig, Table, Warning};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser, Debug)]
#[clap(version, about = "Pre-transforms visualization specifications")]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Number of worker threads, all available cores by default.
    #[clap(long, global = true)]
    workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a specification and print it with the results inlined.
    PreTransform {
        #[clap(flatten)]
        input: Input,

        /// Move datasets with at least this many rows out of the
        /// specification.
        #[clap(long)]
        extract: Option<usize>,
    },
    /// Evaluate datasets of a specification and print their rows.
    Datasets {
        #[clap(flatten)]
        input: Input,

        /// Dataset to evaluate, as NAME or NAME@SCOPE with a dotted scope
        /// such as `cars@0.1`.
        #[clap(long = "dataset", required = true)]
        datasets: Vec<String>,
    },
    /// Print the task graph of a specification as a Mermaid diagram.
    Graph {
        #[clap(flatten)]
        input: Input,
    },
}

#[derive(Args, Debug)]
struct Input {
    /// Specification file.
    spec: PathBuf,

    /// Inline table, as NAME=FILE where FILE holds a JSON array of rows.
    #[clap(long = "table", value_name = "NAME=FILE")]
    tables: Vec<String>,

    #[clap(long)]
    row_limit: Option<usize>,

    /// Fold interactive datasets instead of leaving them to the client.
    #[clap(long)]
    no_interactivity: bool,
}

impl Input {
    fn spec(&self) -> anyhow::Result<Value> {
        read_json(&self.spec)
    }

    fn tables(&self) -> anyhow::Result<InlineTables> {
        let mut tables = HashMap::new();
        for arg in &self.tables {
            let (name, path) = arg
                .split_once('=')
                .ok_or_else(|| anyhow!("Expected NAME=FILE, found '{arg}'"))?;
            let rows = read_json(Path::new(path))?;
            let table = Table::from_rows(&rows).with_context(|| format!("Invalid table '{name}'"))?;
            tables.insert(name.to_string(), table);
        }
        Ok(tables)
    }

    fn options(&self) -> PreTransformOptions {
        PreTransformOptions {
            row_limit: self.row_limit,
            preserve_interactivity: !self.no_interactivity,
            ..PreTransformOptions::default()
        }
    }
}

/// The runtime shared by everything this process evaluates.
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime(config: RuntimeConfig) -> anyhow::Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }

    let runtime = Runtime::new(config)?;
    Ok(RUNTIME.get_or_init(|| runtime))
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse_dataset(arg: &str) -> anyhow::Result<(String, Vec<u32>)> {
    match arg.split_once('@') {
        None => Ok((arg.to_string(), Vec::new())),
        Some((name, scope)) => {
            let scope = scope
                .split('.')
                .map(|part| part.parse::<u32>().with_context(|| format!("Invalid scope in '{arg}'")))
                .collect::<anyhow::Result<_>>()?;
            Ok((name.to_string(), scope))
        }
    }
}

fn report(warnings: &[Warning]) {
    for warning in warnings {
        tracing::warn!(kind = warning.kind(), "{warning}");
    }
}

fn print(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    kasane::init_logging();
    let cli = Cli::parse();

    let mut config = RuntimeConfig::default();
    if let Some(workers) = cli.workers {
        config.worker_threads = workers;
    }

    match cli.command {
        Command::PreTransform { input, extract } => {
            let runtime = runtime(config)?;
            let (spec, tables, options) = (input.spec()?, input.tables()?, input.options());

            match extract {
                Some(threshold) => {
                    let result = runtime.pre_transform_extract(&spec, &tables, &options, threshold)?;
                    report(&result.warnings);
                    print(&result)
                }
                None => {
                    let result = runtime.pre_transform_spec(&spec, &tables, &options)?;
                    report(&result.warnings);
                    print(&result.spec)
                }
            }
        }
        Command::Datasets { input, datasets } => {
            let runtime = runtime(config)?;
            let datasets = datasets
                .iter()
                .map(|arg| parse_dataset(arg))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let result =
                runtime.pre_transform_datasets(&input.spec()?, &datasets, &input.tables()?, &input.options())?;
            report(&result.warnings);

            let rows: Vec<Value> = result.tables.iter().map(Table::to_rows).collect();
            print(&rows)
        }
        Command::Graph { input } => {
            let options = CompileOptions {
                preserve_interactivity: !input.no_interactivity,
            };
            let chart = compile(&input.spec()?, &input.tables()?, options)?;
            report(chart.warnings());
            println!("{}", chart.graph());
            Ok(())
        }
    }
}
