use anyhow::Context;
use clap::{ArgAction, Parser};
use std::io::{self, BufWriter};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use logweave::{open_sources, OutputFormat, PipelineConfig, PipelinePlan};

/// Environment variable naming a default config file
const CONFIG_ENV: &str = "LOGWEAVE_CONFIG";

/// Environment variable holding a tracing filter
const LOG_ENV: &str = "LOGWEAVE_LOG";

#[derive(Parser)]
#[command(name = "logweave")]
#[command(about = "Filter, window and merge structured (JSON lines) log streams")]
#[command(version = "0.1.0")]
#[command(allow_negative_numbers = true)]
struct Args {
    /// Input files; `-` reads standard input
    #[arg(value_name = "FILE", required = true)]
    paths: Vec<String>,

    /// YAML config file (defaults to $LOGWEAVE_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Starlark predicate; records where it is falsy are dropped
    #[arg(short = 'f', long)]
    filter: Option<String>,

    /// Starlark transform applied to every record
    #[arg(long)]
    eval: Option<String>,

    /// Keep lines containing any of these substrings (case-insensitive)
    #[arg(short = 'i', long, action = ArgAction::Append)]
    include: Vec<String>,

    /// Drop lines containing any of these substrings (case-insensitive)
    #[arg(short = 'e', long, action = ArgAction::Append)]
    exclude: Vec<String>,

    /// Keep lines matching any of these regular expressions
    #[arg(long, action = ArgAction::Append)]
    include_regexp: Vec<String>,

    /// Drop lines matching any of these regular expressions
    #[arg(long, action = ArgAction::Append)]
    exclude_regexp: Vec<String>,

    /// Fields holding durations (e.g. `1m 5s`) to convert to milliseconds
    #[arg(long, value_delimiter = ',')]
    duration_ms: Vec<String>,

    /// Keep only these fields
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,

    /// Remove these fields
    #[arg(long, value_delimiter = ',')]
    hide: Vec<String>,

    /// Parse these string fields as embedded JSON
    #[arg(long, value_delimiter = ',')]
    expand: Vec<String>,

    /// Metadata to inject, e.g. `rnum:line file`
    #[arg(short = 'm', long)]
    metadata: Option<String>,

    /// Output format
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Fields printed first, values only
    #[arg(short = 't', long, value_delimiter = ',')]
    txt_head: Vec<String>,

    /// Fields printed right after the head, as name:value
    #[arg(long, value_delimiter = ',')]
    order: Vec<String>,

    /// No blank line after each text record
    #[arg(long)]
    txt_nonl: bool,

    /// Print only head and ordered fields
    #[arg(long)]
    txt_noprop: bool,

    /// Delimiter between head values
    #[arg(long)]
    txt_delim: Option<String>,

    /// Print only the first record for every value of this field
    #[arg(long)]
    distinct_by: Option<String>,

    /// Merge key fields, first present wins
    #[arg(long, value_delimiter = ',')]
    merge: Vec<String>,

    /// Print only the first N records
    #[arg(long, value_name = "N")]
    first: Option<i64>,

    /// Print only the last N records
    #[arg(long, value_name = "N")]
    last: Option<i64>,

    /// Records of context around every match
    #[arg(short = 'c', long, value_name = "N")]
    context: Option<i64>,

    /// Records of context before every match
    #[arg(long, value_name = "N")]
    context_before: Option<i64>,

    /// Records of context after every match
    #[arg(long, value_name = "N")]
    context_after: Option<i64>,

    /// Print evaluation errors instead of skipping them
    #[arg(long)]
    show_errors: bool,

    /// Debug logging on stderr
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    /// Overlay explicitly given flags on top of `config`
    fn apply(self, config: &mut PipelineConfig) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }
        fn set_list(target: &mut Vec<String>, values: Vec<String>) {
            if !values.is_empty() {
                *target = values;
            }
        }

        if self.filter.is_some() {
            config.filter = self.filter;
        }
        if self.eval.is_some() {
            config.eval = self.eval;
        }
        if self.distinct_by.is_some() {
            config.distinct_by = self.distinct_by;
        }
        if self.context_before.is_some() {
            config.context_before = self.context_before;
        }
        if self.context_after.is_some() {
            config.context_after = self.context_after;
        }

        set_list(&mut config.include, self.include);
        set_list(&mut config.exclude, self.exclude);
        set_list(&mut config.include_regexp, self.include_regexp);
        set_list(&mut config.exclude_regexp, self.exclude_regexp);
        set_list(&mut config.duration_ms, self.duration_ms);
        set_list(&mut config.select, self.select);
        set_list(&mut config.hide, self.hide);
        set_list(&mut config.expand, self.expand);
        set_list(&mut config.txt_head, self.txt_head);
        set_list(&mut config.order, self.order);
        set_list(&mut config.merge, self.merge);

        set(&mut config.metadata, self.metadata);
        set(&mut config.format, self.format);
        set(&mut config.txt_delim, self.txt_delim);
        set(&mut config.first, self.first);
        set(&mut config.last, self.last);
        set(&mut config.context, self.context);

        config.txt_nonl |= self.txt_nonl;
        config.txt_noprop |= self.txt_noprop;
        config.show_errors |= self.show_errors;
        config.debug |= self.debug;
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match args.config_path() {
        Some(path) => PipelineConfig::from_yaml_file(&path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => PipelineConfig::default(),
    };
    let paths = args.paths.clone();
    args.apply(&mut config);

    init_tracing(config.debug);

    let plan = PipelinePlan::compile(&config).context("Invalid pipeline")?;
    let sources = open_sources(&paths)?;

    let stdout = io::stdout();
    let mut output = BufWriter::new(stdout.lock());
    let stats = plan.run(sources, &mut output)?;

    tracing::debug!(
        records_output = stats.records_output,
        errors = stats.errors,
        "processing finished in {:?}",
        stats.processing_time
    );

    Ok(())
}
