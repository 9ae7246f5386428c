use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use insight_core::{
    config::SourceKind, pipeline, sources::DEFAULT_MAX_PARALLEL_LOADS, InsightConfig,
    InsightReport,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ranks what changed between two reporting periods", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline and print the ranked insights
    Run(RunArgs),
    /// Parse a configuration file and show what it resolves to
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the TOML configuration
    #[arg(long, short)]
    config: PathBuf,
    /// Directory that relative file sources resolve against (defaults to the config's directory)
    #[arg(long)]
    base_path: Option<PathBuf>,
    /// Override `report.top_n` (0 keeps every insight)
    #[arg(long)]
    top_n: Option<usize>,
    /// Override `report.min_impact`
    #[arg(long)]
    min_impact: Option<f64>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
    /// Also write the JSON report to this file
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Table,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_env("INSIGHT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Validate(args) => validate(args),
    }
}

fn load_config(path: &Path) -> Result<InsightConfig> {
    InsightConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn max_parallel_loads() -> Result<usize> {
    match std::env::var("INSIGHT_MAX_PARALLEL_LOADS") {
        Ok(value) => value
            .parse()
            .with_context(|| format!("INSIGHT_MAX_PARALLEL_LOADS must be a number, got '{value}'")),
        Err(_) => Ok(DEFAULT_MAX_PARALLEL_LOADS),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(top_n) = args.top_n {
        config.report.top_n = top_n;
    }
    if let Some(min_impact) = args.min_impact {
        config.report.min_impact = min_impact;
    }

    let base_path = args.base_path.unwrap_or_else(|| {
        args.config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    });

    let report = pipeline::run(&config, &base_path, max_parallel_loads()?)
        .await
        .context("insight run failed")?;

    let json = serde_json::to_string_pretty(&report)?;
    if let Some(output) = &args.output {
        std::fs::write(output, &json)
            .with_context(|| format!("failed to write report to {}", output.display()))?;
        info!(path = %output.display(), "wrote report");
    }

    match args.format {
        OutputFormat::Json => println!("{json}"),
        OutputFormat::Table => println!("{}", render_table(&report)),
    }
    Ok(())
}

fn validate(args: ValidateArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let window = config.report.comparison.window()?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Source", "Type", "Date column", "Dimensions", "Metrics"]);
    for source in &config.dataset.sources {
        let name = if source.name == config.dataset.primary_source {
            format!("{} (primary)", source.name)
        } else {
            source.name.clone()
        };
        let kind = match &source.kind {
            SourceKind::Csv { path } => format!("csv: {}", path.display()),
            SourceKind::Sql { .. } => "sql".to_string(),
            SourceKind::Database { connection, table } => {
                format!("database: {:?} {}", connection.driver, table)
            }
        };
        table.add_row(vec![
            name,
            kind,
            source.date_col.clone(),
            source.dimensions.join(", "),
            source.metrics.join(", "),
        ]);
    }

    println!("{table}");
    println!("Metrics:         {}", config.all_metrics()?.join(", "));
    println!("KPIs:            {}", pipeline::effective_kpis(&config)?.join(", "));
    println!("Dimensions:      {}", config.report.primary_dims.join(", "));
    println!("Current period:  {}", window.current);
    println!("Previous period: {}", window.previous);
    Ok(())
}

fn render_table(report: &InsightReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "#", "Dimensions", "Metric", "Current", "Previous", "Delta", "Delta %", "Impact", "Dir",
        ]);

    for (rank, insight) in report.insights.iter().enumerate() {
        let dimensions = insight
            .dimensions
            .iter()
            .map(|(name, value)| match value {
                serde_json::Value::String(text) => format!("{name}={text}"),
                other => format!("{name}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", ");

        table.add_row(vec![
            (rank + 1).to_string(),
            dimensions,
            insight.metric.clone(),
            insight.current_value.to_string(),
            insight.previous_value.to_string(),
            insight.delta.to_string(),
            format!("{:.2}", insight.delta_pct),
            insight.impact_score.to_string(),
            insight.direction.to_string(),
        ]);
    }
    table
}
