use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zlv_core::RecordKind;
use zlv_import::{ImportConfig, ImportError, ImportPipeline, MatchPolicy, Report, Reporter};
use zlv_sources::{
    repository_for, FileSource, ObjectStorageSource, SourceConfig, SourceFormat, StreamOptions,
};
use zlv_storage::{MemorySink, OwnerSink, PgSink};

const EXIT_FAILURE: u8 = 1;
const EXIT_ABORTED: u8 = 2;
const PG_MAX_CONNECTIONS: u32 = 8;

#[derive(Debug, Parser)]
#[command(name = "zlv")]
#[command(about = "Housing stock import reconciliation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one extract of the given kind (owner, housing, housing_owner, building)
    Import(ImportArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    kind: RecordKind,

    /// Comma-separated department codes, or `all`
    #[arg(long, default_value = "all")]
    departments: String,

    /// Local CSV or JSONL extract
    #[arg(long, short = 'f', conflicts_with = "bucket", required_unless_present = "bucket")]
    file: Option<PathBuf>,

    /// Object storage bucket holding the extract
    #[arg(long, requires = "key")]
    bucket: Option<String>,

    #[arg(long)]
    key: Option<String>,

    #[arg(long, env = "AWS_REGION", default_value = "eu-west-3")]
    region: String,

    /// S3-compatible endpoint; AWS when omitted
    #[arg(long, env = "ZLV_S3_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long)]
    access_key_id: Option<String>,

    #[arg(long)]
    secret_access_key: Option<String>,

    /// Inferred from the file name or key when omitted
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    #[arg(long, default_value_t = ',')]
    delimiter: char,

    #[arg(long, value_enum, default_value_t = Output::Text)]
    output: Output,

    /// Stop at the first invalid record
    #[arg(long)]
    abort_early: bool,

    /// YAML matching policy
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Postgres sink; an in-memory sink is used when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Write the in-memory sink contents to this JSON file after the run
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Csv,
    Jsonl,
}

impl From<FormatArg> for SourceFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Csv => SourceFormat::Csv,
            FormatArg::Jsonl => SourceFormat::Jsonl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Import(args) => import(args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn import(args: ImportArgs) -> Result<ExitCode> {
    let mut config = ImportConfig::from_env();
    config.abort_early |= args.abort_early;
    if args.database_url.is_some() {
        config.database_url = args.database_url.clone();
    }

    let policy = match &args.policy {
        Some(path) => MatchPolicy::load(path)
            .with_context(|| format!("loading match policy from {}", path.display()))?,
        None => MatchPolicy::default(),
    };
    let source = source_config(&args)?;
    let options = StreamOptions::parse(&args.departments);

    let memory = Arc::new(MemorySink::new());
    let sink: Arc<dyn OwnerSink> = match &config.database_url {
        Some(url) => {
            if args.snapshot.is_some() {
                warn!("--snapshot only applies to the in-memory sink; ignoring it");
            }
            Arc::new(PgSink::connect(url, PG_MAX_CONNECTIONS, config.sink_timeout).await?)
        }
        None => memory.clone(),
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current chunk");
            let _ = cancel_tx.send(true);
        }
    });

    let repository = repository_for(&source, args.kind, config.channel_capacity);
    let pipeline = ImportPipeline::new(sink, config.clone())
        .with_policy(policy)
        .with_cancellation(cancel_rx);
    let reporter = Reporter::new();
    info!(source = %source.location(), kind = %args.kind, "importing");
    let outcome = pipeline.run(repository.as_ref(), &options, &reporter).await;

    print_report(&reporter.report(), args.output)?;

    if config.database_url.is_none() {
        if let Some(path) = &args.snapshot {
            let written = memory
                .write_snapshot(path)
                .await
                .with_context(|| format!("writing snapshot to {}", path.display()))?;
            info!(path = %written.display(), "snapshot written");
        }
    }

    match outcome {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err @ ImportError::AbortEarly { .. }) => {
            eprintln!("error: {err}");
            Ok(ExitCode::from(EXIT_ABORTED))
        }
        Err(err) => Err(err).with_context(|| format!("importing {}", source.location())),
    }
}

fn source_config(args: &ImportArgs) -> Result<SourceConfig> {
    let format = args.format.map(SourceFormat::from);
    if let Some(path) = &args.file {
        return Ok(SourceConfig::File(FileSource {
            path: path.clone(),
            format,
            delimiter: args.delimiter,
        }));
    }
    let (Some(bucket), Some(key)) = (&args.bucket, &args.key) else {
        bail!("either --file or --bucket with --key is required");
    };
    Ok(SourceConfig::ObjectStorage(ObjectStorageSource {
        bucket: bucket.clone(),
        key: key.clone(),
        region: args.region.clone(),
        endpoint_url: args.endpoint.clone(),
        access_key_id: args.access_key_id.clone(),
        secret_access_key: args.secret_access_key.clone(),
        session_token: None,
        format,
        delimiter: args.delimiter,
        timeout_secs: 30,
    }))
}

fn print_report(report: &Report, output: Output) -> Result<()> {
    match output {
        Output::Text => println!("{report}"),
        Output::Json => println!("{}", report.to_json().context("serializing report")?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_bucket_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "zlv", "import", "owner", "--file", "a.csv", "--bucket", "b", "--key", "k",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn import_flags_build_a_file_source() {
        let cli = Cli::try_parse_from([
            "zlv",
            "import",
            "housing_owner",
            "--file",
            "links.txt",
            "--format",
            "csv",
            "--delimiter",
            ";",
            "--departments",
            "01,75",
        ])
        .expect("parse");
        let Commands::Import(args) = cli.command;
        assert_eq!(args.kind, RecordKind::HousingOwner);
        match source_config(&args).expect("source") {
            SourceConfig::File(file) => {
                assert_eq!(file.format, Some(SourceFormat::Csv));
                assert_eq!(file.delimiter, ';');
            }
            other => panic!("expected file source, got {other:?}"),
        }
    }

    #[test]
    fn bucket_requires_key() {
        assert!(Cli::try_parse_from(["zlv", "import", "owner", "--bucket", "b"]).is_err());
    }
}
