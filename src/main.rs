use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser};

use csv_loader::config::LoaderConfig;
use csv_loader::ingest::{
    ByteStreamProvider, ChannelSink, FileSource, HttpSource, IngestionContext, IngestionService,
};

#[derive(Parser, Debug)]
#[command(
    name = "csv-loader",
    about = "Load CSV files into an existing Postgres table",
    group(ArgGroup::new("input").required(true).multiple(true).args(["files", "url"]))
)]
struct Args {
    /// Target table, optionally schema-qualified (`schema.table`).
    #[arg(long)]
    table: String,

    /// CSV files to load; each file runs as its own job.
    files: Vec<PathBuf>,

    /// HTTP(S) URLs to stream and load.
    #[arg(long)]
    url: Vec<String>,

    /// Override `LOADER_WORKERS`.
    #[arg(long)]
    workers: Option<usize>,

    /// Override `LOADER_BATCH_SIZE`.
    #[arg(long)]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    csv_loader::init_logger();

    let args = Args::parse();
    let mut config = LoaderConfig::from_env();
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size.max(1);
    }

    let Some(database_url) = config.database_url.clone() else {
        writeln!(io::stderr(), "error: DATABASE_URL must be set")?;
        std::process::exit(2);
    };

    let pool = csv_loader::db::connect(&database_url, &config).await?;
    let (sink, mut reports) = ChannelSink::new();
    let ctx = IngestionContext::postgres(pool.clone(), &config, Arc::new(sink));
    let service = IngestionService::start(Arc::new(ctx), config.workers, config.queue_capacity);

    let http = reqwest::Client::new();
    let mut sources: Vec<Box<dyn ByteStreamProvider>> = Vec::new();
    for path in args.files {
        sources.push(Box::new(FileSource::new(path)));
    }
    for url in args.url {
        sources.push(Box::new(HttpSource::new(http.clone(), url)));
    }

    let mut handles = Vec::with_capacity(sources.len());
    for source in sources {
        handles.push(service.enqueue(args.table.clone(), source).await?);
    }
    for handle in &handles {
        handle.wait().await;
    }
    service.shutdown().await;
    pool.close().await;

    let mut any_fatal = false;
    let mut stdout = io::stdout().lock();
    while let Ok(report) = reports.try_recv() {
        any_fatal |= report.fatal;
        writeln!(stdout, "{}", serde_json::to_string(&report)?)?;
    }

    if any_fatal {
        std::process::exit(1);
    }
    Ok(())
}
