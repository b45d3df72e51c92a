use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pulse_core::config::{RateLimitConfig, RetryConfig};
use pulse_core::{
    BackgroundTasks, DataDir, FailurePolicy, SearchService, ServiceConfig, StopWords, SystemClock, Tokenizer,
};
use pulse_server::{build_app, seed};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    FailClosed,
    FailOpen,
}

impl From<Policy> for FailurePolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::FailClosed => FailurePolicy::FailClosed,
            Policy::FailOpen => FailurePolicy::FailOpen,
        }
    }
}

#[derive(Parser)]
#[command(name = "pulse-server")]
#[command(about = "Real-time search service", long_about = None)]
struct Args {
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
    /// Directory holding the documents and the search keyspace
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    /// Stop-word file, one word per line (built-in English list if omitted)
    #[arg(long)]
    stopwords: Option<PathBuf>,
    /// JSON/JSONL file or directory to load at startup
    #[arg(long)]
    seed: Option<PathBuf>,
    /// Results per search page
    #[arg(long, default_value_t = 10)]
    page_size: usize,
    /// Rate limiter bucket size
    #[arg(long, default_value_t = 5.0)]
    rate_capacity: f64,
    /// Rate limiter refill, tokens per second
    #[arg(long, default_value_t = 0.5)]
    rate_refill: f64,
    /// What to do when the rate limiter's store fails
    #[arg(long, value_enum, default_value_t = Policy::FailClosed)]
    rate_failure: Policy,
    /// Seconds between retry queue drains
    #[arg(long, default_value_t = 30)]
    retry_interval: u64,
    /// Attempts before a retry job is dead-lettered
    #[arg(long, default_value_t = 3)]
    retry_attempts: u32,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            page_size: self.page_size,
            rate_limit: RateLimitConfig {
                capacity: self.rate_capacity,
                refill_rate: self.rate_refill,
                failure_policy: self.rate_failure.into(),
            },
            retry: RetryConfig {
                interval: Duration::from_secs(self.retry_interval),
                max_attempts: self.retry_attempts,
                ..RetryConfig::default()
            },
            ..ServiceConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let stopwords = match &args.stopwords {
        Some(path) => StopWords::from_file(path)
            .with_context(|| format!("loading stop words from {}", path.display()))?,
        None => StopWords::builtin(),
    };
    tracing::info!(count = stopwords.len(), "stop words loaded");

    let data = DataDir::open(&args.data_dir)
        .with_context(|| format!("opening data directory {}", args.data_dir.display()))?;
    let service = Arc::new(SearchService::new(
        data.keyspace(),
        data.documents(),
        Arc::new(SystemClock),
        Tokenizer::new(stopwords),
        args.service_config(),
    ));

    if let Some(input) = &args.seed {
        seed::seed(&service, input)
            .await
            .with_context(|| format!("seeding from {}", input.display()))?;
    }

    let tasks = BackgroundTasks::spawn(&service);
    let admin_token = std::env::var("ADMIN_TOKEN").ok();
    let app = build_app(service, admin_token);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tasks.shutdown().await;
    data.flush()?;
    tracing::info!("server stopped");
    Ok(())
}
