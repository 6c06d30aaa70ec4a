use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "plane-cli")]
#[command(about = "Management CLI for the control plane", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:7070")]
    url: String,

    /// Bearer token, if the API requires one.
    #[arg(short, long, env = "CONTROL_PLANE_API_KEY")]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Version, service states and the last operation report
    Status,
    /// Registered services
    Services,
    /// Aggregate and per-service health
    Health,
    /// Start services and their dependencies (all if none given)
    Startup { targets: Vec<String> },
    /// Stop services and their dependents (all if none given)
    Shutdown {
        targets: Vec<String>,
        /// Skip the graceful drain
        #[arg(long)]
        force: bool,
    },
    /// Restart one service
    Restart { service: String },
    /// Router counters, backends and circuit breakers
    Metrics,
    /// Switch the load-balancing strategy
    Strategy { strategy: String },
    /// Remove cache entries whose key matches a glob pattern
    Invalidate { pattern: String },
    /// Pre-populate the cache for a service from its configured samples
    Warm {
        service: String,
        #[arg(long, default_value_t = 10)]
        sample_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if let Some(key) = &cli.key {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);
    }

    let (method, path, body) = match cli.command {
        Commands::Status => (Method::GET, "/status", None),
        Commands::Services => (Method::GET, "/services", None),
        Commands::Health => (Method::GET, "/health", None),
        Commands::Startup { targets } => (Method::POST, "/startup", Some(json!({ "targets": targets }))),
        Commands::Shutdown { targets, force } => (
            Method::POST,
            "/shutdown",
            Some(json!({ "targets": targets, "graceful": !force })),
        ),
        Commands::Restart { service } => (Method::POST, "/restart", Some(json!({ "service": service }))),
        Commands::Metrics => (Method::GET, "/router/metrics", None),
        Commands::Strategy { strategy } => (Method::PUT, "/router/strategy", Some(json!({ "strategy": strategy }))),
        Commands::Invalidate { pattern } => (Method::POST, "/cache/invalidate", Some(json!({ "pattern": pattern }))),
        Commands::Warm { service, sample_size } => (
            Method::POST,
            "/cache/warm",
            Some(json!({ "service": service, "sample_size": sample_size })),
        ),
    };

    let mut request = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }
    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    let rendered = match serde_json::from_str::<Value>(&text) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => text,
    };

    if status.is_success() {
        println!("{rendered}");
    } else {
        eprintln!("Error: control API returned status {status}");
        eprintln!("{rendered}");
        std::process::exit(1);
    }
    Ok(())
}
