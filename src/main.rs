//! Command-line entry point: HTTP server, one-shot analysis and
//! connectivity checks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tarifdoc::config::Settings;
use tarifdoc::engine::{AnalyzeRequest, Engine};
use tarifdoc::server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "tarifdoc",
    about = "Decide Pauschale vs. TARDOC billing for Swiss ambulatory encounters",
    version
)]
struct Cli {
    /// Path to config.ini
    #[arg(long, global = true, default_value = "config.ini")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Host address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Analyze one encounter text and print the response as JSON
    Analyze {
        /// Free-text encounter description
        text: String,
        /// Response language (de, fr, it)
        #[arg(long, default_value = "de")]
        lang: String,
        /// ICD codes providing diagnosis context (repeatable)
        #[arg(long = "icd")]
        icd: Vec<String>,
        /// Require ICD conditions to be backed by provided diagnoses
        #[arg(long)]
        use_icd: bool,
        /// Patient age in years
        #[arg(long)]
        age: Option<i64>,
        /// Patient gender
        #[arg(long)]
        gender: Option<String>,
    },
    /// Check connectivity to the configured LLM providers
    Health,
    /// Show version and tariff catalogue version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tarifdoc=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config).context("loading configuration")?;

    match cli.command {
        Commands::Serve { host, port } => {
            let engine = Engine::new(settings).context("booting engine")?;
            let host = host.unwrap_or_else(|| engine.settings.host.clone());
            let port = port.unwrap_or(engine.settings.port);
            serve(AppState::new(Arc::new(engine)), &host, port).await
        }
        Commands::Analyze {
            text,
            lang,
            icd,
            use_icd,
            age,
            gender,
        } => {
            let engine = Engine::new(settings).context("booting engine")?;
            let response = engine
                .analyze(AnalyzeRequest {
                    input_text: text,
                    lang: Some(lang),
                    icd,
                    use_icd: Some(use_icd),
                    age,
                    gender,
                    ..Default::default()
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::Health => {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()?;
            let mut failures = 0usize;
            for (name, provider) in &settings.providers {
                let started = std::time::Instant::now();
                let result = client.get(&provider.base_url).send().await;
                let elapsed = started.elapsed().as_millis();
                match result {
                    Ok(resp) => println!("{name}: reachable (HTTP {}, {elapsed}ms)", resp.status()),
                    Err(err) => {
                        failures += 1;
                        let reason = if err.is_timeout() {
                            "timeout"
                        } else if err.is_connect() {
                            "connect error"
                        } else {
                            "error"
                        };
                        println!("{name}: {reason}");
                    }
                }
            }
            if failures > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Version => {
            let engine = Engine::new(settings).context("booting engine")?;
            println!(
                "tarifdoc {} (tariff {})",
                env!("CARGO_PKG_VERSION"),
                engine.tariff_version()
            );
            if let Some(size) = engine.embedding_index_size() {
                println!("embedding index: {size} entries");
            }
            Ok(())
        }
    }
}
