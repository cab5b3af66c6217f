use bloom_tracker::config::{BloomConfig, BloomOptions};
use bloom_tracker::error::{Error, Result};
use bloom_tracker::import::ImportOutcome;
use bloom_tracker::Bloom;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "bloom", version, about = "Bloom materials tracker from the command line")]
struct Cli {
    /// Account email; SUPABASE_URL and SUPABASE_ANON_KEY come from the environment
    #[clap(long, env = "BLOOM_EMAIL")]
    email: String,

    #[clap(long, env = "BLOOM_PASSWORD", hide_env_values = true)]
    password: String,

    /// Prefix of the export filename
    #[clap(long, default_value = "bloom")]
    product: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List clients with log and item counts
    Clients,
    /// Import clients from a CSV file
    Import { file: PathBuf },
    /// Write the full export into a directory
    Export {
        #[clap(default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = BloomConfig::from_env()?;
    let options = BloomOptions::default().with_product_name(&cli.product);
    let (bloom, auth) = Bloom::connect(&config, options)?;
    auth.sign_in_with_password(&cli.email, &cli.password).await?;

    let result = run_command(&bloom, cli.command).await;
    let signed_out = bloom.sign_out().await;
    bloom.shutdown().await?;
    result.and(signed_out)
}

async fn run_command(bloom: &Bloom, command: Command) -> Result<()> {
    let workspace = bloom
        .workspace()
        .ok_or_else(|| Error::auth("not signed in"))?;

    match command {
        Command::Clients => {
            for entry in workspace.client_list().await? {
                println!(
                    "{}\t{}\t{} logs\t{} items\t{}",
                    entry.client.name,
                    entry.client.address,
                    entry.total_logs,
                    entry.total_items,
                    entry.recent_materials.join(", ")
                );
            }
        }
        Command::Import { file } => {
            let report = workspace.import_csv(std::fs::File::open(&file)?).await?;
            for outcome in &report.outcomes {
                if let ImportOutcome::Failed { name, error } = outcome {
                    eprintln!("failed: {}: {}", name, error);
                }
            }
            println!("imported {}, failed {}", report.success, report.failed);
        }
        Command::Export { dir } => {
            let data = workspace.export_data().await?;
            let summary = data.summary();
            println!(
                "{} clients, {} logs, {} items",
                summary.clients, summary.logs, summary.items
            );
            let path = data.write_to_dir(&dir, &bloom.options().product_name)?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}
