//! deployit CLI tool.

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "deployit")]
#[command(about = "Submit and track deployit deployments", long_about = None)]
#[command(version)]
struct Cli {
    /// API server URL
    #[arg(long, env = "DEPLOYIT_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a repository for build and deployment
    Submit {
        /// Git remote URL
        repo_url: String,
        /// Display name of the repository
        #[arg(long)]
        name: Option<String>,
        /// Branch to deploy
        #[arg(long)]
        branch: Option<String>,
        /// Directory to build from, relative to the repository root
        #[arg(long)]
        build_path: Option<String>,
        /// Follow the job until it finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// Show the state of a job
    Status {
        /// Job ID
        job_id: String,
    },
    /// Print the log of a job
    Logs {
        /// Job ID
        job_id: String,
        /// Keep printing new lines until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Validate a deployit configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = deployit_config::system::DEFAULT_CONFIG_FILE)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            repo_url,
            name,
            branch,
            build_path,
            wait,
        } => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            let request = deployit_core::deploy::DeployRequest {
                repo_url,
                repo_name: name,
                branch,
                build_path,
            };
            commands::deploy::submit(&client, request, wait).await?;
        }
        Commands::Status { job_id } => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            commands::deploy::status(&client, &job_id).await?;
        }
        Commands::Logs { job_id, follow } => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            commands::deploy::logs(&client, &job_id, follow).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
