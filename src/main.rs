use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use patient_portal::comms::local_api;
use patient_portal::portal::config::Config;
use patient_portal::utils::logging;

#[derive(Parser)]
#[command(name = "patient-portal", version, about = "Patient portal web front end")]
struct AppCli {
    /// Config file path (JSON). Environment variables are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the portal HTTP server
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Render HTML templates instead of JSON page contexts
        #[arg(long, default_value_t = false)]
        with_ui: bool,
    },
    /// Print the effective configuration with secrets redacted
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            debug!(path, "loading config file");
            Config::from_file(path)
        }
        None => Config::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error.
    dotenv::dotenv().ok();
    logging::init("info")?;

    let args = AppCli::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Serve {
        port: 8080,
        with_ui: true,
    }) {
        Commands::Serve { port, with_ui } => {
            info!(
                version = patient_portal::VERSION,
                upstream = %config.api_base_url,
                "Starting patient portal on port {port}"
            );
            local_api::serve(config, port, with_ui).await?;
        }
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}
