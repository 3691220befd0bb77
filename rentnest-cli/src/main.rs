//! RentNest command-line client
//!
//! Headless driver for the session core: sign in, call the API through the
//! session middleware, inspect or reset the device identifier.
//!
//! Usage:
//!   rentnest login --email sam@example.com --remember
//!   rentnest whoami
//!   rentnest get /bookings
//!   rentnest logout
//!
//! The volatile tier lives only as long as the process, so a session that
//! should outlive one command needs `--remember`.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use rentnest_core::auth::{ApiRequest, Credentials, SessionManager, SignupRequest};
use rentnest_core::settings::{self, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "rentnest")]
#[command(about = "RentNest session client", version)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long, global = true, env = "RENTNEST_API_URL")]
    api_url: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "RENTNEST_PASSWORD", hide_env_values = true)]
        password: String,
        /// Keep the session after this command exits
        #[arg(long)]
        remember: bool,
    },
    /// Create an account and sign in
    Signup {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "RENTNEST_PASSWORD", hide_env_values = true)]
        password: String,
        /// guest or host
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        remember: bool,
    },
    /// End the session here and on the server
    Logout,
    /// Show the signed-in identity
    Whoami,
    /// Run the startup probe and print the session flags
    Probe,
    /// GET an API path through the session middleware
    Get { path: String },
    /// Show or reset the device identifier
    Device {
        #[arg(long, conflicts_with = "forget")]
        regenerate: bool,
        #[arg(long)]
        forget: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;
    debug!("RentNest CLI v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => settings::load_config_from(path),
        None => settings::load_config(),
    };
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }

    let manager = SessionManager::new(config).context("Failed to set up session")?;
    run(&manager, cli.command, cli.config.as_deref()).await
}

async fn run(
    manager: &SessionManager,
    command: Command,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    match command {
        Command::Login {
            email,
            password,
            remember,
        } => {
            let identity = manager
                .login(&Credentials { email, password }, remember)
                .await
                .context("Login failed")?;
            println!("Signed in as {}", display_name(&identity));
            if !remember {
                println!("(session not remembered; pass --remember to keep it)");
            }
        }
        Command::Signup {
            username,
            email,
            password,
            role,
            remember,
        } => {
            let request = SignupRequest {
                username,
                email,
                password,
                role,
            };
            let identity = manager
                .signup(&request, remember)
                .await
                .context("Signup failed")?;
            println!("Account created, signed in as {}", display_name(&identity));
        }
        Command::Logout => {
            manager.logout().await;
            println!("Signed out");
        }
        Command::Whoami => {
            let snapshot = manager.initialize().await;
            match manager.get_decoded_identity() {
                Some(identity) if snapshot.logged_in => {
                    println!("{}", serde_json::to_string_pretty(&identity)?);
                }
                _ => println!("Not signed in"),
            }
        }
        Command::Probe => {
            let snapshot = manager.initialize().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Get { path } => {
            if !path.starts_with('/') {
                bail!("API paths start with '/': {}", path);
            }
            manager.initialize().await;
            let response = manager.wrap(ApiRequest::get(path.as_str())).await?;
            println!("HTTP {}", response.status);
            match serde_json::from_str::<serde_json::Value>(&response.body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", response.body),
            }
        }
        Command::Device { regenerate, forget } => {
            if forget {
                manager.forget_device();
                println!("Device identifier removed");
            } else if regenerate {
                println!("{}", manager.regenerate_device_id());
            } else {
                println!("{}", manager.device_id());
            }
        }
        Command::Config { init } => show_config(manager.config(), config_path, init)?,
    }

    Ok(())
}

fn init_logging(log_file: Option<&std::path::Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn show_config(config: &SessionConfig, path: Option<&std::path::Path>, init: bool) -> Result<()> {
    if init {
        let written = match path {
            Some(path) => {
                settings::save_config_to(config, path)?;
                path.to_path_buf()
            }
            None => settings::save_config(config)?,
        };
        info!("Wrote {}", written.display());
        println!("Config written to {}", written.display());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn display_name(identity: &rentnest_core::auth::Identity) -> String {
    match (&identity.username, &identity.role) {
        (Some(name), Some(role)) => format!("{} ({})", name, role),
        (Some(name), None) => name.clone(),
        _ => identity.subject_id.clone(),
    }
}
