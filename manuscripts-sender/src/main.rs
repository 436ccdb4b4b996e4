use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use manuscripts_sender::{
    MdnsBrowser, SubmitOptions, list_receivers, resolve_by_name, submit_file,
    submit_url_for_address,
};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "manuscripts-send", about = "Find receivers and submit manuscripts")]
struct SendArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List receivers on the local network.
    List {
        #[arg(long, default_value_t = 3)]
        wait_secs: u64,
        /// Print records as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Send a file to a receiver.
    Send {
        file: PathBuf,
        /// Your name as the receiver will see it.
        #[arg(long = "from")]
        sender_name: String,
        /// Receiver display name to look up on the network.
        #[arg(long, conflicts_with = "address", required_unless_present = "address")]
        to: Option<String>,
        /// Skip discovery and connect to host:port directly.
        #[arg(long)]
        address: Option<String>,
        #[arg(long, env = "MANUSCRIPTS_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = SendArgs::parse();
    if let Err(err) = run(args.command).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::List { wait_secs, json } => {
            let browser = MdnsBrowser::new()?;
            let records = list_receivers(&browser, Duration::from_secs(wait_secs)).await?;
            if records.is_empty() && !json {
                println!("no receivers found");
            }
            for record in records {
                if json {
                    println!("{}", serde_json::to_string(&record)?);
                } else {
                    println!(
                        "{:<32} {:<22} {:<8} {}",
                        record.display_name,
                        format!("{}:{}", record.host, record.port),
                        record.mode,
                        if record.requires_passphrase {
                            "passphrase"
                        } else {
                            "open"
                        }
                    );
                }
            }
        }
        Command::Send {
            file,
            sender_name,
            to,
            address,
            passphrase,
            wait_secs,
        } => {
            let url = match (address, to) {
                (Some(address), _) => submit_url_for_address(&address),
                (None, Some(name)) => {
                    let browser = MdnsBrowser::new()?;
                    resolve_by_name(&browser, &name, Duration::from_secs(wait_secs))
                        .await?
                        .ok_or_else(|| format!("no receiver named {name:?} found"))?
                        .submit_url()
                }
                (None, None) => return Err("either --to or --address is required".into()),
            };

            let mut options = SubmitOptions::new(sender_name);
            if let Some(passphrase) = passphrase {
                options = options.with_passphrase(passphrase);
            }
            let receipt = submit_file(&url, &file, &options).await?;
            println!(
                "stored as {} ({} bytes, session {})",
                receipt.stored_name, receipt.size_bytes, receipt.session_id
            );
        }
    }
    Ok(())
}
