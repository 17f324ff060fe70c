mod cli;
mod config;
mod logging;
mod setup;

use anyhow::Result;
use aquabot_ai::{InquiryResponder, IntentClassifier};
use aquabot_auth::RotationTrigger;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let _guard = logging::init(&config.logging, cli.verbose)?;

    if let Commands::Show = cli.command {
        let store = setup::build_store(&config);
        match store.load().await? {
            Some(credential) => println!("{} ({})", credential.masked(), store.path().display()),
            None => println!("No credential stored in {}", store.path().display()),
        }
        return Ok(());
    }

    let services = setup::prepare(&config).await?;

    match cli.command {
        Commands::Classify { message } => {
            let intent = IntentClassifier::new(services.llm).classify(&message).await;
            println!("{}", intent);
        }
        Commands::Ask { question } => {
            let mut responder = InquiryResponder::new(services.llm);
            if let Some(prompt) = &config.llm.system_prompt {
                responder = responder.with_system_prompt(prompt.clone());
            }
            if let Some(temperature) = config.llm.temperature {
                responder = responder.with_temperature(temperature);
            }
            println!("{}", responder.answer(&question).await);
        }
        Commands::Rotate => {
            let credential = services.coordinator.rotate(RotationTrigger::Manual).await?;
            println!(
                "Rotated to {} (account {})",
                credential.masked(),
                credential.source_account_id().unwrap_or("unknown")
            );
        }
        Commands::Show => {}
    }

    Ok(())
}
