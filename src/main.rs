#[macro_use]
extern crate log;

mod agent;
mod collector;
mod command;
mod config;
mod discovery;
mod discovery_policy;
mod events;
mod facts_engine;
mod gatherers;
mod identity;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::command::{CommandExecutor, TokioCommandExecutor};
use crate::config::{Cli, Command, FactsCommand, Settings};
use crate::gatherers::FactRequest;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match cli.options.load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let level = match settings.log_level() {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(cli.command, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: Settings) -> Result<()> {
    match command {
        Command::Id => {
            let agent_id = identity::agent_id(
                settings.force_agent_id.as_deref(),
                Path::new(identity::MACHINE_ID_PATH),
            )?;
            println!("{}", agent_id);
        }
        Command::Start => {
            let agent_id = identity::agent_id(
                settings.force_agent_id.as_deref(),
                Path::new(identity::MACHINE_ID_PATH),
            )?;
            let config = settings.agent_config(agent_id)?;

            info!(
                "starting agent {} (version {})",
                config.collector_config.agent_id,
                env!("CARGO_PKG_VERSION")
            );

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));

            agent::start(config, cancel).await?;
        }
        Command::Facts { command } => facts(command, &settings).await?,
    }
    Ok(())
}

async fn facts(command: FactsCommand, settings: &Settings) -> Result<()> {
    let cancel = CancellationToken::new();
    let executor: Arc<dyn CommandExecutor> = Arc::new(TokioCommandExecutor::default());
    let (registry, plugins) =
        agent::load_gatherers(executor, &settings.plugins_folder, &cancel).await?;

    let result = match command {
        FactsCommand::List => {
            for gatherer in registry.inspect_gatherers() {
                println!("{}", gatherer);
            }
            Ok(())
        }
        FactsCommand::Gather { gatherer, argument } => {
            gather_one(&registry, &gatherer, &argument).await
        }
    };

    plugins.shutdown();
    result
}

async fn gather_one(
    registry: &gatherers::GatherersRegistry,
    gatherer_name: &str,
    argument: &str,
) -> Result<()> {
    let gatherer = registry.get_gatherer(gatherer_name)?;

    let request = FactRequest {
        argument: argument.to_owned(),
        check_id: String::new(),
        gatherer: gatherer_name.to_owned(),
        name: gatherer_name.to_owned(),
    };

    let facts = gatherer.gather(vec![request]).await?;
    let fact = facts
        .first()
        .ok_or_else(|| anyhow!("gatherer {} returned no fact", gatherer_name))?;

    println!(
        "{}",
        serde_json::to_string_pretty(fact).context("could not print the gathered fact")?
    );
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                warn!("could not listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, stopping"),
        _ = terminate => info!("termination requested, stopping"),
    }

    cancel.cancel();
}
