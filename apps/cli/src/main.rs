//! keyshift - command-line driver for the rotation engine
//!
//! Configurations live in a JSON state file and published secrets in an
//! owner-only JSON secrets file; both paths come from the layered settings.
//! Logs go to stderr so stdout stays machine-readable.

mod cli;
mod settings;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keyshift_rotation::{
    ConfigurationId, ConnectionAdapter, ConnectionRef, Orchestrator, PasswordRequirements,
    RequiredCounts, RotationConfiguration, RotationScheduler, SecretScope, SecretString,
    SecretsMapping, SqlCredentialsParameters, SqlDriver, TargetType,
};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command, GenerateArgs, RegisterArgs};
use crate::settings::{Overrides, Settings};
use crate::store::{JsonFileRepository, JsonFileSecretStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log = match &cli.log_level {
        Some(level) => keyshift_log::init_with(keyshift_log::Config::from_env().with_level(level)),
        None => keyshift_log::auto_init(),
    }
    .context("failed to initialize logging")?;

    if let Command::Generate(args) = &cli.command {
        return generate(args);
    }

    let settings = Settings::load(
        &cli.config,
        &Overrides {
            state_file: cli.state_file.clone(),
            secrets_file: cli.secrets_file.clone(),
        },
    )?;
    let orchestrator = Arc::new(build_orchestrator(&settings));

    match cli.command {
        Command::Generate(_) => Ok(()),
        Command::Register(args) => register(&orchestrator, args).await,
        Command::Issue { id, retry } => {
            let id = ConfigurationId::new(id);
            let config = if retry {
                orchestrator.issue_with_retry(&id).await?
            } else {
                orchestrator.issue(&id).await?
            };
            print_json(&config)
        }
        Command::Rotate { id, retry } => {
            let id = ConfigurationId::new(id);
            let config = if retry {
                orchestrator.rotate_with_retry(&id).await?
            } else {
                orchestrator.rotate(&id).await?
            };
            print_json(&config)
        }
        Command::Revoke { id, retry } => {
            let id = ConfigurationId::new(id);
            if retry {
                orchestrator.revoke_with_retry(&id).await?;
            } else {
                orchestrator.revoke(&id).await?;
            }
            println!("revoked {id}");
            Ok(())
        }
        Command::Reconcile { id: Some(id) } => {
            let config = orchestrator.reconcile(&ConfigurationId::new(id)).await?;
            print_json(&config)
        }
        Command::Reconcile { id: None } => {
            let mut failed = 0usize;
            for report in orchestrator.reconcile_all().await? {
                match report.result {
                    Ok(config) => println!("{}: {}", report.id, config.status),
                    Err(e) => {
                        failed += 1;
                        println!("{}: failed: {e}", report.id);
                    }
                }
            }
            anyhow::ensure!(failed == 0, "{failed} configuration(s) could not be reconciled");
            Ok(())
        }
        Command::Status { id: Some(id) } => {
            let config = orchestrator.status(&ConfigurationId::new(id)).await?;
            print_json(&config)
        }
        Command::Status { id: None } => {
            let mut configs = orchestrator.repository().list().await?;
            configs.sort_by(|a, b| a.id.cmp(&b.id));
            print_json(&configs)
        }
        Command::Run => run(orchestrator).await,
    }
}

fn build_orchestrator(settings: &Settings) -> Orchestrator {
    let adapter = ConnectionAdapter::new(Arc::new(settings.resolver()), Arc::new(SqlDriver::new()));
    Orchestrator::new(
        Arc::new(JsonFileRepository::new(&settings.state_file)),
        Arc::new(JsonFileSecretStore::new(&settings.secrets_file)),
        adapter,
    )
    .with_settings(settings.engine.clone())
}

fn generate(args: &GenerateArgs) -> Result<()> {
    let requirements = PasswordRequirements {
        length: args.length,
        required: RequiredCounts {
            lowercase: args.lowercase,
            uppercase: args.uppercase,
            digits: args.digits,
            symbols: args.symbols,
        },
        allowed_symbols: args.allowed_symbols.clone(),
    };
    for _ in 0..args.count {
        let password: SecretString = keyshift_rotation::generate(&requirements)?;
        password.expose_secret(|p| println!("{p}"));
    }
    Ok(())
}

async fn register(orchestrator: &Orchestrator, args: RegisterArgs) -> Result<()> {
    let mut parameters = SqlCredentialsParameters::new(args.username1, args.username2);
    if let Some(statement) = args.statement {
        parameters = parameters.with_rotation_statement(statement);
    }
    if let Some(length) = args.password_length {
        parameters = parameters.with_password_requirements(PasswordRequirements {
            length,
            ..PasswordRequirements::default()
        });
    }

    let id = args.id.map_or_else(ConfigurationId::generate, ConfigurationId::new);
    let mut config = RotationConfiguration::new(
        id,
        TargetType::SqlCredentials,
        ConnectionRef::new(args.connection),
        parameters.to_value()?,
        SecretsMapping::new(args.user_key, args.password_key),
        SecretScope::new(args.project, args.environment).with_path(args.path),
    );
    if let Some(interval) = args.interval {
        config = config.with_rotation_interval(interval);
    }

    let config = orchestrator.register(config).await?;
    print_json(&config)
}

async fn run(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping scheduler");
        }
        signal.cancel();
    });

    RotationScheduler::new(orchestrator)
        .run(shutdown)
        .await
        .context("scheduler stopped with an error")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
