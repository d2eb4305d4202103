//! `service add` / `service rm` / `service show`: manage account services
//! such as alerting.

use super::builtin::parse_with;
use super::{Command, CommandContext, CommandFlags, Outcome};
use crate::cookies::CookieManager;
use crate::repository::Repository;
use crate::services::ServiceConnector;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use clap::Parser;
use std::collections::BTreeMap;
use tracing::info;

fn connector(ctx: &CommandContext<'_>) -> anyhow::Result<ServiceConnector> {
    let token = ctx
        .cookies
        .filter(|cookies| cookies.has_auth_token())
        .map(CookieManager::get_auth_token)
        .transpose()
        .context("could not read auth token")?
        .filter(|token| !token.is_empty())
        .ok_or_else(|| anyhow!("login required to manage services"))?;
    Ok(ServiceConnector::new(token).with_endpoint(ctx.services_endpoint))
}

#[derive(Debug, Parser)]
#[command(name = "service add", about = "Enable an account service")]
struct AddArgs {
    /// Service name
    service: Option<String>,
    /// Service configuration entries
    #[arg(value_name = "KEY=VALUE")]
    settings: Vec<String>,
}

/// `service add <name> [key=value...]`: configures an offered service, then
/// enables it.
#[derive(Debug, Clone, Default)]
pub struct ServiceAdd {
    service: String,
    settings: BTreeMap<String, String>,
}

#[async_trait]
impl Command for ServiceAdd {
    fn flags(&self) -> CommandFlags {
        CommandFlags::BEFORE_REPOSITORY_OPEN
    }

    fn parse(&mut self, args: &[String]) -> anyhow::Result<()> {
        let parsed: AddArgs = parse_with("service add", args)?;
        let Some(service) = parsed.service else {
            bail!("no service specified");
        };
        let mut settings = BTreeMap::new();
        for entry in parsed.settings {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    settings.insert(key.to_string(), value.to_string());
                }
                _ => bail!("invalid argument {entry:?}"),
            }
        }
        self.service = service;
        self.settings = settings;
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext<'_>, _repository: Option<&Repository>) -> anyhow::Result<Outcome> {
        let connector = connector(ctx)?;
        connector.ensure_service_exists(&self.service).await?;
        connector
            .set_service_configuration(&self.service, &self.settings)
            .await
            .with_context(|| format!("could not configure service {}", self.service))?;
        connector
            .set_service_status(&self.service, true)
            .await
            .with_context(|| format!("could not enable service {}", self.service))?;
        info!(service = %self.service, "service enabled");
        Ok(Outcome::ok())
    }
}

#[derive(Debug, Parser)]
#[command(name = "service rm", about = "Disable an account service")]
struct RmArgs {
    /// Service name
    service: Option<String>,
    #[arg(hide = true)]
    extra: Vec<String>,
}

/// `service rm <name>`: disables a service and clears its configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceRm {
    service: String,
}

#[async_trait]
impl Command for ServiceRm {
    fn flags(&self) -> CommandFlags {
        CommandFlags::BEFORE_REPOSITORY_OPEN
    }

    fn parse(&mut self, args: &[String]) -> anyhow::Result<()> {
        let parsed: RmArgs = parse_with("service rm", args)?;
        let Some(service) = parsed.service else {
            bail!("no service specified");
        };
        if let Some(extra) = parsed.extra.first() {
            bail!("invalid argument {extra:?}");
        }
        self.service = service;
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext<'_>, _repository: Option<&Repository>) -> anyhow::Result<Outcome> {
        let connector = connector(ctx)?;
        connector
            .set_service_status(&self.service, false)
            .await
            .with_context(|| format!("could not disable service {}", self.service))?;
        connector
            .set_service_configuration(&self.service, &BTreeMap::new())
            .await
            .with_context(|| format!("could not clear service {}", self.service))?;
        info!(service = %self.service, "service disabled");
        Ok(Outcome::ok())
    }
}

#[derive(Debug, Parser)]
#[command(name = "service show", about = "Show an account service")]
struct ShowArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
    /// Service name
    service: Vec<String>,
}

/// `service show [-json] <name>`: prints a service's status and configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceShow {
    service: String,
    json: bool,
}

#[async_trait]
impl Command for ServiceShow {
    fn flags(&self) -> CommandFlags {
        CommandFlags::BEFORE_REPOSITORY_OPEN
    }

    fn parse(&mut self, args: &[String]) -> anyhow::Result<()> {
        let parsed: ShowArgs = parse_with("service show", args)?;
        let [service] = parsed.service.as_slice() else {
            bail!(
                "invalid number of arguments, expected 1 but got {}",
                parsed.service.len()
            );
        };
        self.service = service.clone();
        self.json = parsed.json;
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext<'_>, _repository: Option<&Repository>) -> anyhow::Result<Outcome> {
        let connector = connector(ctx)?;
        let enabled = connector.get_service_status(&self.service).await?;
        let configuration = connector.get_service_configuration(&self.service).await?;

        if self.json {
            let mut value = serde_json::Map::new();
            value.insert(
                self.service.clone(),
                serde_json::json!({ "enabled": enabled, "configuration": configuration }),
            );
            ctx.console.println(serde_json::to_string_pretty(&value)?);
            return Ok(Outcome::ok());
        }
        ctx.console.println(format!(
            "{}: {}",
            self.service,
            if enabled { "enabled" } else { "disabled" }
        ));
        for (key, value) in &configuration {
            ctx.console.println(format!("  {key}: {value}"));
        }
        Ok(Outcome::ok())
    }
}
