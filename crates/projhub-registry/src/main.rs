use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use projhub_cloudflare::CloudflareFactory;
use projhub_core::{CallerContext, DevSideConfig};
use projhub_registry::config::{Command, Config};
use projhub_registry::{OpenProjectParams, Registry};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let root_dir = config.root_dir()?;
    let dev_side_config = config.dev_side_config()?;

    let factory = Arc::new(CloudflareFactory::new());
    let registry = Registry::open(&root_dir)?.with_provider_factory(factory.clone());

    let ctx = CallerContext::new();
    cancel_on_ctrl_c(ctx.clone());

    let open_params = OpenProjectParams {
        dev_side_config,
        max_filesystem_size: config.max_fs_size,
        ..Default::default()
    };
    let result = run(&registry, &factory, &ctx, config.command, open_params).await;

    registry.close()?;
    result
}

async fn run(
    registry: &Registry,
    factory: &CloudflareFactory,
    ctx: &CallerContext,
    command: Command,
    open_params: OpenProjectParams,
) -> anyhow::Result<()> {
    match command {
        Command::Create {
            name,
            template,
            tut,
        } => {
            let id = registry
                .create_project(projhub_core::CreationParams {
                    name,
                    template,
                    add_tut_file: tut,
                })
                .await?;
            println!("{}", id);
        }

        Command::List => {
            for id in registry.list_project_ids()? {
                println!("{}", id);
            }
        }

        Command::Show { id } => {
            let project = registry.open_project(&id, open_params).await?;
            let data = project.data();
            let summary = serde_json::json!({
                "id": project.id(),
                "creationParams": data.creation_params,
                "applications": data.applications,
                "secrets": data.secrets.keys().collect::<Vec<_>>(),
                "members": data.members,
                "devDatabasesDir": project.dev_databases_dir_on_os_fs().await?,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Credentials {
            id,
            bucket,
            provider,
        } => {
            let project = registry.open_project(&id, open_params).await?;
            let credentials = project
                .get_s3_credentials_for_bucket(ctx, &bucket, &provider)
                .await?;
            println!("{}", serde_json::to_string_pretty(&credentials)?);
        }

        Command::DeleteSecretsBucket { id } => {
            let project = registry.open_project(&id, open_params).await?;
            project.delete_secrets_bucket(ctx).await?;
            info!("Secrets bucket of project {} is gone", id);
        }

        Command::ResetCloudflare { id } => {
            let DevSideConfig { cloudflare, .. } = open_params.dev_side_config;
            let cloudflare = cloudflare.context("--dev-config has no cloudflare section")?;
            let provider =
                factory.build(&id, &cloudflare, None, registry.metadata_store().clone())?;
            let deleted = provider.delete_high_perms_tokens(&id).await?;
            println!("deleted {} tokens", deleted);
        }
    }
    Ok(())
}

/// Cancel `ctx` on Ctrl+C so in-flight provider calls return.
fn cancel_on_ctrl_c(ctx: CallerContext) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling");
            ctx.cancel();
        }
    });
}
