//! Command dispatch. Each subcommand is one straight-line operation; the
//! first failing step ends the invocation.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use common::OpError;

use crate::chat::{self, ChatOptions};
use crate::deploy::{AppStatus, AzCli, AzureTarget, DeploymentController};
use crate::image::{render_dockerfile, BuildMode, ImageBuilder};
use crate::launch::LaunchPlan;
use crate::util::cmd::{resolve_deployment, Args, AzureArgs, Commands, EndpointArgs, ScaleAction};
use crate::util::config::Config;
use crate::util::process::{CommandRunner, SystemRunner};
use crate::verify::{VerificationReport, Verifier};

pub async fn run(args: Args) -> Result<()> {
    run_with(args, &SystemRunner).await
}

/// Runs one subcommand with every `docker`, `az` and server process going
/// through `runner`.
pub async fn run_with<R: CommandRunner>(args: Args, runner: &R) -> Result<()> {
    let file = args.load_config()?;

    match args.command {
        Commands::Dockerfile { server, image, output } => {
            let config = resolve_deployment(&file, &server, None, None)?;
            let dockerfile = render_dockerfile(&image.resolve(&file, config));
            write_or_print(&dockerfile, output.as_deref())
        }

        Commands::Build { server, image, azure, context, remote } => {
            let config = resolve_deployment(&file, &server, None, None)?;
            let spec = image.resolve(&file, config);
            let target = azure.resolve(&file);
            let image_ref = ImageBuilder::new(runner, context)
                .build(&spec, &target, build_mode(remote))
                .await?;
            println!("{}", image_ref);
            Ok(())
        }

        Commands::Provision { azure } => {
            let handle = controller(&file, &azure, runner).provision().await?;
            println!(
                "Environment {} ready in resource group {}",
                handle.environment_name, handle.resource_group
            );
            Ok(())
        }

        Commands::Deploy { server, resources, azure } => {
            let config = resolve_deployment(&file, &server, Some(&resources), None)?;
            let handle = controller(&file, &azure, runner).deploy(&config).await?;
            println!("{}", handle.endpoint()?);
            Ok(())
        }

        Commands::Up {
            server,
            resources,
            image,
            azure,
            context,
            remote,
            skip_verify,
            timeout_secs,
        } => {
            let config = resolve_deployment(&file, &server, Some(&resources), None)?;
            let target = azure.resolve(&file);
            let spec = image.resolve(&file, config.clone());

            ImageBuilder::new(runner, context)
                .build(&spec, &target, build_mode(remote))
                .await?;
            let ctl = DeploymentController::new(AzCli::with_runner(runner), target);
            ctl.provision().await?;
            let handle = ctl.deploy(&config).await?;
            let endpoint = handle.endpoint()?;
            println!("{}", endpoint);

            if skip_verify {
                return Ok(());
            }
            let endpoint_args = EndpointArgs {
                endpoint: Some(endpoint),
                timeout_secs,
            };
            verify(&endpoint_args, &config.model, None, runner).await
        }

        Commands::Scale { action, azure } => {
            let ctl = controller(&file, &azure, runner);
            let scale = match action {
                ScaleAction::Up => ctl.scale_up().await?,
                ScaleAction::Down => ctl.scale_down().await?,
            };
            println!(
                "{}: min replicas {}, max replicas {}",
                ctl.target().app_name,
                scale.min_replicas,
                scale.max_replicas
            );
            Ok(())
        }

        Commands::Status { azure, json } => {
            let status = controller(&file, &azure, runner).status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }

        Commands::Logs { azure, tail } => {
            let logs = controller(&file, &azure, runner).logs(tail).await?;
            print!("{}", logs);
            Ok(())
        }

        Commands::Verify { server, azure, endpoint } => {
            let config = resolve_deployment(&file, &server, None, None)?;
            let target = azure.resolve(&file);
            verify(&endpoint, &config.model, Some(target), runner).await
        }

        Commands::Chat {
            server,
            azure,
            endpoint,
            system,
            temperature,
            max_tokens,
            message,
        } => {
            let config = resolve_deployment(&file, &server, None, None)?;
            let url = resolve_endpoint(&endpoint, Some(azure.resolve(&file)), runner).await?;
            let verifier = Verifier::new(&url, endpoint.timeout())?;
            let options = ChatOptions {
                model: config.model,
                system,
                temperature,
                max_tokens,
            };
            let reply = chat::ask(&verifier, &options, &message).await?;
            println!("{}", reply);
            Ok(())
        }

        Commands::Launch { server, gpu, cache_dir, dry_run } => {
            let config = resolve_deployment(&file, &server, None, gpu)?;
            let cache_dir = cache_dir.or_else(|| file.image.cache_dir.clone());
            let plan = LaunchPlan::new(&config, cache_dir.as_deref())?;
            if dry_run {
                println!("{}", plan.command);
                return Ok(());
            }
            plan.run(runner).await
        }
    }
}

/// Exit status for a failed invocation: the category's code for an
/// [`OpError`], 1 for anything else.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<OpError>()
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

fn controller<'r, R: CommandRunner>(
    file: &Config,
    azure: &AzureArgs,
    runner: &'r R,
) -> DeploymentController<AzCli<&'r R>> {
    DeploymentController::new(AzCli::with_runner(runner), azure.resolve(file))
}

fn build_mode(remote: bool) -> BuildMode {
    if remote {
        BuildMode::Registry
    } else {
        BuildMode::Local
    }
}

fn write_or_print(content: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
            info!("Wrote {:?}", path);
        }
        None => print!("{}", content),
    }
    Ok(())
}

/// Explicit `--endpoint` first, otherwise the FQDN of the deployed app.
async fn resolve_endpoint<R: CommandRunner>(
    args: &EndpointArgs,
    target: Option<AzureTarget>,
    runner: &R,
) -> Result<String> {
    if let Some(endpoint) = &args.endpoint {
        return Ok(endpoint.clone());
    }
    let target = target.unwrap_or_default();
    let handle = DeploymentController::new(AzCli::with_runner(runner), target)
        .handle()
        .await?;
    Ok(handle.endpoint()?)
}

async fn verify<R: CommandRunner>(
    args: &EndpointArgs,
    model: &str,
    target: Option<AzureTarget>,
    runner: &R,
) -> Result<()> {
    let url = resolve_endpoint(args, target, runner).await?;
    let report = Verifier::new(&url, args.timeout())?.verify(model).await;
    print_report(&report);
    report.into_result().map(|_| ())
}

fn print_report(report: &VerificationReport) {
    let status = |s: Option<u16>| s.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
    println!("endpoint:          {}", report.endpoint);
    println!("GET  /v1/models:   {} ({})", status(report.models_status), report.models.join(", "));
    println!("POST /v1/chat/...: {} ({} choice(s))", status(report.chat_status), report.choices);
    if let Some(reply) = &report.reply {
        println!("reply:             {}", reply.trim());
    }
    println!("result:            {}", if report.passed { "PASS" } else { "FAIL" });
}

fn print_status(status: &AppStatus) {
    let endpoint = status
        .handle
        .fqdn
        .as_deref()
        .map(|f| format!("https://{}", f))
        .unwrap_or_else(|| "-".to_string());
    println!("app:          {}", status.handle.application_name);
    println!("endpoint:     {}", endpoint);
    println!(
        "state:        {} / {}",
        status.provisioning_state.as_deref().unwrap_or("-"),
        status.running_status.as_deref().unwrap_or("-")
    );
    println!(
        "replicas:     {} running (min {}, max {})",
        status.replicas.len(),
        status.scale.min_replicas,
        status.scale.max_replicas
    );
    for replica in &status.replicas {
        println!(
            "  {} {}",
            replica.name,
            replica.running_state.as_deref().unwrap_or("-")
        );
    }
}
