//! `stackctl` binary

mod commands;
mod logging;

use clap::{Arg, ArgAction, ArgMatches, Command};
use commands::{Context, DeployOptions};
use logging::LogFormat;
use stackctl_core::report::ExitCode;
use stackctl_core::StackError;
use std::path::PathBuf;
use tracing::Instrument;

fn cli() -> Command {
    Command::new("stackctl")
        .version(stackctl_core::VERSION)
        .about("Tiered deployment orchestrator for a multi-service stack")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("env")
                .long("env")
                .global(true)
                .default_value(".env")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Environment file with KEY=value lines"),
        )
        .arg(
            Arg::new("manifest")
                .long("manifest")
                .global(true)
                .default_value("stack.toml")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Stack manifest"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output format (logs go to stderr)"),
        )
        .subcommand(Command::new("validate").about("Validate the environment and the manifest"))
        .subcommand(Command::new("plan").about("Print the tier plan"))
        .subcommand(
            Command::new("deploy")
                .about("Provision, roll out the services and optionally cut over certificates")
                .arg(
                    Arg::new("skip-provision")
                        .long("skip-provision")
                        .action(ArgAction::SetTrue)
                        .help("Do not create directories, network or volumes"),
                )
                .arg(
                    Arg::new("with-certs")
                        .long("with-certs")
                        .action(ArgAction::SetTrue)
                        .help("Run the certificate cutover after a successful rollout"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the summary as JSON"),
                ),
        )
        .subcommand(
            Command::new("certs").about("Run the certificate cutover").arg(
                Arg::new("force")
                    .long("force")
                    .action(ArgAction::SetTrue)
                    .help("Reissue even if the installed certificate is current"),
            ),
        )
        .subcommand(
            Command::new("status").about("Show runtime status of every service").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Output as JSON"),
            ),
        )
}

fn path_arg(matches: &ArgMatches, name: &str) -> PathBuf {
    matches.get_one::<PathBuf>(name).cloned().unwrap_or_default()
}

async fn dispatch(matches: &ArgMatches) -> Result<ExitCode, StackError> {
    let ctx = Context {
        env: path_arg(matches, "env"),
        manifest: path_arg(matches, "manifest"),
    };
    match matches.subcommand() {
        Some(("validate", _)) => commands::validate(&ctx),
        Some(("plan", _)) => commands::plan(&ctx),
        Some(("deploy", args)) => {
            let options = DeployOptions {
                skip_provision: args.get_flag("skip-provision"),
                with_certs: args.get_flag("with-certs"),
                json: args.get_flag("json"),
            };
            commands::deploy(&ctx, options).await
        }
        Some(("certs", args)) => commands::certs(&ctx, args.get_flag("force")).await,
        Some(("status", args)) => commands::status(&ctx, args.get_flag("json")).await,
        _ => Err(StackError::Internal("unknown command".to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let format = matches
        .get_one::<String>("log-format")
        .and_then(|f| LogFormat::parse(f))
        .unwrap_or(LogFormat::Text);
    logging::init(format)?;

    let run_id = uuid::Uuid::new_v4();
    let command = matches.subcommand_name().unwrap_or_default().to_string();
    let span = tracing::info_span!("run", %run_id, command = %command);

    let code = match dispatch(&matches).instrument(span).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "{command} failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code.code());
}
