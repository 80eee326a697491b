use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use docshift_core::{ExitStatus, JobId, RollbackStrategy};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod mailbox;

use commands::Context;
use mailbox::ControlCommand;

fn cli() -> Command {
    let job_arg = Arg::new("job")
        .long("job")
        .value_parser(parse_job_id)
        .help("Job id (defaults to the most recent job)");

    Command::new("docshift")
        .version(docshift_core::VERSION)
        .about("Online document migrations with checkpoints and rollback")
        .subcommand_required(true)
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .env("DOCSHIFT_STATE_DIR")
                .default_value(".docshift")
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .help("Directory holding the document store and control files"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Debug logging (unless DOCSHIFT_LOG or RUST_LOG is set)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("start")
                .about("Validate and run a migration job until it finishes")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .required_unless_present("resume")
                        .help("Job file (TOML)"),
                )
                .arg(
                    Arg::new("resume")
                        .long("resume")
                        .value_parser(parse_job_id)
                        .help("Re-attach to a job left running by a crashed process"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show job status, ledger totals and latest health")
                .arg(job_arg.clone())
                .arg(
                    Arg::new("all")
                        .long("all")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("job")
                        .help("List every job"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("pause")
                .about("Pause a running job at the next batch boundary")
                .arg(job_arg.clone()),
        )
        .subcommand(
            Command::new("resume")
                .about("Resume a manually paused job")
                .arg(job_arg.clone()),
        )
        .subcommand(
            Command::new("abort")
                .about("Stop a job and revert everything it wrote")
                .arg(job_arg.clone())
                .arg(config_override()),
        )
        .subcommand(
            Command::new("rollback")
                .about("Stop a job and roll it back with an explicit strategy")
                .arg(job_arg)
                .arg(
                    Arg::new("strategy")
                        .long("strategy")
                        .required(true)
                        .value_parser(parse_strategy)
                        .help("partial, complete or backupRestore"),
                )
                .arg(
                    Arg::new("checkpoint")
                        .long("checkpoint")
                        .value_parser(value_parser!(u64))
                        .help("Checkpoint sequence to roll back to (partial)"),
                )
                .arg(config_override()),
        )
}

fn config_override() -> Arg {
    Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("Job file to rebuild the transform from when no process runs the job")
}

fn parse_job_id(raw: &str) -> Result<JobId, String> {
    raw.parse().map_err(|e| format!("invalid job id '{raw}': {e}"))
}

fn parse_strategy(raw: &str) -> Result<RollbackStrategy, String> {
    raw.parse()
}

fn init_tracing(verbose: bool, json: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("DOCSHIFT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<ExitStatus> {
    let state_dir = matches
        .get_one::<PathBuf>("state-dir")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(".docshift"));
    let ctx = Context::new(state_dir);

    match matches.subcommand() {
        Some(("start", args)) => {
            let config = args.get_one::<PathBuf>("config").cloned();
            let resume = args.get_one::<JobId>("resume").copied();
            ctx.start(config, resume).await
        }
        Some(("status", args)) => {
            let job = args.get_one::<JobId>("job").copied();
            let json = args.get_flag("json");
            if args.get_flag("all") {
                ctx.list(json).await
            } else {
                ctx.status(job, json).await
            }
        }
        Some(("pause", args)) => {
            ctx.control(args.get_one::<JobId>("job").copied(), ControlCommand::Pause, None)
                .await
        }
        Some(("resume", args)) => {
            ctx.control(args.get_one::<JobId>("job").copied(), ControlCommand::Resume, None)
                .await
        }
        Some(("abort", args)) => {
            ctx.control(
                args.get_one::<JobId>("job").copied(),
                ControlCommand::Abort,
                args.get_one::<PathBuf>("config").cloned(),
            )
            .await
        }
        Some(("rollback", args)) => {
            let strategy = args
                .get_one::<RollbackStrategy>("strategy")
                .copied()
                .ok_or_else(|| anyhow::anyhow!("--strategy is required"))?;
            let command = ControlCommand::Rollback {
                strategy,
                checkpoint: args.get_one::<u64>("checkpoint").copied(),
            };
            ctx.control(
                args.get_one::<JobId>("job").copied(),
                command,
                args.get_one::<PathBuf>("config").cloned(),
            )
            .await
        }
        _ => anyhow::bail!("unknown command"),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"), matches.get_flag("log-json"));

    let code = match run(&matches).await {
        Ok(exit) => exit.code(),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn rollback_arguments_parse() {
        let job = JobId::new();
        let matches = cli()
            .try_get_matches_from([
                "docshift",
                "rollback",
                "--strategy",
                "backupRestore",
                "--job",
                &job.to_string(),
                "--checkpoint",
                "12",
            ])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(
            args.get_one::<RollbackStrategy>("strategy"),
            Some(&RollbackStrategy::BackupRestore)
        );
        assert_eq!(args.get_one::<JobId>("job"), Some(&job));
        assert_eq!(args.get_one::<u64>("checkpoint"), Some(&12));
    }

    #[test]
    fn start_needs_config_or_resume() {
        assert!(cli().try_get_matches_from(["docshift", "start"]).is_err());
        assert!(cli()
            .try_get_matches_from(["docshift", "start", "--config", "job.toml"])
            .is_ok());
    }

    #[test]
    fn bad_strategy_is_rejected() {
        assert!(cli()
            .try_get_matches_from(["docshift", "rollback", "--strategy", "sideways"])
            .is_err());
    }
}
