//! CLI for driving MixOS machines through their testing backdoor.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;

use clap::{Parser, Subcommand};
use mixos::{CommandOutput, TerminationCause};
use tracing_subscriber::EnvFilter;

/// Exit code when the target reported that it could not run the command.
const EXIT_REMOTE_FAILURE: i32 = 126;
/// Exit code for local failures (bad descriptor, unreachable target, ...).
const EXIT_LOCAL_FAILURE: i32 = 125;

#[derive(Parser)]
#[command(name = "mixos", version, about = "Run commands on a MixOS machine under test")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command on an already running machine.
    Run(run::RunArgs),

    /// Boot a VM, run a command on it, and shut it down.
    Boot(Box<run::BootArgs>),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match cli.command {
        Command::Run(args) => args.run().await,
        Command::Boot(args) => args.run().await,
    };
    let code = match result {
        Ok(out) => {
            report(&out);
            exit_code(out.termination)
        }
        Err(e) => match e.downcast_ref::<mixos::Error>() {
            Some(err) if err.is_remote() => {
                eprintln!("mixos: target reported failure: {err}");
                EXIT_REMOTE_FAILURE
            }
            _ => {
                eprintln!("mixos: {e:#}");
                EXIT_LOCAL_FAILURE
            }
        },
    };
    std::process::exit(code);
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report(out: &CommandOutput) {
    println!("{}", render(out));
}

/// Termination cause followed by the trimmed stdout and stderr.
fn render(out: &CommandOutput) -> String {
    format!(
        "{}\n\nstdout:\n{}\n\nstderr:\n{}",
        out.termination,
        out.stdout_lossy().trim(),
        out.stderr_lossy().trim()
    )
}

/// Shell-style exit code for a remote termination.
const fn exit_code(term: TerminationCause) -> i32 {
    match term {
        TerminationCause::Exited(code) => code,
        TerminationCause::Signal(n) | TerminationCause::Stopped(n) => n.saturating_add(128),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn report_trims_both_ends_of_output() {
        let out = mixos::decode_response(
            br#"{"result":{"run_command":{"exit_code":0,"stdout":"\n  hi\n\n","stderr":" \n"}}}"#,
            mixos::Dialect::Flat,
        )
        .unwrap();
        assert_eq!(render(&out), "exit_code: 0\n\nstdout:\nhi\n\nstderr:\n");
    }

    #[test]
    fn exit_codes_follow_shell_conventions() {
        assert_eq!(exit_code(TerminationCause::Exited(0)), 0);
        assert_eq!(exit_code(TerminationCause::Exited(3)), 3);
        assert_eq!(exit_code(TerminationCause::Signal(9)), 137);
        assert_eq!(exit_code(TerminationCause::Stopped(19)), 147);
        assert_eq!(exit_code(TerminationCause::Unknown(0)), 1);
    }
}
