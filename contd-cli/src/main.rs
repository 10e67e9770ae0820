//! `contd` command-line client (§6): `run`/`ps`/`kill`/`attach`. Argument
//! parsing and the `run`/`exit` async-main helpers follow `jetsocat`'s own
//! `seahorse`-based CLI, adapted from forwarding pipes to the daemon's RPC
//! surface.

#[macro_use]
extern crate tracing;

mod client;
mod pipes;

use std::future::Future;
use std::io;
use std::time::Duration;

use anyhow::Context as _;
use seahorse::{App, Command, Context, Flag, FlagType};
use uuid::Uuid;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!("{} [subcommand]", env!("CARGO_PKG_NAME")))
        .command(run_command())
        .command(attach_command())
        .command(ps_command())
        .command(kill_command());

    app.run(args);
}

pub fn run<F: Future<Output = anyhow::Result<()>>>(f: F) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;

    let result = rt.block_on(async {
        tokio::select! {
            res = f => res,
            res = tokio::signal::ctrl_c() => res.context("ctrl-c event"),
        }
    });

    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

pub fn exit(res: anyhow::Result<()>) -> ! {
    match res {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("{error:?}");
            std::process::exit(1);
        }
    }
}

fn setup_logger() -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let (non_blocking, guard) = tracing_appender::non_blocking(io::stderr());
    let layer = fmt::layer().with_writer(non_blocking).with_ansi(io::IsTerminal::is_terminal(&io::stderr()));

    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::WARN.into())
        .with_env_var("CONTD_CLI_LOG")
        .from_env()
        .expect("invalid filtering directive from env");

    tracing_subscriber::registry().with(layer).with(env_filter).init();

    guard
}

fn host_flag(c: &Context) -> String {
    c.string_flag("host").unwrap_or_else(|_| "localhost".to_owned())
}

fn parse_container_id(arg: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(arg).with_context(|| format!("'{arg}' is not a valid container id"))
}

// run

fn run_command() -> Command {
    Command::new("run")
        .description("Launch a new container")
        .usage("contd run [--host H] [--hostname N] [--workdir W] [--name M] [--it] [-d] [--share-ns ID] CMD [ARGS...]")
        .flag(Flag::new("host", FlagType::String).description("Daemon host [default: localhost]"))
        .flag(Flag::new("hostname", FlagType::String).description("Container hostname"))
        .flag(Flag::new("workdir", FlagType::String).description("Working directory inside the container"))
        .flag(Flag::new("name", FlagType::String).description("Friendly name for `ps`"))
        .flag(Flag::new("it", FlagType::Bool).description("Interactive: allocate a pty and attach stdio"))
        .flag(Flag::new("d", FlagType::Bool).description("Detached: do not attach after launch"))
        .flag(Flag::new("share-ns", FlagType::String).description("Share namespaces with another container id"))
        .action(run_action)
}

fn run_action(c: &Context) {
    let _guard = setup_logger();

    let result = (|| -> anyhow::Result<()> {
        let host = host_flag(c);
        let hostname = c.string_flag("hostname").unwrap_or_default();
        let workdir = c.string_flag("workdir").unwrap_or_else(|_| "/".to_owned());
        let interactive = c.bool_flag("it");
        let detached = c.bool_flag("d");

        let share_ns = match c.string_flag("share-ns") {
            Ok(value) => Some(parse_container_id(&value)?),
            Err(_) => None,
        };

        let mut args = c.args.iter();
        let cmd = args.next().context("CMD is missing")?.clone();
        let cmd_args: Vec<String> = args.cloned().collect();

        let name = c.string_flag("name").unwrap_or_else(|_| cmd.clone());

        let opts = client::RunOptions {
            name,
            hostname,
            workdir,
            cmd,
            args: cmd_args,
            interactive,
            detached,
            share_ns,
        };

        run(client::run(&host, opts))
    })();

    exit(result);
}

// attach

fn attach_command() -> Command {
    Command::new("attach")
        .description("Attach to a running container's stdio")
        .usage("contd attach [--host H] [--it] CONTAINER_ID")
        .flag(Flag::new("host", FlagType::String).description("Daemon host [default: localhost]"))
        .flag(Flag::new("it", FlagType::Bool).description("Interactive"))
        .action(attach_action)
}

fn attach_action(c: &Context) {
    let _guard = setup_logger();

    let result = (|| -> anyhow::Result<()> {
        let host = host_flag(c);
        let interactive = c.bool_flag("it");
        let container_id = parse_container_id(c.args.first().context("CONTAINER_ID is missing")?)?;

        run(client::attach_standalone(&host, container_id, interactive))
    })();

    exit(result);
}

// ps

fn ps_command() -> Command {
    Command::new("ps")
        .description("List running containers")
        .usage("contd ps [--host H]")
        .flag(Flag::new("host", FlagType::String).description("Daemon host [default: localhost]"))
        .action(ps_action)
}

fn ps_action(c: &Context) {
    let _guard = setup_logger();
    let host = host_flag(c);
    exit(run(client::ps(&host)));
}

// kill

fn kill_command() -> Command {
    Command::new("kill")
        .description("Kill a running container")
        .usage("contd kill [--host H] CONTAINER_ID")
        .flag(Flag::new("host", FlagType::String).description("Daemon host [default: localhost]"))
        .action(kill_action)
}

fn kill_action(c: &Context) {
    let _guard = setup_logger();

    let result = (|| -> anyhow::Result<()> {
        let host = host_flag(c);
        let container_id = parse_container_id(c.args.first().context("CONTAINER_ID is missing")?)?;
        run(client::kill(&host, container_id))
    })();

    exit(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_container_id_accepts_a_canonical_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(parse_container_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn parse_container_id_rejects_garbage() {
        assert!(parse_container_id("not-a-uuid").is_err());
    }
}
