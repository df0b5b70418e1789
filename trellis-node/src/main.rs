// Trellis node: a peer in a self-organizing tree overlay distributing
// conjecture checking over numeric ranges.

mod checker;
mod config;
mod connection;
mod console;
mod reactor;
mod results;

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: trellis-node <port> <resultsPath> [<parentHost> <parentPort>]";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("trellis-node {VERSION}");
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (port, results_dir, parent) = parse_args(&args)?;
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let commands = console::spawn(cfg.command_queue);
        let reactor = reactor::Reactor::bind(port, results_dir, parent, commands, &cfg).await?;
        reactor.run().await
    })
}

type Invocation = (u16, PathBuf, Option<(String, u16)>);

fn parse_args(args: &[String]) -> anyhow::Result<Invocation> {
    match args {
        [port, path] => Ok((parse_port(port)?, PathBuf::from(path), None)),
        [port, path, host, parent_port] => Ok((
            parse_port(port)?,
            PathBuf::from(path),
            Some((host.clone(), parse_port(parent_port)?)),
        )),
        _ => anyhow::bail!("{USAGE}"),
    }
}

fn parse_port(token: &str) -> anyhow::Result<u16> {
    token
        .parse()
        .with_context(|| format!("invalid port {token:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn root_invocation() {
        let (port, path, parent) = parse_args(&strings(&["7777", "results"])).unwrap();
        assert_eq!(port, 7777);
        assert_eq!(path, PathBuf::from("results"));
        assert!(parent.is_none());
    }

    #[test]
    fn attached_invocation() {
        let (port, _, parent) =
            parse_args(&strings(&["7778", "results", "10.0.0.5", "7777"])).unwrap();
        assert_eq!(port, 7778);
        assert_eq!(parent, Some(("10.0.0.5".into(), 7777)));
    }

    #[test]
    fn wrong_arity_rejected() {
        assert!(parse_args(&strings(&["7777"])).is_err());
        assert!(parse_args(&strings(&["7777", "results", "host"])).is_err());
    }

    #[test]
    fn bad_port_rejected() {
        assert!(parse_args(&strings(&["seven", "results"])).is_err());
        assert!(parse_args(&strings(&["70000", "results"])).is_err());
    }
}
