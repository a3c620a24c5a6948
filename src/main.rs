//! tincan
//!
//! Dataplane agent of a peer-to-peer overlay VPN. Connects to its
//! controller over an abstract Unix-domain socket, then bridges a local
//! TAP device to one remote peer over an ICE-negotiated, encrypted
//! datagram path.

use anyhow::Result;
use clap::{CommandFactory, Parser};
use log::LevelFilter;

use tincan::agent::{Agent, AgentParams};
use tincan::logging::{AgentLogger, LogConfig};

#[derive(Parser)]
#[command(name = "tincan", disable_version_flag = true)]
#[command(about = "Overlay VPN dataplane agent")]
struct Args {
    /// The controller's Unix domain socket name (abstract namespace)
    #[arg(short = 's', value_name = "SOCKETNAME")]
    socket_name: Option<String>,

    /// The tunnel identifier this process will own
    #[arg(short = 't', value_name = "TUNNELID")]
    tunnel_id: Option<String>,

    /// Inline JSON logging configuration applied at startup
    #[arg(short = 'l', value_name = "JSON")]
    log_config: Option<String>,

    /// Display the version number
    #[arg(short = 'v')]
    version: bool,
}

fn run(args: Args) -> Result<()> {
    AgentLogger::init(LevelFilter::Warn);
    if let Some(text) = args.log_config.as_deref() {
        let cfg: LogConfig = serde_json::from_str(text)
            .map_err(|e| anyhow::anyhow!("invalid -l logging configuration: {}", e))?;
        AgentLogger::configure(&cfg)?;
    }
    let params = AgentParams {
        socket_name: args.socket_name.expect("checked by caller"),
        tunnel_id: args.tunnel_id.expect("checked by caller"),
    };
    let agent = Agent::new(&params)?;
    agent.run()?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    if args.version {
        println!("{}", tincan::version_string());
        return;
    }
    if args.socket_name.is_none() || args.tunnel_id.is_none() {
        let _ = Args::command().print_help();
        return;
    }
    if let Err(e) = run(args) {
        eprintln!("{:#}", e);
        std::process::exit(-1);
    }
}
