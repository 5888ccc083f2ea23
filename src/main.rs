use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use pathprobe::config::Config;
use pathprobe::listener::Listener;
use pathprobe::net;
use pathprobe::protocol::Estimator;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed (rho, sigma) path estimation", long_about = None)]
struct Args {
    /// JSON config file (defaults are used for missing fields)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the sender side of the estimation
    Send {
        /// Own address, must appear in the peers file
        address: IpAddr,
        /// Listener receiving the probe streams
        listener: IpAddr,
        /// File listing all senders, one address per line
        peers: PathBuf,
        /// Where to write the JSON report (default: <address>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a Listener
    Listen {
        /// Address to serve on
        address: IpAddr,
    },
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_status(&e));
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Exit status for a refused command line: 0 for help and version output.
fn usage_status(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        1
    } else {
        0
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    match args.role {
        Role::Send {
            address,
            listener,
            peers,
            output,
        } => {
            check_local(address);
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.json", address)));
            send(address, listener, &peers, &output, &config, running)
        }
        Role::Listen { address } => {
            check_local(address);
            let mut listener = Listener::bind(address, &config)?;
            listener.run(running)
        }
    }
}

fn send(
    address: IpAddr,
    listener: IpAddr,
    peers_file: &Path,
    output: &Path,
    config: &Config,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let (peers, index) = net::load_peers(peers_file, address)?;
    info!("Sender #{} of {}, listener {}", index, peers.len(), listener);

    let mut estimator = Estimator::bind(address, listener, peers, index, config, running)?;
    let outcome = estimator.run();
    let report = estimator.close();

    for line in report.summary() {
        println!("{}", line);
    }
    report.write_json(output)?;
    if report.is_complete() {
        info!("Report written to {}", output.display());
    } else {
        warn!("Partial report written to {}", output.display());
    }

    outcome.map_err(|e| anyhow!("Measurement failed: {}", e))
}

fn check_local(address: IpAddr) {
    match net::is_local_address(address) {
        Ok(true) => {}
        Ok(false) => warn!("{} is not assigned to any local interface", address),
        Err(e) => warn!("Cannot list local interfaces: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_arguments_exit_with_failure() {
        let err = Args::try_parse_from(["pathprobe", "send", "not-an-address"]).unwrap_err();
        assert_eq!(usage_status(&err), 1);
        let err = Args::try_parse_from(["pathprobe"]).unwrap_err();
        assert_eq!(usage_status(&err), 1);
    }

    #[test]
    fn test_help_exits_with_success() {
        let err = Args::try_parse_from(["pathprobe", "--help"]).unwrap_err();
        assert_eq!(usage_status(&err), 0);
    }

    #[test]
    fn test_send_arguments() {
        let args = Args::try_parse_from([
            "pathprobe",
            "send",
            "10.0.0.1",
            "10.0.0.9",
            "peers.txt",
            "--output",
            "out.json",
        ])
        .unwrap();
        match args.role {
            Role::Send {
                address, output, ..
            } => {
                assert_eq!(address, "10.0.0.1".parse::<IpAddr>().unwrap());
                assert_eq!(output, Some(PathBuf::from("out.json")));
            }
            Role::Listen { .. } => panic!("parsed as listen"),
        }
    }
}
