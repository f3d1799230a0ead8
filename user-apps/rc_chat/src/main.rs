use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rclink::consts::{SYNC_READ, SYNC_WRITE};
use rclink::log::{error, info};
use rclink::utils::trim_line_end;
use rclink::{Config, RcEndpoint, RcError, WorkKind};

/// Typing this instead of a message ends the session.
const EXIT_WORD: &str = "exit";

#[derive(Parser, Debug)]
#[command(name = "rc_chat")]
#[command(version = "0.1")]
#[command(about = "Exchange messages over one RDMA RC connection", long_about = None)]
struct Args {
    /// Server to connect to; listen for a client when omitted
    host: Option<String>,

    /// TCP port of the out-of-band channel
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// IB device to use (first one found by default)
    #[arg(short = 'd', long = "ib-dev")]
    dev: Option<String>,

    /// Port of the IB device
    #[arg(short = 'i', long)]
    ib_port: Option<u8>,

    /// GID index; enables global addressing (required on RoCE)
    #[arg(short = 'g', long)]
    gid_idx: Option<u8>,

    /// JSON config file, overridden by the flags above
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pre-post a receive before moving to RTR
    #[arg(long)]
    receiving_side: bool,
}

fn build_config(args: &Args) -> Result<Config, RcError> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        // the connecting side waits for the listener's sends by default
        None => Config {
            receiving_side: args.host.is_some(),
            ..Default::default()
        },
    };

    if let Some(host) = &args.host {
        config.server_name = Some(host.clone());
    }
    if let Some(port) = args.port {
        config.tcp_port = port;
    }
    if let Some(dev) = &args.dev {
        config.dev_name = Some(dev.clone());
    }
    if let Some(ib_port) = args.ib_port {
        config.ib_port = ib_port;
    }
    if args.gid_idx.is_some() {
        config.gid_idx = args.gid_idx;
    }
    if args.receiving_side {
        config.receiving_side = true;
    }
    config.validate()?;
    Ok(config)
}

enum Round {
    Continue,
    Exit,
}

/// Next line from stdin, or `None` on EOF or the exit word.
fn prompt<I>(lines: &mut I) -> Option<String>
where
    I: Iterator<Item = io::Result<String>>,
{
    print!("> ");
    let _ = io::stdout().flush();
    match lines.next() {
        Some(Ok(line)) => {
            let line = trim_line_end(&line);
            if line == EXIT_WORD {
                None
            } else {
                Some(line.to_string())
            }
        }
        Some(Err(err)) => {
            error!("failed to read stdin: {}", err);
            None
        }
        None => None,
    }
}

fn server_round<I>(endpoint: &mut RcEndpoint, lines: &mut I) -> Result<Round, RcError>
where
    I: Iterator<Item = io::Result<String>>,
{
    let msg = match prompt(lines) {
        Some(msg) => msg,
        None => return Ok(Round::Exit),
    };
    endpoint.buffer()?.write_message(&msg)?;
    println!("Server: Message is: '{}'", endpoint.buffer()?.read_message());

    endpoint.sync(SYNC_READ)?;
    // the client reads our buffer, then overwrites it
    endpoint.sync(SYNC_WRITE)?;

    println!(
        "Server: Contents of client's buffer: '{}'",
        endpoint.buffer()?.read_message()
    );
    Ok(Round::Continue)
}

fn client_round<I>(endpoint: &mut RcEndpoint, lines: &mut I) -> Result<Round, RcError>
where
    I: Iterator<Item = io::Result<String>>,
{
    endpoint.sync(SYNC_READ)?;

    endpoint.post_send(WorkKind::RdmaRead)?;
    endpoint.poll_completion()?;
    println!(
        "Client: Contents of server's buffer: '{}'",
        endpoint.buffer()?.read_message()
    );

    let msg = match prompt(lines) {
        Some(msg) => msg,
        None => return Ok(Round::Exit),
    };
    endpoint.buffer()?.write_message(&msg)?;
    endpoint.post_send(WorkKind::RdmaWrite)?;
    endpoint.poll_completion()?;

    endpoint.sync(SYNC_WRITE)?;
    Ok(Round::Continue)
}

fn run(config: &Config) -> Result<(), RcError> {
    let mut endpoint = RcEndpoint::connect(config)?;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        let round = if config.is_server() {
            server_round(&mut endpoint, &mut lines)
        } else {
            client_round(&mut endpoint, &mut lines)
        };
        match round {
            Ok(Round::Continue) => {}
            Ok(Round::Exit) => break,
            Err(RcError::CM(err)) if err.is_peer_closed() => {
                info!("peer closed the connection");
                break;
            }
            Err(err) => return Err(err),
        }
    }

    endpoint.teardown();
    Ok(())
}

fn main() {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    };
    print!("{}", config.summary());

    if let Err(err) = run(&config) {
        error!("test failed: {}", err);
        std::process::exit(1);
    }
    info!("test result is 0");
}
