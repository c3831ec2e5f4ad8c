//! QuorumKV replica server executable.

use std::fs;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use quorumkv::{
    logger_init, pf_error, pf_info, pf_warn, Ed25519Crypto, GenericReplica,
    KvError, PbftReplica, PeerAddress, ReplicaSetup,
};
use serde::Deserialize;
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind_ip: IpAddr,

    /// TOML file listing the bootstrap peers as `[[peers]]` tables with
    /// fields host, port, http_port, name and uuid.
    #[arg(short, long)]
    peers: String,

    /// My name. If the peers file lists it, I start as a member of the
    /// initial configuration; otherwise I join the running cluster.
    #[arg(short, long)]
    name: String,

    /// Host other replicas and clients reach me at, when joining.
    #[arg(long, default_value_t = String::from("127.0.0.1"))]
    host: String,

    /// Consensus port, when joining.
    /// This port must be available at process launch.
    #[arg(long, default_value_t = 52700)]
    port: u16,

    /// Client-facing port, when joining.
    /// This port must be available at process launch.
    #[arg(long, default_value_t = 52701)]
    http_port: u16,

    /// Hex-encoded ed25519 secret seed; my uuid is its public key.
    /// Required for initial members. A joiner without one gets a fresh key.
    #[arg(short, long)]
    key_seed: Option<String>,

    /// Generate a fresh key, print its seed and uuid, and exit.
    #[arg(long, default_value_t = false)]
    gen_key: bool,

    /// Protocol-specific server configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

/// Contents of the bootstrap peers file.
#[derive(Debug, Deserialize)]
struct PeersFile {
    peers: Vec<PeerAddress>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success
    /// or `Err(KvError)` on any error.
    fn sanitize(&self) -> Result<(), KvError> {
        if self.gen_key {
            Ok(())
        } else if self.name.is_empty() {
            Err(KvError::msg("empty replica name"))
        } else if self.port <= 1024 {
            Err(KvError::msg(format!("invalid port {}", self.port)))
        } else if self.http_port <= 1024 {
            Err(KvError::msg(format!("invalid http_port {}", self.http_port)))
        } else if self.port == self.http_port {
            Err(KvError::msg(format!("port == http_port {}", self.port)))
        } else if self.threads < 2 {
            Err(KvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }

    /// Resolves my address record and identity against the bootstrap peers.
    fn resolve_identity(
        &self,
        peers: &[PeerAddress],
    ) -> Result<(PeerAddress, Ed25519Crypto), KvError> {
        let crypto = match self.key_seed {
            Some(ref seed) => Ed25519Crypto::from_seed_hex(seed)?,
            None => {
                if peers.iter().any(|p| p.name == self.name) {
                    return Err(KvError::msg(format!(
                        "initial member '{}' needs its key_seed",
                        self.name
                    )));
                }
                let crypto = Ed25519Crypto::generate();
                pf_warn!(self.name; "generated key seed {}", crypto.seed_hex());
                crypto
            }
        };

        let me = match peers.iter().find(|p| p.name == self.name) {
            Some(listed) => {
                if listed.uuid != crypto.uuid() {
                    return Err(KvError::msg(format!(
                        "key_seed does not match listed uuid of '{}'",
                        self.name
                    )));
                }
                listed.clone()
            }
            None => PeerAddress::new(
                &self.host,
                self.port,
                self.http_port,
                &self.name,
                crypto.uuid(),
            ),
        };
        Ok((me, crypto))
    }
}

/// Parses the bootstrap peers file content.
fn parse_peers(content: &str) -> Result<Vec<PeerAddress>, KvError> {
    let file: PeersFile = toml::from_str(content)?;
    if file.peers.is_empty() {
        return Err(KvError::msg("peers file lists no peers"));
    }
    Ok(file.peers)
}

/// Actual main function of QuorumKV replica server.
fn server_main() -> Result<(), KvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    if args.gen_key {
        let crypto = Ed25519Crypto::generate();
        println!("key_seed = \"{}\"", crypto.seed_hex());
        println!("uuid = \"{}\"", crypto.uuid());
        return Ok(());
    }

    let peers = parse_peers(&fs::read_to_string(&args.peers)?)?;
    let (me, crypto) = args.resolve_identity(&peers)?;
    let joining = !peers.iter().any(|p| p.uuid == me.uuid);
    pf_info!(me.name; "starting as {} ({})", me.uuid,
                      if joining { "joiner" } else { "initial member" });

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        Some(args.config.replace('+', "\n"))
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    let prefix = me.name.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(prefix; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, setup the server replica, and start the main
        // event loop logic
        runtime.block_on(async move {
            let setup = ReplicaSetup {
                bind_ip: args.bind_ip,
                me,
                peers,
                crypto,
            };
            let mut replica =
                PbftReplica::new_and_setup(setup, config_str.as_deref())
                    .await?;

            replica.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), KvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of QuorumKV replica server.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> Result<CliArgs, KvError> {
        Ok(CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            peers: "peers.toml".into(),
            name: "alpha".into(),
            host: "127.0.0.1".into(),
            port: 52700,
            http_port: 52701,
            key_seed: None,
            gen_key: false,
            config: "".into(),
            threads: 2,
        })
    }

    #[test]
    fn sanitize_valid() -> Result<(), KvError> {
        assert_eq!(valid_args()?.sanitize(), Ok(()));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_ports() -> Result<(), KvError> {
        let mut args = valid_args()?;
        args.port = 1023;
        assert!(args.sanitize().is_err());
        let mut args = valid_args()?;
        args.http_port = 52700;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), KvError> {
        let mut args = valid_args()?;
        args.threads = 1;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn parse_peers_file() -> Result<(), KvError> {
        let peers = parse_peers(
            r#"
            [[peers]]
            host = "10.0.0.1"
            port = 52700
            http_port = 52701
            name = "alpha"
            uuid = "aa"

            [[peers]]
            host = "10.0.0.2"
            port = 52700
            http_port = 52701
            name = "beta"
            uuid = "bb"
            "#,
        )?;
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].endpoint(), "10.0.0.2:52700");
        assert!(parse_peers("peers = []").is_err());
        Ok(())
    }

    #[test]
    fn identity_of_initial_member() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let listed =
            PeerAddress::new("10.0.0.1", 52700, 52701, "alpha", crypto.uuid());
        let mut args = valid_args()?;
        assert!(args.resolve_identity(&[listed.clone()]).is_err());

        args.key_seed = Some(crypto.seed_hex());
        let (me, _) = args.resolve_identity(&[listed.clone()])?;
        assert_eq!(me, listed);

        args.key_seed = Some(Ed25519Crypto::generate().seed_hex());
        assert!(args.resolve_identity(&[listed]).is_err());
        Ok(())
    }

    #[test]
    fn identity_of_joiner() -> Result<(), KvError> {
        let other = PeerAddress::new("10.0.0.1", 52700, 52701, "beta", "bb");
        let args = valid_args()?;
        let (me, crypto) = args.resolve_identity(&[other])?;
        assert_eq!(me.name, "alpha");
        assert_eq!(me.uuid, crypto.uuid());
        assert_eq!(me.client_endpoint(), "127.0.0.1:52701");
        Ok(())
    }
}
