//! QuorumKV command-line client executable.

use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use quorumkv::{
    logger_init, pf_error, pf_info, ClientEndpoint, DatabaseMsg, DbOutcome,
    Ed25519Crypto, KvError,
};
use rand::seq::SliceRandom;
use tokio::runtime::Builder;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica client-facing addresses 'host:http_port'; one is picked at
    /// random (e.g., '-s host1:52701 -s host2:52701').
    #[arg(short, long)]
    servers: Vec<String>,

    /// Operation to issue: create|read|update|delete|status.
    #[arg(short, long)]
    op: String,

    /// Key operated on.
    #[arg(short, long, default_value_t = String::from(""))]
    key: String,

    /// Value for create and update.
    #[arg(short, long, default_value_t = String::from(""))]
    value: String,

    /// Hex-encoded ed25519 secret seed of my identity; a fresh one is
    /// generated if not given.
    #[arg(long)]
    key_seed: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Reply timeout duration in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(request)` on success
    /// or `Err(KvError)` on any error.
    fn sanitize(&self) -> Result<DatabaseMsg, KvError> {
        if self.servers.is_empty() {
            return Err(KvError::msg("no servers given"));
        } else if self.threads < 2 {
            return Err(KvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        } else if self.timeout_ms == 0 {
            return Err(KvError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
            )));
        }

        let needs_key = self.op != "status";
        if needs_key && self.key.is_empty() {
            return Err(KvError::msg(format!("op '{}' needs a key", self.op)));
        }
        let key = self.key.clone();
        let value = self.value.clone();
        match self.op.as_str() {
            "create" => Ok(DatabaseMsg::Create { key, value }),
            "read" => Ok(DatabaseMsg::Read { key }),
            "update" => Ok(DatabaseMsg::Update { key, value }),
            "delete" => Ok(DatabaseMsg::Delete { key }),
            "status" => Ok(DatabaseMsg::Status),
            _ => Err(KvError::msg(format!("op '{}' unrecognized", self.op))),
        }
    }
}

/// Renders an outcome for printing.
fn describe(outcome: &DbOutcome) -> String {
    match outcome {
        DbOutcome::Ack => "acknowledged".into(),
        DbOutcome::Value(value) => value.clone(),
        DbOutcome::Done => "done".into(),
        DbOutcome::Failed(reason) => format!("failed: {}", reason),
        DbOutcome::Status(status) => format!("{:#?}", status),
    }
}

/// Actual main function of QuorumKV client.
fn client_main() -> Result<(), KvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let request = args.sanitize()?;

    let crypto = match args.key_seed {
        Some(ref seed) => Ed25519Crypto::from_seed_hex(seed)?,
        None => Ed25519Crypto::generate(),
    };
    let server = args
        .servers
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| KvError::msg("no servers given"))?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-client")
            .build()?;

        // enter tokio runtime, connect to the chosen server, and issue the
        // request
        runtime.block_on(async move {
            let mut endpoint = ClientEndpoint::connect_as(&server, crypto).await?;
            pf_info!(endpoint.id(); "issuing {:?} to {}", request, server);

            let outcome = endpoint.request(request, timeout).await?;
            println!("{}", describe(&outcome));

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), KvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of QuorumKV client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
