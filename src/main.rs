use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rand::RngCore;
use tokio::time::Duration;
use tracing::info;

use multichord::{Controller, NodePool, Shell, Timings, Transport};

#[derive(Parser, Debug)]
#[command(name = "multichord")]
#[command(author, version, about = "Chord DHT where same-id virtual nodes form value-replicating swarms", long_about = None)]
struct Args {
    /// Ip address of the server socket.
    ip: String,

    /// Port number of the server socket (0 picks an ephemeral port).
    port: u16,

    /// Bootstrap node address, repeatable.
    #[arg(long = "bootstrap", value_name = "host:port")]
    bootstrap: Vec<String>,

    /// Seconds between stabilization passes.
    #[arg(long, value_name = "seconds")]
    stabilize_interval: Option<f64>,

    /// Seconds an rpc call waits for its response.
    #[arg(long, value_name = "seconds")]
    rpc_timeout: Option<f64>,

    /// Seconds a fetch may take as a whole.
    #[arg(long, value_name = "seconds")]
    fetch_timeout: Option<f64>,

    /// Host a random 64-byte payload at startup.
    #[arg(long)]
    scenario_host_random: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // tracing is initialized by the library's ctor hook
    let args = Args::parse();

    let mut timings = Timings::default();
    if let Some(seconds) = args.stabilize_interval {
        timings.stabilize_interval = Duration::from_secs_f64(seconds);
    }
    if let Some(seconds) = args.rpc_timeout {
        timings.rpc_timeout = Duration::from_secs_f64(seconds);
    }
    if let Some(seconds) = args.fetch_timeout {
        timings.fetch_timeout = Duration::from_secs_f64(seconds);
    }

    let transport = Transport::bind(&format!("{}:{}", args.ip, args.port)).await?;
    info!("running server on {}", transport.local_address_string());

    let pool = NodePool::new(transport, args.bootstrap.clone(), timings);
    let controller = Controller::new(Arc::clone(&pool));

    if args.scenario_host_random {
        let mut payload = vec![0u8; 64];
        rand::rng().fill_bytes(&mut payload);
        let node = controller.host(payload)?;
        println!("hosting random payload: {}", node.id().to_hex());
    }

    Shell::new(controller).run().await?;

    pool.shutdown();
    Ok(())
}
