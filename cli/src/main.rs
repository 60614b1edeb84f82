//! electrumrpc CLI — query Electrum-protocol servers from the terminal.
//!
//! Usage:
//! ```bash
//! # Negotiate and print the server's version
//! electrumrpc version --url wss://bch.imaginary.cash:50004
//!
//! # Send a raw call
//! electrumrpc call --method blockchain.headers.get_tip
//! electrumrpc call --method blockchain.estimatefee --params '[6]'
//!
//! # Follow a subscription
//! electrumrpc subscribe headers --count 3
//! electrumrpc subscribe address bitcoincash:qr...
//!
//! # List the bundled servers
//! electrumrpc servers --network testnet
//! ```

use std::env;
use std::process;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use electrumrpc_core::methods::{AddressSubscribe, HeadersSubscribe, TransactionDsProofSubscribe};
use electrumrpc_core::{load_server_catalog, ClientConfig, ConfigFile, Method, Network, SubscriptionMethod};
use electrumrpc_ws::{CallOptions, Client, ClientEvent};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "call" => cmd_call(&args[2..]).await,
        "subscribe" => cmd_subscribe(&args[2..]).await,
        "servers" => cmd_servers(&args[2..]),
        "version" => cmd_version(&args[2..]).await,
        "--version" | "-V" => {
            println!("electrumrpc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("electrumrpc {}", env!("CARGO_PKG_VERSION"));
    println!("Query Electrum-protocol indexing servers\n");
    println!("USAGE:");
    println!("    electrumrpc <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    call        Send a raw call and print the result");
    println!("    subscribe   Follow headers | address <ADDR> | dsproof <TXID>");
    println!("    servers     List the bundled server catalogue");
    println!("    version     Negotiate and print the server version");
    println!("    help        Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL>           Server URL, tried before the bundled catalogue");
    println!("    --network <NET>       mainnet | testnet  [default: mainnet]");
    println!("    --config <FILE>       JSON client configuration");
    println!("    --method <PATH>       Method path for `call`");
    println!("    --params <JSON>       JSON array of parameters for `call`");
    println!("    --timeout <MS>        Per-call timeout in milliseconds");
    println!("    --count <N>           Stop `subscribe` after N updates\n");
    println!("Set RUST_LOG=electrumrpc_ws=debug for connection logs.");
}

/// A call built from the command line.
struct RawMethod {
    path: &'static str,
    params: Vec<Value>,
}

impl Method for RawMethod {
    type Output = Value;

    fn path(&self) -> &'static str {
        self.path
    }

    fn params(&self) -> Vec<Value> {
        self.params.clone()
    }
}

fn build_config(args: &[String]) -> anyhow::Result<ClientConfig> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            ConfigFile::from_json(&json)?.into_config()?
        }
        None => ClientConfig::default(),
    };
    if let Some(network) = parse_flag(args, "--network") {
        config.network = network.parse().map_err(|e| anyhow!("{e}"))?;
    }
    if let Some(url) = parse_flag(args, "--url") {
        config.bootstrap_servers = Some(vec![url]);
    }
    // One-shot commands do not need liveness pings.
    config.heartbeat.enabled = false;
    Ok(config)
}

fn call_options(args: &[String]) -> anyhow::Result<CallOptions> {
    let mut options = CallOptions::default();
    if let Some(ms) = parse_flag(args, "--timeout") {
        let ms: u64 = ms.parse().context("--timeout must be milliseconds")?;
        options = options.with_timeout(Duration::from_millis(ms));
    }
    Ok(options)
}

async fn connect(args: &[String]) -> anyhow::Result<Client> {
    let config = build_config(args)?;
    let client = Client::connect(config).await.context("connecting")?;
    if let Some(endpoint) = client.endpoint() {
        eprintln!("Connected to {endpoint}");
    }
    Ok(client)
}

async fn cmd_call(args: &[String]) -> anyhow::Result<()> {
    let method = parse_flag(args, "--method").ok_or_else(|| anyhow!("--method is required"))?;
    let params = match parse_flag(args, "--params") {
        Some(raw) => match serde_json::from_str::<Value>(&raw).context("--params must be JSON")? {
            Value::Array(items) => items,
            other => vec![other],
        },
        None => vec![],
    };

    let client = connect(args).await?;
    let raw = RawMethod {
        // Lives for the rest of this short-lived process.
        path: Box::leak(method.into_boxed_str()),
        params,
    };
    let result = client.call(&raw, call_options(args)?).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    client.shutdown().await;
    Ok(())
}

async fn cmd_subscribe(args: &[String]) -> anyhow::Result<()> {
    let kind = args.first().map(String::as_str).unwrap_or("");
    let count = match parse_flag(args, "--count") {
        Some(n) => Some(n.parse::<usize>().context("--count must be a number")?),
        None => None,
    };
    let client = connect(args).await?;

    match kind {
        "headers" => follow(&client, HeadersSubscribe, args, count).await?,
        "address" => {
            let address = args.get(1).ok_or_else(|| anyhow!("address required"))?;
            follow(&client, AddressSubscribe::new(address.as_str()), args, count).await?
        }
        "dsproof" => {
            let tx_hash = args.get(1).ok_or_else(|| anyhow!("transaction hash required"))?;
            follow(&client, TransactionDsProofSubscribe::new(tx_hash.as_str()), args, count).await?
        }
        other => bail!("unknown subscription '{other}' (expected headers, address or dsproof)"),
    }
    client.shutdown().await;
    Ok(())
}

/// Print the initial value and then every update until `count` or Ctrl-C.
async fn follow<M>(client: &Client, method: M, args: &[String], count: Option<usize>) -> anyhow::Result<()>
where
    M: SubscriptionMethod,
    M::Output: serde::Serialize,
    M::Notification: DeserializeOwned + std::fmt::Debug,
{
    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::StateChanged(state) => eprintln!("[state] {state}"),
                ClientEvent::Reconnected { endpoint, .. } => eprintln!("[reconnected] {endpoint}"),
                _ => {}
            }
        }
    });

    let sub = client.subscribe(method, call_options(args)?).await?;
    println!("{}", serde_json::to_string(&sub.initial)?);

    let mut updates = sub.updates;
    let mut seen = 0usize;
    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(Ok(update)) => {
                    println!("{update:?}");
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                Some(Err(e)) => eprintln!("[error] {e}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn cmd_servers(args: &[String]) -> anyhow::Result<()> {
    let network: Network = match parse_flag(args, "--network") {
        Some(n) => n.parse().map_err(|e| anyhow!("{e}"))?,
        None => Network::Mainnet,
    };
    let servers = load_server_catalog(network)?;
    println!("Bundled {network} servers ({}):\n", servers.len());
    for server in servers {
        println!("  {server}");
    }
    Ok(())
}

async fn cmd_version(args: &[String]) -> anyhow::Result<()> {
    let client = connect(args).await?;
    // Any call negotiates first; ping is the cheapest.
    client
        .call(&electrumrpc_core::methods::ServerPing, call_options(args)?)
        .await?;
    let session = client
        .negotiated()
        .ok_or_else(|| anyhow!("no negotiated session"))?;
    println!("Server:   {}", session.server_software);
    println!("Protocol: {}", session.protocol_version);
    if let Some(features) = &session.server_features {
        println!("Genesis:  {}", features.genesis_hash);
    }
    client.shutdown().await;
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
