//! jip-discover: Discover a JIP network and print it.
//!
//! Part of the async-jip CLI utilities.

use async_jip::cli::args::{CommonArgs, OutputArgs, OutputFormat, parse_var_selector};
use async_jip::transport::Transport;
use async_jip::{Client, DEVICE_ID_ALL};
use clap::Parser;
use std::process::ExitCode;
use std::time::Instant;

/// Discover every node behind a border router and print the network.
#[derive(Debug, Parser)]
#[command(name = "jip-discover", version, about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    output: OutputArgs,

    /// Variables to read from every node that has them (Mib/Var).
    #[arg(value_name = "VAR")]
    vars: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    args.output.init_tracing();

    let selectors: Vec<(&str, &str)> = match args
        .vars
        .iter()
        .map(|s| parse_var_selector(s))
        .collect()
    {
        Ok(selectors) => selectors,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let builder = args.common.client_builder();
    let result = match &args.common.gateway {
        Some(gateway) => match builder.connect_tunnel(gateway.clone()).await {
            Ok(client) => run(client, &args, &selectors).await,
            Err(e) => Err(e),
        },
        None => match builder.connect().await {
            Ok(client) => run(client, &args, &selectors).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run<T: Transport>(
    client: Client<T>,
    args: &Args,
    selectors: &[(&str, &str)],
) -> async_jip::Result<()> {
    let start = Instant::now();
    let discovered = client.discover_network().await;
    let elapsed = start.elapsed();
    if let Err(e) = discovered {
        client.shutdown().await;
        return Err(e);
    }

    let mut readings = Vec::new();
    for address in client.network().node_addresses(DEVICE_ID_ALL) {
        let Some(mut node) = client.network().lookup_node(address).await else {
            continue;
        };
        for (mib, var) in selectors {
            let Some(var_ref) = node.find_var(mib, var) else {
                continue;
            };
            let value = match client.get_var(&mut node, var_ref).await {
                Ok(()) => node
                    .var(var_ref)
                    .and_then(|v| v.value.as_ref())
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                Err(e) => format!("<{}>", e.status()),
            };
            readings.push((address, format!("{}/{}", mib, var), value));
        }
    }

    match args.output.format {
        OutputFormat::Human => {
            print!("{}", client.network().describe().await);
            for (address, var, value) in &readings {
                println!("{} {} = {}", address, var, value);
            }
            println!(
                "{} nodes discovered in {:.1}s",
                client.network().len(),
                elapsed.as_secs_f64()
            );
        }
        OutputFormat::Json => {
            let nodes: Vec<_> = client
                .network()
                .members()
                .into_iter()
                .map(|(address, device_id)| {
                    let vars: serde_json::Map<String, serde_json::Value> = readings
                        .iter()
                        .filter(|(a, _, _)| *a == address)
                        .map(|(_, var, value)| (var.clone(), value.clone().into()))
                        .collect();
                    serde_json::json!({
                        "address": address.to_string(),
                        "device_id": format!("0x{:08x}", device_id),
                        "vars": vars,
                    })
                })
                .collect();
            let document = serde_json::json!({
                "border_router": client.network().border_router().map(|a| a.to_string()),
                "nodes": nodes,
            });
            match serde_json::to_string_pretty(&document) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Error: {}", e),
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
