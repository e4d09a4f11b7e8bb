use crate::config::RelayConfig;
use clap::{Parser, Subcommand};

/// Neuroscope Relay - live neural telemetry from broker to websocket clients
#[derive(Parser)]
#[command(name = "neuroscope-relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay (default)
    Serve {
        /// Port to listen on (overrides RELAY_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides RELAY_BIND_ADDR)
        #[arg(short, long)]
        bind: Option<String>,

        /// Broker websocket URL (overrides BROKER_URL)
        #[arg(long)]
        broker_url: Option<String>,
    },

    /// Print the effective topic table and exit
    Topics,
}

impl Commands {
    /// Apply command-line overrides on top of the environment
    pub fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Commands::Serve {
            port,
            bind,
            broker_url,
        } = self
        {
            if let Some(port) = port {
                config.port = *port;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind.clone();
            }
            if let Some(url) = broker_url {
                config.broker_url = url.clone();
            }
        }
    }
}

/// Render the topic table printed by `topics`
pub fn format_topic_table(config: &RelayConfig) -> String {
    let mut out = format!(
        "{:<28} {:<18} {:<11} {:<6} {}\n",
        "Broker topic", "WebSocket topic", "Throughput", "Batch", "Upstream"
    );
    out.push_str(&"-".repeat(80));
    out.push('\n');

    for route in &config.routes {
        out.push_str(&format!(
            "{:<28} {:<18} {:<11} {:<6} {}\n",
            route.broker_topic,
            route.ws_topic,
            if route.throughput { "Yes" } else { "No" },
            if route.batchable { "Yes" } else { "No" },
            config
                .upstreams
                .get(&route.ws_topic)
                .map(String::as_str)
                .unwrap_or("-"),
        ));
    }

    out
}
