// tokend is a privacy-preserving IP address tokenization pipeline. Client
// requests carrying a wallet ID and an IP address arrive at a front door;
// each address is turned into a stable, irreversible token under a rotating
// key, tokens are aggregated per (epoch, wallet), and batches are forwarded
// to a downstream sink.

pub mod aggregator;
pub mod config;
pub mod forwarder;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod receiver;
pub mod tokenizer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use crate::aggregator::{AddrAggregator, SimpleAggregator};
use crate::config::{Config, KafkaConfig};
use crate::forwarder::{KafkaForwarder, StdoutForwarder};
use crate::pipeline::{Aggregator, Forwarder, Receiver};
use crate::receiver::{StdinReceiver, WebReceiver};
use crate::tokenizer::{CryptoPanTokenizer, HmacTokenizer, Tokenize, VerbatimTokenizer};

const TOKENIZER_HMAC: &str = "hmac";
const TOKENIZER_CRYPTOPAN: &str = "cryptopan";
const TOKENIZER_VERBATIM: &str = "verbatim";

const FORWARDER_STDOUT: &str = "stdout";
const FORWARDER_KAFKA: &str = "kafka";

const RECEIVER_STDIN: &str = "stdin";
const RECEIVER_WEB: &str = "web";

const AGGREGATOR_SIMPLE: &str = "simple";
const AGGREGATOR_ADDR: &str = "address";

#[derive(Parser, Debug)]
#[command(author, version, about = "Privacy-preserving IP address tokenization pipeline")]
pub struct Cli {
    /// The name of the receiver to use (stdin, web).
    #[arg(long, default_value = RECEIVER_STDIN)]
    pub receiver: String,

    /// The name of the aggregator to use (simple, address).
    #[arg(long, default_value = AGGREGATOR_SIMPLE)]
    pub aggregator: String,

    /// The name of the tokenizer to use (hmac, cryptopan, verbatim).
    #[arg(long, default_value = TOKENIZER_HMAC)]
    pub tokenizer: String,

    /// The name of the forwarder to use (stdout, kafka).
    #[arg(long, default_value = FORWARDER_STDOUT)]
    pub forwarder: String,

    /// Port the Web receiver should listen on.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Number of seconds after which data is forwarded to the backend.
    #[arg(long = "forward-interval", default_value_t = 300)]
    pub forward_interval: u64,

    /// Number of seconds after which keys are rotated.
    #[arg(long = "key-expiry", default_value_t = 15_552_000)]
    pub key_expiry: u64,

    /// Make Prometheus metrics available at http://0.0.0.0:<port>/metrics.
    #[arg(long = "prometheus-port", default_value_t = 9090)]
    pub prometheus_port: u16,

    /// Expose Prometheus metrics.
    #[arg(long = "expose-prometheus", default_value_t = false)]
    pub expose_prometheus: bool,

    /// Enable debug mode, which logs extra information.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

fn build_config(cli: &Cli) -> Result<Config> {
    if cli.port == 0 {
        bail!("port must be in interval [1, 65535]");
    }
    if cli.prometheus_port == 0 {
        bail!("Prometheus port must be in interval [1, 65535]");
    }
    if cli.expose_prometheus && cli.receiver == RECEIVER_WEB && cli.prometheus_port == cli.port {
        bail!("Prometheus port and Web receiver port must not be the same");
    }
    if cli.forward_interval == 0 {
        bail!("forward interval must be at least one second");
    }
    if cli.key_expiry == 0 {
        bail!("key expiry must be at least one second");
    }

    let kafka = if cli.forwarder == FORWARDER_KAFKA {
        Some(KafkaConfig::from_env().context("failed to load Kafka config")?)
    } else {
        None
    };

    Ok(Config {
        port: cli.port,
        fwd_interval: Duration::from_secs(cli.forward_interval),
        key_expiry: Duration::from_secs(cli.key_expiry),
        kafka,
    })
}

fn build_tokenizer(name: &str) -> Result<Arc<dyn Tokenize>> {
    Ok(match name {
        TOKENIZER_HMAC => Arc::new(HmacTokenizer::new()),
        TOKENIZER_CRYPTOPAN => Arc::new(CryptoPanTokenizer::new()),
        TOKENIZER_VERBATIM => Arc::new(VerbatimTokenizer::new()),
        _ => bail!("tokenizer does not exist: {name}"),
    })
}

fn build_receiver(name: &str) -> Result<Box<dyn Receiver>> {
    Ok(match name {
        RECEIVER_STDIN => Box::new(StdinReceiver::new()),
        RECEIVER_WEB => Box::new(WebReceiver::new()),
        _ => bail!("receiver does not exist: {name}"),
    })
}

fn build_aggregator(name: &str) -> Result<Box<dyn Aggregator>> {
    Ok(match name {
        AGGREGATOR_SIMPLE => Box::new(SimpleAggregator::new()),
        AGGREGATOR_ADDR => {
            // The sink schema is fixed; failing to compile it is a startup
            // error.
            let schema = Arc::new(message::sink_schema()?);
            Box::new(AddrAggregator::new(schema))
        }
        _ => bail!("aggregator does not exist: {name}"),
    })
}

fn build_forwarder(name: &str) -> Result<Box<dyn Forwarder>> {
    Ok(match name {
        FORWARDER_STDOUT => Box::new(StdoutForwarder::new()),
        FORWARDER_KAFKA => Box::new(KafkaForwarder::new()),
        _ => bail!("forwarder does not exist: {name}"),
    })
}

/// Builds all components, wires them up, runs the pipeline until a shutdown
/// signal arrives, and tears everything down again.
pub async fn run(cli: Cli) -> Result<()> {
    // Load .env for local development, if present.
    dotenvy::dotenv().ok();

    let config = build_config(&cli)?;
    let tokenizer = build_tokenizer(&cli.tokenizer)?;
    let mut receiver = build_receiver(&cli.receiver)?;
    let mut aggregator = build_aggregator(&cli.aggregator)?;
    let mut forwarder = build_forwarder(&cli.forwarder)?;
    info!(
        "Using receiver={}, aggregator={}, tokenizer={}, forwarder={}.",
        cli.receiver, cli.aggregator, cli.tokenizer, cli.forwarder
    );

    // Propagate the configuration to all components.
    receiver.set_config(&config);
    aggregator.set_config(&config);
    forwarder.set_config(&config);

    // Tell the aggregator what tokenizer to use, where to get data from,
    // and where to send it to.
    aggregator.use_tokenizer(tokenizer);
    aggregator.connect(receiver.take_inbox(), forwarder.outbox());

    if cli.expose_prometheus {
        metrics::spawn_exporter(cli.prometheus_port);
    }
    if cli.debug {
        info!("Enabling debug mode.");
        metrics::spawn_rate_logger();
    }

    aggregator.start().await?;
    receiver.start().await?;
    forwarder.start().await?;

    info!("Done bootstrapping.  Now waiting for shutdown signal.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    receiver.stop().await;
    aggregator.stop().await;
    forwarder.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("tokend").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_the_documented_ones() {
        let cli = cli(&[]);
        assert_eq!(cli.receiver, RECEIVER_STDIN);
        assert_eq!(cli.aggregator, AGGREGATOR_SIMPLE);
        assert_eq!(cli.tokenizer, TOKENIZER_HMAC);
        assert_eq!(cli.forwarder, FORWARDER_STDOUT);
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.forward_interval, 300);
        assert_eq!(cli.key_expiry, 15_552_000);
        assert_eq!(cli.prometheus_port, 9090);
        assert!(!cli.expose_prometheus);
    }

    #[test]
    fn unknown_component_names_fail() {
        assert!(build_tokenizer("nope").is_err());
        assert!(build_receiver("nope").is_err());
        assert!(build_aggregator("nope").is_err());
        assert!(build_forwarder("nope").is_err());
    }

    #[test]
    fn known_component_names_build() {
        for name in [TOKENIZER_HMAC, TOKENIZER_CRYPTOPAN, TOKENIZER_VERBATIM] {
            assert!(build_tokenizer(name).is_ok());
        }
        assert!(build_receiver(RECEIVER_STDIN).is_ok());
        assert!(build_receiver(RECEIVER_WEB).is_ok());
        assert!(build_aggregator(AGGREGATOR_SIMPLE).is_ok());
        assert!(build_aggregator(AGGREGATOR_ADDR).is_ok());
        assert!(build_forwarder(FORWARDER_STDOUT).is_ok());
        assert!(build_forwarder(FORWARDER_KAFKA).is_ok());
    }

    #[test]
    fn clashing_ports_are_rejected() {
        let args = cli(&[
            "--receiver",
            "web",
            "--expose-prometheus",
            "--port",
            "9090",
            "--prometheus-port",
            "9090",
        ]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn distinct_ports_are_accepted() {
        let args = cli(&["--receiver", "web", "--expose-prometheus"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.kafka.is_none());
    }

    #[test]
    fn zero_forward_interval_is_rejected() {
        let args = cli(&["--forward-interval", "0"]);
        assert!(build_config(&args).is_err());
    }
}
