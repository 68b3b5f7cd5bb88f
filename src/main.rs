use abiscope::{Config, ProviderId};
use anyhow::{anyhow, Result};
use clap::{Arg, Command};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Log to stderr so the record on stdout stays pipeable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let matches = Command::new("abiscope")
        .version("0.1.0")
        .about("Resolve, reconstruct and extrapolate a contract's ABI from its address")
        .arg(
            Arg::new("address")
                .value_name("ADDRESS")
                .help("Contract address to resolve"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file"),
        )
        .arg(
            Arg::new("chain-id")
                .short('i')
                .long("chain-id")
                .value_name("ID")
                .default_value("1")
                .value_parser(clap::value_parser!(u64))
                .help("EIP-155 chain id to resolve on"),
        )
        .arg(
            Arg::new("prefer")
                .short('p')
                .long("prefer")
                .value_name("PROVIDER")
                .help("Use only this model provider for extrapolation (anthropic, openai, gemini)"),
        )
        .arg(
            Arg::new("no-cache")
                .long("no-cache")
                .help("Skip the result cache for this resolution")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a sample configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config-path")
                .long("config-path")
                .help("Print the default configuration file path and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Handle special commands first
    if matches.get_flag("generate-config") {
        let sample_config = Config::generate_sample();
        println!("{}", sample_config);
        return Ok(());
    }

    if matches.get_flag("config-path") {
        match Config::default_config_path() {
            Ok(path) => {
                println!("{}", path.display());
                return Ok(());
            }
            Err(e) => {
                error!("Could not determine default config path: {}", e);
                return Err(e);
            }
        }
    }

    let config_path = matches.get_one::<String>("config").map(|s| s.as_str());
    let mut config = Config::load_or_default(config_path).await;

    if matches.get_flag("no-cache") {
        config.cache.enabled = false;
    }

    let address = matches
        .get_one::<String>("address")
        .ok_or_else(|| anyhow!("ADDRESS is required"))?;
    let chain_id = *matches
        .get_one::<u64>("chain-id")
        .expect("chain-id has a default");
    let preferred = matches
        .get_one::<String>("prefer")
        .map(|name| name.parse::<ProviderId>())
        .transpose()
        .map_err(|e| anyhow!(e))?;

    info!("Resolving {} on chain {}", address, chain_id);

    let resolver = abiscope::build_resolver(&config)?;
    let record = resolver.resolve(chain_id, address, preferred).await?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
