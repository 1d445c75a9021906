use atn_client::{
    logging::init_logging, ApiRequest, AtnClient, AtnError, Config, EthersLedger,
    HttpDbotGateway, LedgerGateway, Result,
};
use clap::{Parser, Subcommand};
use ethers::types::{Address, U256};
use serde::Serialize;
use std::{process::ExitCode, str::FromStr, sync::Arc};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "atn", version, about = "Pay for DBot API calls through micropayment channels")]
struct Cli {
    /// DBot address (the channel receiver)
    #[arg(long, global = true, value_parser = parse_address)]
    dbot: Option<Address>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Price of one call to an endpoint
    Price {
        #[arg(long)]
        uri: String,
        #[arg(long, default_value = "GET")]
        method: String,
    },
    /// Name, domain and owner registered on the DBot contract
    Info,
    /// Local view of the channel to the DBot
    Channel,
    /// The DBot's view of the channel
    DbotChannel,
    /// Open a channel with the given deposit
    Open {
        #[arg(value_parser = parse_amount)]
        deposit: U256,
    },
    /// Add funds to the open channel
    Topup {
        #[arg(value_parser = parse_amount)]
        amount: U256,
    },
    /// Wait until the DBot has caught up with the ledger
    Sync,
    /// Pay for and perform one API call
    Call {
        #[arg(long)]
        uri: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// Close the channel with the latest balance
    Close,
    /// Close the channel without the DBot's agreement
    ForceClose {
        /// Balance claimed for the DBot; defaults to the latest proof
        #[arg(long, value_parser = parse_amount)]
        balance: Option<U256>,
    },
    /// Settle a closed channel once its challenge period is over
    Settle,
}

fn parse_address(raw: &str) -> std::result::Result<Address, String> {
    Address::from_str(raw).map_err(|_| format!("not an address: {}", raw))
}

fn parse_amount(raw: &str) -> std::result::Result<U256, String> {
    U256::from_dec_str(raw).map_err(|_| format!("not a decimal amount: {}", raw))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_client(config: &Config, receiver: Address) -> Result<AtnClient> {
    let wallet = config.wallet()?;
    let ledger = EthersLedger::connect(
        &config.rpc_url,
        wallet.clone(),
        config.channel_manager()?,
        config.confirmation_interval,
        config.confirmation_timeout,
    )
    .await?;

    let dbot_url = match &config.dbot_url {
        Some(url) => url.clone(),
        None => {
            let dbot = ledger
                .dbot_info(receiver)
                .await?
                .ok_or(AtnError::DbotNotFound { address: receiver })?;
            info!(name = %dbot.name, domain = %dbot.domain, "resolved DBot from ledger");
            dbot.domain
        }
    };
    let dbot = HttpDbotGateway::new(dbot_url, config.request_timeout)?;

    Ok(AtnClient::new(wallet, Arc::new(ledger), Arc::new(dbot))
        .with_funding(config.funding())
        .with_sync_policy(config.sync_policy()))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;
    let receiver = cli
        .dbot
        .ok_or_else(|| AtnError::config("--dbot <address> is required"))?;
    let client = build_client(&config, receiver).await?;

    match cli.command {
        Command::Price { uri, method } => {
            print_json(&client.get_price(receiver, &uri, &method.to_uppercase()).await?)
        }
        Command::Info => print_json(&client.get_dbot_info(receiver).await?),
        Command::Channel => print_json(&client.get_channel(receiver).await?),
        Command::DbotChannel => print_json(&client.get_dbot_channel(receiver).await?),
        Command::Open { deposit } => print_json(&client.open_channel(receiver, deposit).await?),
        Command::Topup { amount } => print_json(&client.topup_channel(receiver, amount).await?),
        Command::Sync => print_json(&client.wait_dbot_sync(receiver).await?),
        Command::Call { uri, method, data } => {
            let mut request = ApiRequest::new(method.to_uppercase(), uri);
            if let Some(data) = data {
                request = request.json(serde_json::from_str(&data)?);
            }
            let response = client.call(receiver, request).await?;
            if !response.is_success() {
                eprintln!("DBot answered {}", response.status);
            }
            println!("{}", response.text());
            Ok(())
        }
        Command::Close => print_json(&client.close_channel(receiver).await?),
        Command::ForceClose { balance } => {
            let balance = match balance {
                Some(balance) => balance,
                None => client
                    .get_channel(receiver)
                    .await?
                    .map(|channel| channel.balance)
                    .ok_or(AtnError::ChannelNotOpen { receiver })?,
            };
            print_json(&client.uncooperative_close_channel(receiver, balance).await?)
        }
        Command::Settle => print_json(&client.settle_channel(receiver).await?),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
