//! # Runemarket CLI
//!
//! Command-line tools for building and inspecting runes marketplace offers.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bitcoin::{Network, OutPoint};
use clap::{Parser, Subcommand};
use colored::*;
use runemarket_core::{
    fee::{estimate_vsize, InputSize},
    indexer::{RuneBalance, TokenUtxo},
    offer::{fragment_id, offer_sign_options, ListingItem},
    runestone::{Edict, Runestone, MAX_STANDARD_OP_RETURN_SIZE},
    signature::is_finalized,
    utils::*,
    AccountKeys, AddressType, FeeRate, MarketConfig, OfferBuilder, OfferFragment, RuneId, Utxo,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runemarket")]
#[command(about = "Trustless Runes marketplace: pre-signed offers and PSBT assembly")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "RUNEMARKET_CONFIG")]
    config: Option<PathBuf>,

    /// Network, overrides the configuration (bitcoin, testnet, signet, regtest)
    #[arg(short, long, global = true, env = "RUNEMARKET_NETWORK")]
    network: Option<Network>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a runestone into an OP_RETURN script
    EncodeRunestone {
        /// Transfer as `block:tx:amount:output`, repeatable
        #[arg(short, long = "edict", value_parser = parse_edict)]
        edicts: Vec<Edict>,
        /// Rune to mint (`block:tx`)
        #[arg(short, long)]
        mint: Option<RuneId>,
        /// Output receiving unallocated runes
        #[arg(short, long)]
        pointer: Option<u32>,
    },
    /// Offer id of a location (`txid:vout`)
    LocationId {
        location: OutPoint,
    },
    /// Estimate size and fee of a transaction
    EstimateFee {
        /// Number of inputs
        #[arg(short, long, default_value = "1")]
        inputs: usize,
        /// Number of outputs
        #[arg(short, long, default_value = "2")]
        outputs: usize,
        /// Address type of inputs and outputs
        #[arg(short, long, default_value = "p2tr")]
        address_type: AddressType,
        /// Fee rate in sat/vB, defaults to the configured rate
        #[arg(short, long)]
        fee_rate: Option<FeeRate>,
    },
    /// Build an unsigned offer PSBT for a rune balance
    List {
        /// Seller address
        #[arg(long)]
        address: String,
        /// Seller public key (hex, compressed)
        #[arg(long)]
        pubkey: String,
        /// Location of the rune balance (`txid:vout`)
        #[arg(long)]
        location: OutPoint,
        /// Value of the location in sats
        #[arg(long)]
        value: u64,
        /// Raw rune amount held by the location
        #[arg(long)]
        amount: u128,
        /// Divisibility of the rune
        #[arg(long, default_value = "0")]
        divisibility: u8,
        #[arg(long)]
        rune_id: RuneId,
        /// Price per whole unit in sats
        #[arg(long)]
        price: f64,
        /// Address receiving the payment, defaults to the seller
        #[arg(long)]
        receiver: Option<String>,
    },
    /// Decode an offer PSBT and show its shape
    InspectOffer {
        /// Offer PSBT (hex)
        psbt: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Validate a Bitcoin address
    ValidateAddress {
        /// Bitcoin address to validate
        address: String,
    },
    /// Convert between Bitcoin and satoshis
    Convert {
        /// Amount to convert
        amount: f64,
        /// Unit (btc or sat)
        unit: String,
    },
}

fn parse_edict(s: &str) -> std::result::Result<Edict, String> {
    let mut parts = s.rsplitn(3, ':');
    let (Some(output), Some(amount), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected block:tx:amount:output, got `{s}`"));
    };

    Ok(Edict {
        id: id.parse().map_err(|e| format!("{e}"))?,
        amount: amount.parse().map_err(|_| format!("invalid amount `{amount}`"))?,
        output: output.parse().map_err(|_| format!("invalid output `{output}`"))?,
    })
}

fn load_config(cli: &Cli) -> Result<MarketConfig> {
    let mut config = match &cli.config {
        Some(path) => MarketConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MarketConfig::default(),
    };
    if let Some(network) = cli.network {
        config.network = network;
    }
    debug!(network = %config.network, fee_rate = %config.fee_rate, "configuration loaded");
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::EncodeRunestone {
            edicts,
            mint,
            pointer,
        } => {
            let runestone = Runestone {
                edicts,
                etching: None,
                mint,
                pointer,
            };
            let script = runestone.encipher();

            println!("{}: {}", "Payload".yellow().bold(), hex::encode(runestone.payload()));
            println!("{}: {}", "Script".cyan().bold(), script.to_hex_string());
            println!("{}: {} bytes", "Size".yellow().bold(), script.len());
            if script.len() > MAX_STANDARD_OP_RETURN_SIZE {
                println!(
                    "{}: exceeds the {} byte standard OP_RETURN limit",
                    "Warning".red().bold(),
                    MAX_STANDARD_OP_RETURN_SIZE
                );
            }
        }

        Commands::LocationId { location } => {
            println!("{}: {}", "Offer ID".green().bold(), location_id(&location).cyan());
        }

        Commands::EstimateFee {
            inputs,
            outputs,
            address_type,
            fee_rate,
        } => {
            let fee_rate = fee_rate.unwrap_or(config.fee_rate);
            let script_len = match address_type {
                AddressType::P2pkh => 25,
                AddressType::P2sh => 23,
                AddressType::P2wpkh => 22,
                AddressType::P2tr => 34,
            };
            let vsize = estimate_vsize(
                &vec![InputSize::for_address_type(address_type); inputs],
                &vec![script_len; outputs],
            );

            println!("{}: {} vB", "Virtual Size".yellow().bold(), vsize);
            println!(
                "{}: {} sats at {} sat/vB",
                "Fee".green().bold(),
                fee_rate.fee(vsize).to_sat().to_string().cyan(),
                fee_rate
            );
        }

        Commands::List {
            address,
            pubkey,
            location,
            value,
            amount,
            divisibility,
            rune_id,
            price,
            receiver,
        } => {
            let seller = AccountKeys::from_claim(&address, &pubkey, config.network)?;
            let receiver = match receiver {
                Some(receiver) => parse_address(&receiver, config.network)?.script_pubkey(),
                None => seller.script_pubkey.clone(),
            };
            let item = ListingItem::token(TokenUtxo {
                utxo: Utxo::new(location, value),
                balance: RuneBalance {
                    rune_id,
                    amount,
                    divisibility,
                },
            });

            let psbt = OfferBuilder::new(&seller)
                .dust_limit(config.dust_limit())
                .build(&[item.clone()], price, &receiver)?;
            let options = offer_sign_options(&psbt);

            println!("{}", "Offer PSBT built".green().bold());
            println!("{}", "═".repeat(50).bright_black());
            println!("{}: {}", "Seller".yellow().bold(), seller.address);
            println!("{}: {}", "Address Type".yellow().bold(), seller.address_type);
            println!("{}: {}", "Units".yellow().bold(), item.amount());
            println!(
                "{}: {} sats",
                "Total Price".yellow().bold(),
                psbt.unsigned_tx.output[0].value.to_sat()
            );
            println!("{}: {}", "Offer ID".yellow().bold(), location_id(&location));
            println!("{}: {:?}", "Sign Inputs".yellow().bold(), options.input_indexes);
            println!("{}", "═".repeat(50).bright_black());
            println!("{}", psbt.serialize_hex());
        }

        Commands::InspectOffer { psbt, json } => {
            let fragment = OfferFragment::from_hex(&psbt)?;
            let shape = match &fragment {
                OfferFragment::Single(_) => "single",
                OfferFragment::Bundled(..) => "bundled",
            };

            if json {
                let inputs: Vec<_> = fragment
                    .inputs()
                    .iter()
                    .map(|part| {
                        serde_json::json!({
                            "location": part.previous_output.to_string(),
                            "value": part.value().to_sat(),
                            "funding": part.funding.value.to_sat(),
                            "finalized": is_finalized(&part.input),
                        })
                    })
                    .collect();
                let summary = serde_json::json!({
                    "id": fragment_id(&fragment),
                    "shape": shape,
                    "total_price": fragment.total_price().to_sat(),
                    "inputs": inputs,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }

            println!("{}: {}", "Offer ID".green().bold(), fragment_id(&fragment).cyan());
            println!("{}: {}", "Shape".yellow().bold(), shape);
            for (index, part) in fragment.inputs().iter().enumerate() {
                let receiver = address_from_script(&part.funding.script_pubkey, config.network)
                    .map(|address| address.to_string())
                    .unwrap_or_else(|_| part.funding.script_pubkey.to_hex_string());
                println!(
                    "  [{}] {} ({} sats) -> {} sats to {} {}",
                    index,
                    part.previous_output,
                    part.value().to_sat(),
                    part.funding.value.to_sat(),
                    receiver,
                    if is_finalized(&part.input) {
                        "signed".green()
                    } else {
                        "unsigned".bright_black()
                    }
                );
            }
            println!(
                "{}: {} sats ({} BTC)",
                "Total Price".cyan().bold(),
                fragment.total_price().to_sat(),
                satoshi_to_btc(fragment.total_price().to_sat())
            );
        }

        Commands::ValidateAddress { address } => {
            let network = config.network;
            if validate_address(&address, network) {
                println!(
                    "{}: {} is {} for {}",
                    "Address Validation".green().bold(),
                    address.cyan(),
                    "valid".green(),
                    network.to_string().yellow()
                );
            } else {
                println!(
                    "{}: {} is {} for {}",
                    "Address Validation".red().bold(),
                    address.cyan(),
                    "invalid".red(),
                    network.to_string().yellow()
                );
            }
        }

        Commands::Convert { amount, unit } => match unit.to_lowercase().as_str() {
            "btc" => {
                let satoshis = btc_to_satoshi(amount);
                println!(
                    "{}: {} BTC = {} satoshis",
                    "Conversion".green().bold(),
                    amount.to_string().cyan(),
                    satoshis.to_string().yellow()
                );
            }
            "sat" | "sats" => {
                let btc = satoshi_to_btc(amount as u64);
                println!(
                    "{}: {} satoshis = {} BTC",
                    "Conversion".green().bold(),
                    (amount as u64).to_string().cyan(),
                    btc.to_string().yellow()
                );
            }
            other => bail!("unit must be 'btc' or 'sat', got '{other}'"),
        },
    }

    Ok(())
}
