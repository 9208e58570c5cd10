//! MuSig Party CLI
//!
//! Command-line signer node for MuSig2 shared wallets:
//! - Key generation and shared wallet derivation
//! - Advertising as a co-signer, optionally co-signing automatically
//! - Signer discovery
//! - Running a signing session as initiator

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use msg_relay_client::RelayTransport;
use musig_p2p_core::{
    AdvertiseOptions, AmountRange, MuSigProtocol, PrivateKey, ProtocolConfig, ProtocolEvent,
    PublicKey, SessionMetadata, SignerCriteria, TransactionCategory,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};

/// MuSig Party - MuSig2 signer node
#[derive(Parser)]
#[command(name = "musig-party")]
#[command(about = "MuSig2 shared wallet signer node")]
#[command(version)]
struct Cli {
    /// Relay service URL
    #[arg(short, long, env = "RELAY_URL", default_value = "http://127.0.0.1:8080")]
    relay: String,

    /// Name of this node; used as peer id and key file name
    #[arg(short, long, env = "PARTY_NAME")]
    name: String,

    /// Data directory for keys
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Protocol configuration (JSON); defaults apply when omitted
    #[arg(short, long, env = "MUSIG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a signing key
    Keygen,

    /// Show this node's public key
    Info,

    /// Derive the shared wallet for a set of co-signers
    Wallet {
        /// Co-signer public keys (hex, comma-separated); our key is added
        #[arg(short, long, value_delimiter = ',')]
        participants: Vec<PublicKey>,
    },

    /// Advertise as a co-signer until interrupted
    Advertise {
        /// Categories to co-sign (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "spend")]
        categories: Vec<TransactionCategory>,

        #[arg(long)]
        nickname: Option<String>,

        /// Fee asked per signature
        #[arg(long)]
        fee: Option<u64>,

        #[arg(long, requires = "max_amount")]
        min_amount: Option<u64>,

        #[arg(long, requires = "min_amount")]
        max_amount: Option<u64>,

        /// Join and sign every session that names our key
        #[arg(long)]
        auto_cosign: bool,
    },

    /// List advertised co-signers
    Discover {
        #[arg(long)]
        category: Option<TransactionCategory>,

        #[arg(long)]
        min_reputation: Option<u32>,

        #[arg(long)]
        amount: Option<u64>,

        #[arg(long)]
        max_fee: Option<u64>,
    },

    /// Sign a message together with the given co-signers
    Sign {
        /// Message to sign (hex)
        #[arg(short, long)]
        message: String,

        /// Co-signer public keys (hex, comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        participants: Vec<PublicKey>,

        /// Free-form purpose recorded in the session metadata
        #[arg(long)]
        purpose: Option<String>,
    },
}

/// Key file contents
#[derive(Serialize, Deserialize)]
struct KeyFile {
    public_key: String,
    secret_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    // Ensure data directory exists
    std::fs::create_dir_all(&cli.dest)?;

    match &cli.command {
        Commands::Keygen => run_keygen(&cli)?,
        Commands::Info => show_info(&cli)?,
        Commands::Wallet { participants } => show_wallet(&cli, participants)?,
        Commands::Advertise {
            categories,
            nickname,
            fee,
            min_amount,
            max_amount,
            auto_cosign,
        } => {
            let options = AdvertiseOptions {
                nickname: nickname.clone(),
                amount_range: (*min_amount)
                    .zip(*max_amount)
                    .map(|(min, max)| AmountRange::new(min, max)),
                fee: *fee,
                ..AdvertiseOptions::default()
            };
            let categories: BTreeSet<TransactionCategory> = categories.iter().copied().collect();
            run_advertise(&cli, categories, options, *auto_cosign).await?;
        }
        Commands::Discover {
            category,
            min_reputation,
            amount,
            max_fee,
        } => {
            let criteria = SignerCriteria {
                category: *category,
                min_reputation: *min_reputation,
                amount: *amount,
                max_fee: *max_fee,
            };
            run_discover(&cli, &criteria).await?;
        }
        Commands::Sign {
            message,
            participants,
            purpose,
        } => run_sign(&cli, message, participants, purpose.as_deref()).await?,
    }

    Ok(())
}

fn run_keygen(cli: &Cli) -> Result<()> {
    let path = key_path(cli);
    if path.exists() {
        bail!("key file {} already exists", path.display());
    }

    let key = PrivateKey::generate();
    let file = KeyFile {
        public_key: key.public_key().to_hex(),
        secret_key: key.to_hex(),
    };
    std::fs::write(&path, serde_json::to_string_pretty(&file)?)?;

    info!(name = %cli.name, path = ?path, "Key generated");
    println!("Public Key: {}", file.public_key);
    Ok(())
}

fn show_info(cli: &Cli) -> Result<()> {
    let key = load_key(cli)?;
    println!("Node: {}", cli.name);
    println!("  Public Key: {}", key.public_key());
    Ok(())
}

fn show_wallet(cli: &Cli, participants: &[PublicKey]) -> Result<()> {
    let key = load_key(cli)?;
    let mut keys = participants.to_vec();
    if !keys.contains(&key.public_key()) {
        keys.push(key.public_key());
    }

    let wallet = MuSigProtocol::new().shared_wallet(&keys)?;
    println!("Shared Wallet:");
    println!("  Address: {}", wallet.address());
    println!("  Aggregated Key: {}", wallet.aggregated_key());
    println!("  Participants:");
    for participant in wallet.participants() {
        println!("    {}", participant);
    }
    Ok(())
}

async fn run_advertise(
    cli: &Cli,
    categories: BTreeSet<TransactionCategory>,
    options: AdvertiseOptions,
    auto_cosign: bool,
) -> Result<()> {
    let key = load_key(cli)?;
    let protocol = connect(cli).await?;
    protocol.register_signer_key(key.public_key());
    let mut events = protocol.subscribe_events().await?;

    let advertisement_id = protocol
        .advertise_signer(key.public_key(), categories, options)
        .await?;
    info!(advertisement_id = %advertisement_id, auto_cosign, "Advertising, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(e) = on_cosigner_event(&protocol, &key, auto_cosign, event).await {
                        warn!(error = %e, "Session step failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    protocol.withdraw_signer().await?;
    protocol.shutdown().await?;
    Ok(())
}

/// Co-signer reaction to one protocol event
async fn on_cosigner_event(
    protocol: &MuSigProtocol,
    key: &PrivateKey,
    auto_cosign: bool,
    event: ProtocolEvent,
) -> Result<()> {
    match event {
        ProtocolEvent::SessionAnnounced { session_id } => {
            let Some(session) = protocol.get_session(&session_id).await? else {
                return Ok(());
            };
            info!(
                session_id = %session_id,
                initiator = %session.initiator,
                participants = session.participants.len(),
                purpose = ?session.metadata.purpose,
                "Session proposed"
            );
            if auto_cosign && !session.is_initiator {
                protocol.join_session(&session_id, key).await?;
            }
        }
        ProtocolEvent::SigningRequestReceived { request } => {
            info!(
                request_id = %request.request_id,
                creator = %request.creator,
                "Signing request received"
            );
        }
        event => step_session(protocol, key, &event).await?,
    }
    Ok(())
}

/// Advance our side of a session on ready, nonce-complete and complete events
async fn step_session(protocol: &MuSigProtocol, key: &PrivateKey, event: &ProtocolEvent) -> Result<()> {
    match event {
        ProtocolEvent::SessionReady { session_id } => {
            protocol.share_nonces(session_id).await?;
        }
        ProtocolEvent::NoncesComplete { session_id } => {
            protocol.share_partial_signature(session_id, key).await?;
        }
        ProtocolEvent::SessionComplete { session_id, signature } => {
            info!(session_id = %session_id, signature = %hex::encode(signature), "Session complete");
        }
        ProtocolEvent::SessionAborted { session_id, reason, .. } => {
            warn!(session_id = %session_id, reason = %reason, "Session aborted");
        }
        ProtocolEvent::SessionTimeout { session_id, reason } => {
            warn!(session_id = %session_id, reason = %reason, "Session timed out");
        }
        _ => {}
    }
    Ok(())
}

async fn run_discover(cli: &Cli, criteria: &SignerCriteria) -> Result<()> {
    let protocol = connect(cli).await?;
    let signers = protocol.discover_signers(criteria).await?;

    println!("Signers ({}):", signers.len());
    for ad in &signers {
        let categories: Vec<&str> = ad.categories.iter().map(|c| c.as_str()).collect();
        println!(
            "  {} {} [{}] reputation={} fee={}",
            ad.public_key,
            ad.nickname.as_deref().unwrap_or("-"),
            categories.join(","),
            ad.reputation,
            ad.fee.map(|f| f.to_string()).unwrap_or_else(|| "-".into()),
        );
    }

    protocol.shutdown().await?;
    Ok(())
}

async fn run_sign(
    cli: &Cli,
    message: &str,
    participants: &[PublicKey],
    purpose: Option<&str>,
) -> Result<()> {
    let key = load_key(cli)?;
    let message = hex::decode(message).context("message must be hex")?;
    if participants.is_empty() {
        bail!("at least one co-signer is required");
    }

    let protocol = connect(cli).await?;
    let mut events = protocol.subscribe_events().await?;

    let mut metadata = SessionMetadata::default();
    if let Some(purpose) = purpose {
        metadata = metadata.with_purpose(purpose);
    }
    let session = protocol
        .create_session(&key, participants, &message, metadata)
        .await?;
    let session_id = session.session_id.clone();
    protocol.announce_session(&session_id).await?;

    info!(
        session_id = %session_id,
        participants = session.participants.len(),
        aggregated_key = %session.aggregated_key,
        "Session announced, waiting for co-signers"
    );

    let outcome = loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break Err(anyhow::anyhow!("event stream closed")),
        };
        if event.session_id() != Some(session_id.as_str()) {
            continue;
        }

        step_session(&protocol, &key, &event).await?;
        match event {
            ProtocolEvent::SessionComplete { signature, .. } => break Ok(signature),
            ProtocolEvent::SessionAborted { reason, .. } => break Err(anyhow::anyhow!("session aborted: {}", reason)),
            ProtocolEvent::SessionTimeout { reason, .. } => break Err(anyhow::anyhow!("session timed out: {}", reason)),
            _ => {}
        }
    };

    protocol.shutdown().await?;
    let signature = outcome?;

    println!("Signature: {}", hex::encode(&signature));
    println!("Aggregated Key: {}", session.aggregated_key);
    Ok(())
}

async fn connect(cli: &Cli) -> Result<MuSigProtocol> {
    let config = load_config(cli.config.as_deref())?;
    let transport = RelayTransport::connect(&cli.relay, &cli.name).await?;

    let protocol = MuSigProtocol::new();
    protocol.initialize(Arc::new(transport), config).await?;
    Ok(protocol)
}

fn load_config(path: Option<&Path>) -> Result<ProtocolConfig> {
    let Some(path) = path else {
        return Ok(ProtocolConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: ProtocolConfig = serde_json::from_str(&json)?;
    config.validate()?;
    Ok(config)
}

fn key_path(cli: &Cli) -> PathBuf {
    cli.dest.join(format!("key.{}.json", cli.name))
}

fn load_key(cli: &Cli) -> Result<PrivateKey> {
    let path = key_path(cli);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("reading key file {}, run keygen first", path.display()))?;
    let file: KeyFile = serde_json::from_str(&json)?;
    Ok(PrivateKey::from_hex(&file.secret_key)?)
}
