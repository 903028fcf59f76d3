//! Cloak command-line tool
//!
//! Key and archive tooling around `cloak-core`, plus a demo that runs two
//! sessions against each other over the in-memory relay.
//!
//! ```text
//! cloak keygen                                    fresh session public key (JWK)
//! cloak bundle --password P --salt S [--user N]   derive an archive bundle
//!                                                 (--user keeps it, wrapped
//!                                                 with --bundle-key)
//! cloak seal   --password P --salt S --message M  seal text for the archive
//! cloak open   --password P --salt S --record R   open a sealed record
//! cloak demo                                      two peers, handshake, history
//! ```

mod demo;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cloak_core::crypto::{self, ArchiveEncryptedRecord, StoredRecord};
use cloak_core::{AsymmetricKeyPair, BundleStore, CoreConfig, UserId};
use color_eyre::eyre::{Result, WrapErr};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cloak", version, about = "Cloak message protection tooling")]
struct Args {
    /// JSON file with core settings
    #[arg(short, long, global = true, env = "CLOAK_CONFIG")]
    config: Option<PathBuf>,

    /// Device key (64 hex chars) wrapping bundles kept on disk
    #[arg(long, global = true, env = "CLOAK_BUNDLE_KEY", hide_env_values = true)]
    bundle_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a session key pair and print its public half
    Keygen,

    /// Derive the archive bundle for a password
    Bundle {
        #[command(flatten)]
        secret: Secret,

        /// Also keep the bundle in the configured bundle store for this user
        #[arg(long)]
        user: Option<UserId>,
    },

    /// Seal a message the way it is kept in the archive
    Seal {
        #[command(flatten)]
        secret: Secret,

        /// Text to seal
        #[arg(short, long)]
        message: String,
    },

    /// Open a sealed archive record
    Open {
        #[command(flatten)]
        secret: Secret,

        /// Record JSON as printed by `seal`
        #[arg(short, long)]
        record: String,
    },

    /// Run two sessions over the in-memory relay
    Demo {
        /// Message Alice sends
        #[arg(long, default_value = "Hello Bob, this never leaves us in the clear.")]
        first: String,

        /// Message Bob sends back
        #[arg(long, default_value = "Hi Alice, same here.")]
        reply: String,
    },
}

#[derive(clap::Args, Debug)]
struct Secret {
    /// Account password
    #[arg(short, long, env = "CLOAK_PASSWORD")]
    password: String,

    /// Per-user salt
    #[arg(short, long, env = "CLOAK_SALT")]
    salt: String,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloak=info,cloak_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref(), args.bundle_key)?;

    match args.command {
        Command::Keygen => keygen().await,
        Command::Bundle { secret, user } => bundle(&config, &secret, user).await,
        Command::Seal { secret, message } => seal(&secret, &message).await,
        Command::Open { secret, record } => open(&secret, &record).await,
        Command::Demo { first, reply } => demo::run(&config, &first, &reply).await,
    }
}

fn load_config(path: Option<&PathBuf>, bundle_key: Option<String>) -> Result<CoreConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading config {}", path.display()))?;
            let config: CoreConfig = serde_json::from_str(&text)
                .wrap_err_with(|| format!("parsing config {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => CoreConfig::default(),
    };

    if bundle_key.is_some() {
        config.bundle_key = bundle_key;
    }
    config.validate()?;
    Ok(config)
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn keygen() -> Result<()> {
    let keys = tokio::task::spawn_blocking(AsymmetricKeyPair::generate).await??;
    tracing::info!("Generated key {}", keys.public_key().fingerprint());

    println!("{}", serde_json::to_string_pretty(&keys.export_public_key())?);
    Ok(())
}

async fn bundle(config: &CoreConfig, secret: &Secret, user: Option<UserId>) -> Result<()> {
    let bundle = derive(secret).await?;

    if let Some(user) = user {
        if config.bundle_dir.is_none() {
            tracing::warn!("No bundle_dir configured; bundle for {} is not kept", user);
        } else {
            BundleStore::from_config(config)?.save(user, &bundle)?;
            tracing::info!("Stored bundle for user {}", user);
        }
    }

    println!("{}", crypto::serialize_bundle(&bundle)?);
    Ok(())
}

async fn seal(secret: &Secret, message: &str) -> Result<()> {
    let bundle = derive(secret).await?;
    let record = crypto::seal(message.as_bytes(), &bundle)?;

    println!("{}", serde_json::to_string(&record.to_stored())?);
    Ok(())
}

async fn open(secret: &Secret, record: &str) -> Result<()> {
    let stored: StoredRecord = serde_json::from_str(record).wrap_err("record is not valid JSON")?;
    let record = ArchiveEncryptedRecord::from_stored(&stored)?;

    let bundle = derive(secret).await?;
    let plaintext = crypto::open(&record, &bundle)?;

    println!("{}", String::from_utf8_lossy(&plaintext));
    Ok(())
}

async fn derive(secret: &Secret) -> Result<cloak_core::PasswordKeyBundle> {
    let password = secret.password.clone();
    let salt = secret.salt.clone();
    let bundle =
        tokio::task::spawn_blocking(move || crypto::derive_bundle(&password, salt.as_bytes()))
            .await??;
    Ok(bundle)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
