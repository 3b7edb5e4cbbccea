//! fieldsec keyring tool.
//!
//! # Usage
//!
//! ```bash
//! # List the roles a keyring holds (never prints key material)
//! FIELDSEC_KEYRING_PASSWORD=... fieldsec-keyring list site.keyring
//!
//! # Provision a keyring with a group key and two tunnelling users
//! FIELDSEC_KEYRING_PASSWORD=... fieldsec-keyring create site.keyring \
//!     --group-key 000102030405060708090a0b0c0d0e0f --user 1=secret-1 --user 2=secret-2
//! ```

use std::{io::Write, path::PathBuf};

use clap::{Parser, Subcommand};
use fieldsec_channel::{SystemEnv, load_keyring, save_keyring};
use fieldsec_crypto::{KEY_SIZE, KeyringBuilder};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// fieldsec keyring tool
#[derive(Parser, Debug)]
#[command(name = "fieldsec-keyring")]
#[command(about = "Inspect and provision fieldsec keyring files")]
#[command(version)]
struct Args {
    /// Keyring password
    #[arg(long, env = "FIELDSEC_KEYRING_PASSWORD", hide_env_values = true)]
    password: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Unlock a keyring and list its roles
    List {
        /// Keyring file
        path: PathBuf,
    },

    /// Seal a new keyring, replacing any existing file
    Create {
        /// Keyring file
        path: PathBuf,

        /// Multicast group key (32 hex digits)
        #[arg(long)]
        group_key: Option<String>,

        /// Tunnelling user as ID=PASSWORD (repeatable)
        #[arg(long = "user", value_parser = parse_user)]
        users: Vec<(u8, String)>,

        /// Device authentication password
        #[arg(long)]
        device_password: Option<String>,
    },
}

fn parse_user(value: &str) -> Result<(u8, String), String> {
    let (id, password) =
        value.split_once('=').ok_or_else(|| format!("expected ID=PASSWORD, got {value:?}"))?;
    let id = id.parse::<u8>().map_err(|e| format!("invalid user id {id:?}: {e}"))?;
    if password.is_empty() {
        return Err(format!("user {id} has an empty password"));
    }
    Ok((id, password.to_owned()))
}

fn parse_group_key(hex_key: &str) -> Result<[u8; KEY_SIZE], Box<dyn std::error::Error>> {
    let bytes = hex::decode(hex_key)?;
    let key = <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
        .map_err(|_| format!("group key must be {KEY_SIZE} bytes, got {}", bytes.len()))?;
    Ok(key)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    match args.command {
        Command::List { path } => {
            let keyring = load_keyring(&path, &args.password)?;

            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}: {} entries", path.display(), keyring.len())?;
            for role in keyring.roles() {
                writeln!(stdout, "  {role}")?;
            }
        },

        Command::Create { path, group_key, users, device_password } => {
            let mut builder = KeyringBuilder::new();
            if let Some(hex_key) = group_key {
                builder = builder.group_key(parse_group_key(&hex_key)?);
            }
            for (user_id, password) in &users {
                builder = builder.user_password(*user_id, password);
            }
            if let Some(password) = device_password {
                builder = builder.device_password(&password);
            }
            if builder.is_empty() {
                return Err("refusing to create an empty keyring".into());
            }

            save_keyring(&path, &builder, &args.password, &SystemEnv::new())?;
            tracing::info!(path = %path.display(), entries = builder.len(), "keyring created");
        },
    }

    Ok(())
}
