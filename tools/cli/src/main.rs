//! Lockbox CLI - command line interface for local password vaults.
//!
//! Every command opens the vault directory, does its work and locks
//! everything again on exit.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use lockbox_common::{SystemClock, VaultId};
use lockbox_crypto::keyfile::{generate_keyfile, load_keyfile};
use lockbox_crypto::{calibrate, constant_time_eq, AeadAlgorithm, KdfParams};
use lockbox_storage::{LocalProvider, StorageProvider};
use lockbox_vault::{Settings, VaultEntry, VaultManager};

#[derive(Parser)]
#[command(name = "lockbox")]
#[command(about = "Lockbox - local encrypted password vaults")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the registry and vault files.
    #[arg(short, long, default_value = "lockbox-data")]
    dir: PathBuf,

    /// Settings file (default: <dir>/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Create {
        /// Display name.
        #[arg(short, long)]
        name: String,

        /// KDF strength: "interactive", "moderate", "sensitive" or "scrypt".
        #[arg(short, long)]
        strength: Option<String>,

        /// Cipher: "xsalsa20-poly1305", "xchacha20-poly1305" or "aes-256-gcm".
        #[arg(short, long)]
        algorithm: Option<String>,

        /// Require this key file in addition to the password.
        #[arg(short, long)]
        keyfile: Option<PathBuf>,

        /// Generate the key file first.
        #[arg(long, requires = "keyfile")]
        generate_keyfile: bool,
    },

    /// Show a vault's header (no password needed).
    Info {
        /// Vault id or name.
        vault: String,
    },

    /// List the entries of a vault.
    List {
        /// Vault id or name.
        vault: String,

        #[arg(short, long)]
        keyfile: Option<PathBuf>,

        /// Also print passwords.
        #[arg(long)]
        show_passwords: bool,
    },

    /// Add an entry to a vault.
    Add {
        /// Vault id or name.
        vault: String,

        #[arg(short, long)]
        title: String,

        #[arg(short, long, default_value = "")]
        username: String,

        #[arg(long, default_value = "")]
        url: String,

        #[arg(short, long)]
        folder: Option<String>,

        #[arg(long)]
        tag: Vec<String>,

        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Remove an entry from a vault.
    Remove {
        /// Vault id or name.
        vault: String,

        /// Entry id.
        #[arg(short, long)]
        entry: String,

        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Change a vault's master password.
    ChangePassword {
        /// Vault id or name.
        vault: String,

        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Inspect or rebuild the vault registry.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Tune KDF cost so one derivation takes about the configured target.
    Calibrate {
        /// Target in milliseconds (default from settings).
        #[arg(short, long)]
        target_ms: Option<u64>,

        /// Calibrate scrypt instead of Argon2id.
        #[arg(long)]
        scrypt: bool,
    },
}

#[derive(Subcommand)]
enum RegistryAction {
    /// List known vaults.
    List,
    /// Re-scan vault files and rewrite the registry.
    Rebuild,
    /// Make a vault the default.
    SetDefault {
        /// Vault id or name.
        vault: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.dir.join("settings.json"));
    let mut settings = Settings::load(&config_path).context("Failed to load settings")?;

    if let Commands::Calibrate { target_ms, scrypt } = &cli.command {
        return cmd_calibrate(&settings, *target_ms, *scrypt);
    }

    if let Commands::Create {
        strength,
        algorithm,
        ..
    } = &cli.command
    {
        if let Some(strength) = strength {
            // An explicit preset is used exactly, not recalibrated.
            settings.default_kdf = parse_strength(strength)?;
            settings.calibration_target_ms = 0;
        }
        if let Some(algorithm) = algorithm {
            settings.default_algorithm = AeadAlgorithm::from_tag(algorithm)?;
        }
    }

    let manager = open_manager(&cli.dir, settings).await?;
    let result = run(&manager, cli.command).await;
    manager.shutdown().await;
    result
}

async fn run(manager: &VaultManager, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            name,
            keyfile,
            generate_keyfile: generate,
            ..
        } => cmd_create(manager, &name, keyfile.as_deref(), generate).await,

        Commands::Info { vault } => cmd_info(manager, &vault).await,

        Commands::List {
            vault,
            keyfile,
            show_passwords,
        } => cmd_list(manager, &vault, keyfile.as_deref(), show_passwords).await,

        Commands::Add {
            vault,
            title,
            username,
            url,
            folder,
            tag,
            keyfile,
        } => {
            let mut entry = VaultEntry::new(title, String::new());
            entry.username = username;
            entry.url = url;
            entry.folder = folder;
            entry.tags = tag;
            cmd_add(manager, &vault, entry, keyfile.as_deref()).await
        }

        Commands::Remove {
            vault,
            entry,
            keyfile,
        } => cmd_remove(manager, &vault, &entry, keyfile.as_deref()).await,

        Commands::ChangePassword { vault, keyfile } => {
            cmd_change_password(manager, &vault, keyfile.as_deref()).await
        }

        Commands::Registry { action } => cmd_registry(manager, action).await,

        Commands::Calibrate { .. } => Ok(()),
    }
}

async fn open_manager(dir: &Path, settings: Settings) -> Result<VaultManager> {
    let index: Arc<dyn StorageProvider> =
        Arc::new(LocalProvider::new(dir).context("Failed to open data directory")?);
    let vaults: Arc<dyn StorageProvider> = Arc::new(
        LocalProvider::new(dir.join("vaults")).context("Failed to open vault directory")?,
    );

    VaultManager::open(
        settings,
        Arc::new(SystemClock),
        index,
        vec![("local".to_string(), vaults)],
    )
    .await
    .context("Failed to open vault manager")
}

fn parse_strength(strength: &str) -> Result<KdfParams> {
    Ok(match strength {
        "interactive" => KdfParams::interactive(),
        "moderate" => KdfParams::moderate(),
        "sensitive" => KdfParams::sensitive(),
        "scrypt" => KdfParams::scrypt_default(),
        _ => {
            anyhow::bail!("Invalid strength. Use: interactive, moderate, sensitive, or scrypt");
        }
    })
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password.into_bytes()))
}

fn read_keyfile(path: Option<&Path>) -> Result<Option<Zeroizing<Vec<u8>>>> {
    path.map(|p| load_keyfile(p).context("Failed to load key file"))
        .transpose()
}

/// Accept a vault id or a registered name.
async fn resolve_vault(manager: &VaultManager, vault: &str) -> Result<VaultId> {
    if let Ok(id) = VaultId::parse(vault) {
        return Ok(id);
    }
    manager
        .list_vaults()
        .await
        .into_iter()
        .find(|e| e.name == vault)
        .map(|e| e.vault_id)
        .with_context(|| format!("No vault named '{}'", vault))
}

/// Create a new vault.
async fn cmd_create(
    manager: &VaultManager,
    name: &str,
    keyfile_path: Option<&Path>,
    generate: bool,
) -> Result<()> {
    info!("Creating new vault: {}", name);

    let password = prompt_password("Enter password: ")?;
    let confirm = prompt_password("Confirm password: ")?;

    if !constant_time_eq(&password, &confirm) {
        anyhow::bail!("Passwords do not match");
    }

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let keyfile = match (keyfile_path, generate) {
        (Some(path), true) => {
            Some(generate_keyfile(path).context("Failed to generate key file")?)
        }
        (path, _) => read_keyfile(path)?,
    };

    let session = manager
        .create_vault(name, &password, keyfile.as_deref().map(|k| k.as_slice()), None)
        .await
        .context("Failed to create vault")?;

    println!("Vault created successfully!");
    println!("  ID: {}", session.vault_id);
    println!("  Name: {}", name);
    println!("  Cipher: {}", manager.settings().default_algorithm);
    if let Some(path) = keyfile_path {
        println!("  Key file: {}", path.display());
    }

    Ok(())
}

/// Show vault header information.
async fn cmd_info(manager: &VaultManager, vault: &str) -> Result<()> {
    let vault_id = resolve_vault(manager, vault).await?;
    let header = manager
        .vault_info(&vault_id)
        .await
        .context("Failed to read vault header")?;
    let created = chrono::DateTime::from_timestamp_millis(header.created_at).unwrap_or_default();
    let modified = chrono::DateTime::from_timestamp_millis(header.modified_at).unwrap_or_default();

    println!("Vault Information:");
    println!("  ID: {}", header.vault_id);
    println!("  Format version: {}", header.version);
    println!("  Created: {}", created);
    println!("  Modified: {}", modified);
    println!("  Key file required: {}", header.has_key_file());

    if let Some(entry) = manager
        .list_vaults()
        .await
        .into_iter()
        .find(|e| e.vault_id == vault_id)
    {
        println!("  Name: {}", entry.name);
        println!("  File: {} ({} bytes)", entry.file_path, entry.file_size);
        println!(
            "  Entries: {}, folders: {}, tags: {}",
            entry.entry_count, entry.folder_count, entry.tag_count
        );
    }

    Ok(())
}

async fn unlock(manager: &VaultManager, vault: &str, keyfile: Option<&Path>) -> Result<lockbox_vault::SessionInfo> {
    let vault_id = resolve_vault(manager, vault).await?;
    let keyfile = read_keyfile(keyfile)?;
    let password = prompt_password("Enter password: ")?;

    manager
        .unlock(&vault_id, &password, keyfile.as_deref().map(|k| k.as_slice()))
        .await
        .context("Failed to unlock vault")
}

/// List vault entries.
async fn cmd_list(
    manager: &VaultManager,
    vault: &str,
    keyfile: Option<&Path>,
    show_passwords: bool,
) -> Result<()> {
    let session = unlock(manager, vault, keyfile).await?;
    let entries = manager.read_entries(&session.session_id).await?;

    if entries.is_empty() {
        println!("Vault is empty.");
    } else {
        for entry in &entries {
            let folder = entry.folder.as_deref().unwrap_or("-");
            println!("  {}  {}  [{}]", entry.id, entry.title, folder);
            if !entry.username.is_empty() {
                println!("      user: {}", entry.username);
            }
            if !entry.url.is_empty() {
                println!("      url:  {}", entry.url);
            }
            if show_passwords {
                println!("      pass: {}", entry.password);
            }
        }
    }

    Ok(())
}

/// Add an entry to a vault.
async fn cmd_add(
    manager: &VaultManager,
    vault: &str,
    mut entry: VaultEntry,
    keyfile: Option<&Path>,
) -> Result<()> {
    let session = unlock(manager, vault, keyfile).await?;

    let secret = rpassword::prompt_password("Entry password: ")
        .context("Failed to read entry password")?;
    entry.password = secret;

    let title = entry.title.clone();
    let id = manager
        .upsert_entry(&session.session_id, entry)
        .await
        .context("Failed to add entry")?;

    println!("Entry added: {} ({})", title, id);
    Ok(())
}

/// Remove an entry from a vault.
async fn cmd_remove(
    manager: &VaultManager,
    vault: &str,
    entry_id: &str,
    keyfile: Option<&Path>,
) -> Result<()> {
    let session = unlock(manager, vault, keyfile).await?;
    manager
        .delete_entry(&session.session_id, entry_id)
        .await
        .context("Failed to remove entry")?;

    println!("Entry removed: {}", entry_id);
    Ok(())
}

/// Change vault password.
async fn cmd_change_password(
    manager: &VaultManager,
    vault: &str,
    keyfile: Option<&Path>,
) -> Result<()> {
    info!("Changing vault password");

    let vault_id = resolve_vault(manager, vault).await?;
    let keyfile = read_keyfile(keyfile)?;

    let old_password = prompt_password("Enter current password: ")?;
    let new_password = prompt_password("Enter new password: ")?;
    let confirm = prompt_password("Confirm new password: ")?;

    if !constant_time_eq(&new_password, &confirm) {
        anyhow::bail!("New passwords do not match");
    }

    if new_password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    manager
        .change_master_password(
            &vault_id,
            &old_password,
            &new_password,
            keyfile.as_deref().map(|k| k.as_slice()),
        )
        .await
        .context("Failed to change password")?;

    println!("Password changed successfully!");

    Ok(())
}

async fn cmd_registry(manager: &VaultManager, action: RegistryAction) -> Result<()> {
    match action {
        RegistryAction::List => {
            let vaults = manager.list_vaults().await;
            if vaults.is_empty() {
                println!("No vaults registered.");
            }
            for entry in vaults {
                let marker = if entry.is_default { "*" } else { " " };
                println!(
                    "{} {}  {}  {} entries  {} bytes  ({})",
                    marker,
                    entry.vault_id,
                    entry.name,
                    entry.entry_count,
                    entry.file_size,
                    entry.storage_strategy
                );
            }
        }
        RegistryAction::Rebuild => {
            let count = manager
                .rebuild_registry()
                .await
                .context("Failed to rebuild registry")?;
            println!("Registry rebuilt: {} vaults found", count);
        }
        RegistryAction::SetDefault { vault } => {
            let vault_id = resolve_vault(manager, &vault).await?;
            manager
                .set_default_vault(&vault_id)
                .await
                .context("Failed to set default vault")?;
            println!("Default vault: {}", vault_id);
        }
    }
    Ok(())
}

/// Benchmark the KDF on this machine.
fn cmd_calibrate(settings: &Settings, target_ms: Option<u64>, scrypt: bool) -> Result<()> {
    let target = target_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.calibration_target());
    let base = if scrypt {
        KdfParams::scrypt_default()
    } else {
        settings.default_kdf.clone()
    };

    info!("Calibrating {} for {:?}", base.algorithm().tag(), target);
    let tuned = calibrate(&base, target).context("Calibration failed")?;

    println!("Suggested \"default_kdf\" setting:");
    println!("{}", serde_json::to_string_pretty(&tuned)?);
    Ok(())
}
