//! clinvault: encrypted local session store CLI
//!
//! PIN lifecycle:
//!   status                 - lock state, storage locations, document summary
//!   setup-pin              - first-time PIN setup
//!   unlock / lock          - unlock for this login session / forget the key
//!   change-pin             - rotate the PIN and re-seal the session
//!   reset                  - erase everything except the theme (forgotten PIN)
//!
//! Session document:
//!   get <path> / set <path> <value>
//!   score get|set <key> [<value>]
//!   audit [--limit N]
//!   export / import <file> / clear
//!
//! Preferences and config:
//!   theme [value]
//!   config show

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clinvault_core::config::{expand_tilde, ClinvaultConfig};
use clinvault_crypto::{KdfParams, KeyProvider};
use clinvault_secrets::{read_pin, validate_pin_format, KeyManager, LockState};
use clinvault_storage::{open_regions, slots, Region};
use clinvault_store::{KeyPath, Persistence, SessionStore, SetOptions};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "clinvault",
    version,
    about = "Encrypted local store for clinical assessment sessions",
    long_about = "clinvault: keep assessment data on this machine, encrypted under a PIN-derived key"
)]
struct Cli {
    /// Path to config.toml
    #[arg(
        long,
        short = 'c',
        env = "CLINVAULT_CONFIG",
        default_value = "~/.config/clinvault/config.toml"
    )]
    config: PathBuf,

    /// Log level override (RUST_LOG takes precedence)
    #[arg(long, env = "CLINVAULT_LOG")]
    log: Option<String>,

    /// Log format override: text or json
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show lock state, storage locations and a summary of the session
    Status,

    /// Set the PIN for the first time
    #[command(name = "setup-pin")]
    SetupPin,

    /// Unlock for the rest of this login session
    Unlock,

    /// Forget the key (next command will ask for the PIN)
    Lock,

    /// Replace the PIN and re-encrypt the stored session
    #[command(name = "change-pin")]
    ChangePin,

    /// Print the value at a dot path (e.g. patient.name)
    Get {
        path: String,
    },

    /// Write a value at a dot path. VALUE is parsed as JSON, else taken as a string.
    Set {
        path: String,
        value: String,
        /// Do not record an audit entry
        #[arg(long)]
        silent: bool,
    },

    /// Derived scores
    Score {
        #[command(subcommand)]
        action: ScoreAction,
    },

    /// Show the audit log (most recent last)
    Audit {
        /// Only the last N entries
        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },

    /// Print the whole session document as JSON
    Export,

    /// Load patient, instrument and other sub-trees from an exported JSON file
    Import {
        file: PathBuf,
    },

    /// Discard the current session and start an empty one
    Clear {
        #[arg(long)]
        yes: bool,
    },

    /// Erase the PIN, the session and all cached keys. Only the theme survives.
    ///
    /// Asks twice; pass --yes twice to skip both prompts.
    Reset {
        #[arg(long, action = ArgAction::Count)]
        yes: u8,
    },

    /// Show or set the display theme
    Theme {
        value: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ScoreAction {
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = ClinvaultConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);

    if !config_path.exists() {
        tracing::debug!("config file not found: {} (using defaults)", config_path.display());
    }
    if let Commands::Config { action: ConfigAction::Show } = &cli.command {
        return cmd_config_show(&config, &config_path);
    }

    let app = App::open(config)?;
    match cli.command {
        Commands::Status => app.cmd_status().await,
        Commands::SetupPin => app.cmd_setup_pin().await,
        Commands::Unlock => app.cmd_unlock().await,
        Commands::Lock => app.cmd_lock().await,
        Commands::ChangePin => app.cmd_change_pin().await,
        Commands::Get { path } => app.cmd_get(&path).await,
        Commands::Set { path, value, silent } => app.cmd_set(&path, &value, silent).await,
        Commands::Score { action: ScoreAction::Get { key } } => app.cmd_score_get(&key).await,
        Commands::Score { action: ScoreAction::Set { key, value } } => {
            app.cmd_score_set(&key, &value).await
        }
        Commands::Audit { limit } => app.cmd_audit(limit).await,
        Commands::Export => app.cmd_export().await,
        Commands::Import { file } => app.cmd_import(&file).await,
        Commands::Clear { yes } => app.cmd_clear(yes).await,
        Commands::Reset { yes } => app.cmd_reset(yes).await,
        Commands::Theme { value } => app.cmd_theme(value.as_deref()).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

// ── `clinvault config show` ───────────────────────────────────────────────────

fn cmd_config_show(config: &ClinvaultConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    print!(
        "{}",
        toml::to_string_pretty(config).context("serializing config")?
    );
    Ok(())
}

// ── Wiring ────────────────────────────────────────────────────────────────────

struct App {
    config: ClinvaultConfig,
    durable: Region,
    keys: Arc<KeyManager>,
}

impl App {
    fn open(config: ClinvaultConfig) -> Result<Self> {
        let (durable, session) = open_regions(&config).context("opening storage")?;
        let params = KdfParams {
            iterations: config.crypto.kdf_iterations,
        };
        Ok(Self::with_regions(config, durable, session, params))
    }

    fn with_regions(config: ClinvaultConfig, durable: Region, session: Region, params: KdfParams) -> Self {
        let keys = Arc::new(KeyManager::new(durable.clone(), session, params));
        Self {
            config,
            durable,
            keys,
        }
    }

    fn store(&self) -> SessionStore {
        let keys: Arc<dyn KeyProvider> = self.keys.clone();
        let persistence = Persistence::new(self.durable.clone(), keys)
            .with_allow_plaintext(self.config.crypto.allow_plaintext);
        SessionStore::new(persistence, &self.config.session)
    }

    /// Unlock from the session cache, or ask for the PIN.
    async fn ensure_unlocked(&self) -> Result<()> {
        if self.keys.is_unlocked() || self.keys.restore_cached_key().await {
            return Ok(());
        }
        if !self.keys.has_pin_setup().await? {
            anyhow::bail!("no PIN set up yet: run `clinvault setup-pin` first");
        }
        let pin = read_pin("PIN: ")?;
        with_spinner("deriving key", self.keys.verify_pin(&pin)).await?;
        Ok(())
    }

    /// Unlocked store with the persisted session loaded.
    async fn loaded_store(&self) -> Result<SessionStore> {
        self.ensure_unlocked().await?;
        let mut store = self.store();
        store.load().await.context("loading session")?;
        if let Some(reason) = store.read_only_reason() {
            eprintln!("warning: stored session could not be read ({reason}); opened read-only");
            eprintln!("         `clinvault clear` discards it and starts over");
        }
        Ok(store)
    }

    // ── `clinvault status` ────────────────────────────────────────────────────

    async fn cmd_status(&self) -> Result<()> {
        let has_pin = self.keys.has_pin_setup().await?;
        if has_pin && !self.keys.restore_cached_key().await {
            tracing::debug!("no cached key for this session");
        }
        let state = match self.keys.state() {
            LockState::Locked => "locked",
            LockState::Unlocking => "unlocking",
            LockState::Unlocked => "unlocked",
        };

        println!("clinvault {}", env!("CARGO_PKG_VERSION"));
        println!("  pin:         {}", if has_pin { "set" } else { "not set" });
        println!("  state:       {state}");
        println!("  data dir:    {}", self.config.data_dir().display());
        println!("  session dir: {}", self.config.session_dir().display());
        println!(
            "  kdf:         PBKDF2-SHA256, {} iterations for new PINs",
            self.config.crypto.kdf_iterations
        );

        let raw = self.durable.read(slots::SESSION_DOCUMENT).await?;
        let Some(raw) = raw else {
            println!("  session:     none stored");
            return Ok(());
        };
        let sealed = clinvault_crypto::is_envelope(&raw);
        println!(
            "  session:     {} bytes, {}",
            raw.len(),
            if sealed { "encrypted" } else { "PLAINTEXT" }
        );

        if self.keys.is_unlocked() || !sealed {
            let mut store = self.store();
            store.load().await?;
            match store.read_only_reason() {
                Some(reason) => println!("  readable:    no ({reason})"),
                None => {
                    let meta = &store.session()["meta"];
                    println!("  session id:  {}", meta["sessionId"].as_str().unwrap_or("-"));
                    println!("  operator:    {}", meta["operator"].as_str().unwrap_or("-"));
                    println!("  audit:       {} entries", store.audit_log().len());
                }
            }
        }
        Ok(())
    }

    // ── PIN lifecycle ─────────────────────────────────────────────────────────

    async fn cmd_setup_pin(&self) -> Result<()> {
        if self.keys.has_pin_setup().await? {
            anyhow::bail!("a PIN is already set up (use `clinvault change-pin` or `clinvault reset`)");
        }
        let pin = read_new_pin()?;
        with_spinner("deriving key", self.keys.setup_pin(&pin)).await?;

        // Seal any session that was saved before a PIN existed
        let mut store = self.store();
        if store.load().await? {
            store.persist().await.context("re-encrypting existing session")?;
            println!("Existing session encrypted under the new PIN.");
        }
        println!("PIN set. Unlocked for this login session.");
        Ok(())
    }

    async fn cmd_unlock(&self) -> Result<()> {
        if self.keys.restore_cached_key().await {
            println!("Already unlocked.");
            return Ok(());
        }
        self.ensure_unlocked().await?;
        println!("Unlocked.");
        Ok(())
    }

    async fn cmd_lock(&self) -> Result<()> {
        self.keys.lock().await?;
        println!("Locked.");
        Ok(())
    }

    async fn cmd_change_pin(&self) -> Result<()> {
        let old = read_pin("Current PIN: ")?;
        with_spinner("checking PIN", self.keys.verify_pin(&old)).await?;

        // Read the document under the old key before it is replaced
        let mut store = self.store();
        store.load().await.context("loading session")?;
        if let Some(reason) = store.read_only_reason() {
            anyhow::bail!("stored session is unreadable ({reason}); refusing to change PIN");
        }

        let new = read_new_pin()?;
        with_spinner("deriving new key", self.rotate_pin(&mut store, &old, &new)).await?;
        println!("PIN changed.");
        Ok(())
    }

    /// Stage the new PIN, re-seal the loaded session under its key, then make
    /// it live. If the re-seal fails the old PIN stays in force.
    async fn rotate_pin(
        &self,
        store: &mut SessionStore,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<()> {
        let pending = self.keys.begin_pin_change(old, new).await?;
        if let Err(e) = store.persist_with(pending.key()).await {
            if let Err(abort) = self.keys.abort_pin_change(pending).await {
                tracing::warn!("discarding staged PIN change failed: {abort}");
            }
            return Err(anyhow::Error::new(e)
                .context("re-encrypting session under the new PIN failed; PIN unchanged"));
        }
        self.keys
            .commit_pin_change(pending)
            .await
            .context("activating the new PIN")?;
        Ok(())
    }

    async fn cmd_reset(&self, yes: u8) -> Result<()> {
        if yes < 2 {
            eprintln!("This permanently erases the PIN and ALL session data on this machine.");
            if !confirm("Continue?")? {
                println!("Aborted.");
                return Ok(());
            }
            if !confirm_phrase("Type ERASE to confirm:", "ERASE")? {
                println!("Aborted.");
                return Ok(());
            }
        }
        self.keys.reset_all().await?;
        println!("All data erased. Run `clinvault setup-pin` to start again.");
        Ok(())
    }

    // ── Session document ──────────────────────────────────────────────────────

    async fn cmd_get(&self, path: &str) -> Result<()> {
        let path: KeyPath = path.parse()?;
        let store = self.loaded_store().await?;
        match store.get(&path) {
            Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
            None => anyhow::bail!("{path}: not set"),
        }
        Ok(())
    }

    async fn cmd_set(&self, path: &str, raw: &str, silent: bool) -> Result<()> {
        let path: KeyPath = path.parse()?;
        let mut store = self.loaded_store().await?;
        let opts = SetOptions { silent };
        if store.set(&path, parse_value(raw), opts).await? {
            println!("{path} updated");
        } else {
            println!("{path} unchanged");
        }
        Ok(())
    }

    async fn cmd_score_get(&self, key: &str) -> Result<()> {
        let store = self.loaded_store().await?;
        match store.get_score(key) {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("score {key}: not computed"),
        }
        Ok(())
    }

    async fn cmd_score_set(&self, key: &str, raw: &str) -> Result<()> {
        let mut store = self.loaded_store().await?;
        store.set_score(key, parse_value(raw)).await?;
        println!("score {key} stored");
        Ok(())
    }

    async fn cmd_audit(&self, limit: Option<usize>) -> Result<()> {
        let store = self.loaded_store().await?;
        let log = store.audit_log();
        let skip = limit.map_or(0, |n| log.len().saturating_sub(n));
        for entry in log.iter().skip(skip) {
            println!(
                "{}  {:<12} {:<10} {}: {} → {}",
                entry.timestamp,
                if entry.operator.is_empty() { "-" } else { entry.operator.as_str() },
                entry.source_mode.as_str(),
                entry.field,
                fmt_audit_value(entry.old_value.as_ref()),
                fmt_audit_value(entry.new_value.as_ref()),
            );
        }
        if log.is_empty() {
            println!("(no audit entries)");
        }
        Ok(())
    }

    async fn cmd_export(&self) -> Result<()> {
        let store = self.loaded_store().await?;
        println!("{}", store.export_json()?);
        Ok(())
    }

    async fn cmd_import(&self, file: &Path) -> Result<()> {
        let json = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let mut store = self.loaded_store().await?;
        let count = store.import_json(&json).await?;
        println!("imported {count} sections from {}", file.display());
        Ok(())
    }

    async fn cmd_clear(&self, yes: bool) -> Result<()> {
        if !yes && !confirm("Discard the current session?")? {
            println!("Aborted.");
            return Ok(());
        }
        let mut store = self.loaded_store().await?;
        store.clear_session().await?;
        println!("Session cleared.");
        Ok(())
    }

    // ── `clinvault theme` ─────────────────────────────────────────────────────

    async fn cmd_theme(&self, value: Option<&str>) -> Result<()> {
        match value {
            Some(theme) => {
                self.durable.write(slots::THEME, theme).await?;
                println!("theme: {theme}");
            }
            None => {
                let theme = self.durable.read(slots::THEME).await?;
                println!("theme: {}", theme.as_deref().unwrap_or("default"));
            }
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn fmt_audit_value(value: Option<&Value>) -> String {
    match value {
        None => "∅".to_string(),
        Some(v) => v.to_string(),
    }
}

fn read_new_pin() -> Result<SecretString> {
    let pin = read_pin("New PIN (4-6 digits): ")?;
    if !validate_pin_format(pin.expose_secret()) {
        anyhow::bail!("PIN must be 4 to 6 digits");
    }
    if std::env::var(clinvault_secrets::PIN_ENV).is_err() {
        let again = read_pin("Repeat PIN: ")?;
        if again.expose_secret() != pin.expose_secret() {
            anyhow::bail!("PINs do not match");
        }
    }
    Ok(pin)
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn confirm_phrase(prompt: &str, phrase: &str) -> Result<bool> {
    eprint!("{prompt} ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim() == phrase)
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Run `fut` behind a spinner (key derivation takes a noticeable moment).
async fn with_spinner<T>(message: &'static str, fut: impl Future<Output = T>) -> T {
    let pb = make_spinner("pin");
    pb.set_message(message);
    let out = fut.await;
    pb.finish_and_clear();
    out
}
