//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    application::render::SourcePolicies, domain::types::SourcePolicy, infra::git::CommitIdentity,
};

pub use cli::{
    CliArgs, Command, FileArgs, GlobalOverrides, PostArgs, RenderOverrides, RevisionArgs,
    SubmitArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pressroom";
const ENV_PREFIX: &str = "PRESSROOM";
const DEFAULT_STORAGE_ROOT: &str = "pressroom-data";
const STATE_DIR: &str = ".state";
const STATE_FILE: &str = "revisions.json";
const LOCKS_DIR: &str = ".locks";
const DEFAULT_QUARTO_PATH: &str = "quarto";
const DEFAULT_RSCRIPT_PATH: &str = "Rscript";
const DEFAULT_TOOLCHAIN_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 0;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub git: GitSettings,
    pub render: RenderSettings,
    pub locks: LockSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Parent of every post's working tree.
    pub root: PathBuf,
    /// JSON file holding post and revision records.
    pub state_file: PathBuf,
}

impl StorageSettings {
    /// Directory holding per-post lock files for the file lock backend.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct GitSettings {
    pub identity: CommitIdentity,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub quarto_path: PathBuf,
    pub rscript_path: PathBuf,
    /// `None` lets external tools run unbounded.
    pub toolchain_timeout: Option<Duration>,
    pub sources: SourcePolicies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// Exclusion inside one process only.
    Memory,
    /// Lock files under the storage root; required when several invocations
    /// share one root.
    File,
}

impl FromStr for LockBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(LockBackend::Memory),
            "file" => Ok(LockBackend::File),
            other => Err(format!("unknown lock backend `{other}` (expected memory|file)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub backend: LockBackend,
    /// `None` waits for the lock indefinitely.
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_global_overrides(&cli.overrides);
    if let Command::Submit(args) = &cli.command {
        raw.apply_render_overrides(&args.render);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    storage: RawStorageSettings,
    git: RawGitSettings,
    render: RawRenderSettings,
    locks: RawLockSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(root) = overrides.storage_root.as_ref() {
            self.storage.root = Some(root.clone());
        }
        if let Some(path) = overrides.state_file.as_ref() {
            self.storage.state_file = Some(path.clone());
        }
        if let Some(backend) = overrides.lock_backend.as_ref() {
            self.locks.backend = Some(backend.clone());
        }
        if let Some(seconds) = overrides.lock_timeout_seconds {
            self.locks.acquire_timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(path) = overrides.quarto_path.as_ref() {
            self.render.quarto_path = Some(path.clone());
        }
        if let Some(path) = overrides.rscript_path.as_ref() {
            self.render.rscript_path = Some(path.clone());
        }
        if let Some(seconds) = overrides.toolchain_timeout_seconds {
            self.render.toolchain_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            storage,
            git,
            render,
            locks,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            storage: build_storage_settings(storage)?,
            git: build_git_settings(git)?,
            render: build_render_settings(render)?,
            locks: build_lock_settings(locks)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let root = storage
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("storage.root", "path must not be empty"));
    }

    let state_file = storage
        .state_file
        .unwrap_or_else(|| root.join(STATE_DIR).join(STATE_FILE));
    if state_file.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.state_file",
            "path must not be empty",
        ));
    }

    Ok(StorageSettings { root, state_file })
}

fn build_git_settings(git: RawGitSettings) -> Result<GitSettings, LoadError> {
    let defaults = CommitIdentity::default();

    let name = git.author_name.unwrap_or(defaults.name);
    if name.trim().is_empty() {
        return Err(LoadError::invalid("git.author_name", "must not be blank"));
    }

    let email = git.author_email.unwrap_or(defaults.email);
    if !email.contains('@') {
        return Err(LoadError::invalid(
            "git.author_email",
            format!("`{email}` is not an email address"),
        ));
    }

    Ok(GitSettings {
        identity: CommitIdentity { name, email },
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let quarto_path = render
        .quarto_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_QUARTO_PATH));
    if quarto_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.quarto_path",
            "path must not be empty",
        ));
    }

    let rscript_path = render
        .rscript_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RSCRIPT_PATH));
    if rscript_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.rscript_path",
            "path must not be empty",
        ));
    }

    let toolchain_timeout = optional_seconds(
        render
            .toolchain_timeout_seconds
            .unwrap_or(DEFAULT_TOOLCHAIN_TIMEOUT_SECS),
    );

    let defaults = SourcePolicies::default();
    let sources = SourcePolicies {
        main: source_policy(render.main_source, defaults.main, "render.main_source")?,
        branch: source_policy(render.branch_source, defaults.branch, "render.branch_source")?,
    };

    Ok(RenderSettings {
        quarto_path,
        rscript_path,
        toolchain_timeout,
        sources,
    })
}

fn build_lock_settings(locks: RawLockSettings) -> Result<LockSettings, LoadError> {
    let backend = match locks.backend {
        Some(value) => LockBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("locks.backend", reason))?,
        None => LockBackend::File,
    };

    let acquire_timeout = optional_seconds(
        locks
            .acquire_timeout_seconds
            .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
    );

    Ok(LockSettings {
        backend,
        acquire_timeout,
    })
}

fn source_policy(
    value: Option<String>,
    default: SourcePolicy,
    key: &'static str,
) -> Result<SourcePolicy, LoadError> {
    match value {
        Some(value) => {
            SourcePolicy::from_str(&value).map_err(|err| LoadError::invalid(key, err.to_string()))
        }
        None => Ok(default),
    }
}

/// Zero disables the bound.
fn optional_seconds(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    root: Option<PathBuf>,
    state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGitSettings {
    author_name: Option<String>,
    author_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    quarto_path: Option<PathBuf>,
    rscript_path: Option<PathBuf>,
    toolchain_timeout_seconds: Option<u64>,
    main_source: Option<String>,
    branch_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLockSettings {
    backend: Option<String>,
    acquire_timeout_seconds: Option<u64>,
}
