/// Audit parameter loader with validation and hot-reload support.
///
/// Reads `audit.yaml` from a config directory, validates on load, watches
/// for file changes via `notify`, and publishes parameter changes via
/// `tokio::sync::watch`.
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::AuditParams;
use crate::errors::AuditError;

/// File name of the audit parameters inside the config directory.
pub const PARAMS_FILE: &str = "audit.yaml";

/// Upper bound on pre or post probes per audit.
const MAX_PROBES: usize = 10_000;

/// Upper bound on lookups in flight per audit.
const MAX_PARALLELISM: usize = 256;

/// Loads, validates, and watches audit parameters from a directory.
///
/// Expected directory structure:
/// ```text
/// config/
/// └── audit.yaml
/// ```
pub struct ParamsLoader {
    /// Root config directory path.
    config_dir: PathBuf,
    /// Watch sender for broadcasting parameter changes.
    tx: watch::Sender<AuditParams>,
    /// File watcher handle (kept alive to maintain the watch).
    _watcher: Option<RecommendedWatcher>,
}

impl ParamsLoader {
    /// Load and validate parameters, returning the loader and a receiver
    /// for subscribing to changes.
    ///
    /// Call `watch()` afterwards to start hot-reload file watching.
    pub fn load(config_dir: &Path) -> Result<(Self, watch::Receiver<AuditParams>), AuditError> {
        let params = Self::load_params(config_dir)?;
        Self::validate(&params)?;

        let (tx, rx) = watch::channel(params);

        Ok((
            Self {
                config_dir: config_dir.to_path_buf(),
                tx,
                _watcher: None,
            },
            rx,
        ))
    }

    /// Start watching the config directory for changes.
    ///
    /// Valid new parameters are broadcast on the watch channel. Invalid files
    /// are logged and the previous parameters stay in effect.
    pub fn watch(&mut self) -> Result<(), AuditError> {
        let config_dir = self.config_dir.clone();
        let tx = self.tx.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    match Self::load_params(&config_dir).and_then(|p| {
                        Self::validate(&p)?;
                        Ok(p)
                    }) {
                        Ok(params) => {
                            tx.send_if_modified(|current| {
                                if *current == params {
                                    return false;
                                }
                                *current = params;
                                true
                            });
                            tracing::info!("audit params reloaded");
                        }
                        Err(e) => {
                            tracing::warn!("audit params reload failed, keeping previous params: {e}");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("file watcher error: {e}");
                }
            }
        })
        .map_err(|e| AuditError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&self.config_dir, RecursiveMode::NonRecursive)
            .map_err(|e| AuditError::Config(format!("failed to watch config directory: {e}")))?;

        self._watcher = Some(watcher);
        tracing::info!(dir = %self.config_dir.display(), "started watching config directory");
        Ok(())
    }

    /// Subscribe another receiver to parameter changes.
    pub fn subscribe(&self) -> watch::Receiver<AuditParams> {
        self.tx.subscribe()
    }

    /// Read `audit.yaml` from the config directory.
    pub fn load_params(config_dir: &Path) -> Result<AuditParams, AuditError> {
        let path = config_dir.join(PARAMS_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| AuditError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| AuditError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse parameters from YAML text. Missing fields take their defaults.
    pub fn parse(yaml: &str) -> Result<AuditParams, AuditError> {
        if yaml.trim().is_empty() {
            return Ok(AuditParams::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate parameters for internal consistency.
    ///
    /// Checks:
    /// - parallelism, lru_size, and lock_table_size are positive
    /// - parallelism and probe counts stay within sane bounds
    /// - at least one probe is drawn per audit
    pub fn validate(params: &AuditParams) -> Result<(), AuditError> {
        if params.parallelism == 0 {
            return Err(AuditError::Config(
                "parallelism must be positive (got 0)".to_string(),
            ));
        }
        if params.parallelism > MAX_PARALLELISM {
            return Err(AuditError::Config(format!(
                "parallelism must be at most {MAX_PARALLELISM} (got {})",
                params.parallelism
            )));
        }
        if params.lru_size == 0 {
            return Err(AuditError::Config("lru_size must be positive (got 0)".to_string()));
        }
        if params.lock_table_size == 0 {
            return Err(AuditError::Config(
                "lock_table_size must be positive (got 0)".to_string(),
            ));
        }
        for (name, count) in [
            ("num_pre_probes", params.num_pre_probes),
            ("num_post_probes", params.num_post_probes),
        ] {
            if count > MAX_PROBES {
                return Err(AuditError::Config(format!(
                    "{name} must be at most {MAX_PROBES} (got {count})"
                )));
            }
        }
        if params.num_post_probes == 0 {
            return Err(AuditError::Config(
                "num_post_probes must be positive; an audit that never samples new links certifies nothing"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
