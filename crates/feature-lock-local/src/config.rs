use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use feature_lock_core::{AcquireMode, ReleaseAction};

/// Configuration for the feature-lock-local CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "feature-lock-local")]
#[command(about = "Acquire, inspect and release feature locks in a local lock store")]
pub struct Config {
    /// Directory holding the lock store files
    #[arg(long, env = "FEATURE_LOCK_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Lock lifetime in seconds when a command does not give one
    #[arg(long, default_value = "300", env = "FEATURE_LOCK_DEFAULT_EXPIRY")]
    pub default_expiry_secs: u64,

    /// Rows fetched per page when listing locks and records
    #[arg(long, default_value = "256")]
    pub page_size: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Lock records by id
    Acquire {
        /// Record type the ids belong to
        #[arg(long)]
        record_type: String,

        /// Record ids to lock
        #[arg(required = true)]
        ids: Vec<String>,

        #[arg(long, default_value = "all-or-nothing")]
        mode: Mode,

        /// Lock lifetime in seconds
        #[arg(long)]
        expiry_secs: Option<u64>,
    },

    /// Show a lock and its locked and failed records
    Show { lock_id: String },

    /// List active locks
    List,

    /// Release a lock and all its records
    Release { lock_id: String },

    /// Release one record held by a lock
    ReleaseRecord { lock_id: String, record_id: String },

    /// Report whether records are locked and whether a lock id may modify them
    Status {
        #[arg(required = true)]
        record_ids: Vec<String>,

        #[arg(long)]
        lock_id: Option<String>,
    },

    /// Extend a lock's lifetime from now
    Renew {
        lock_id: String,

        #[arg(long)]
        expiry_secs: Option<u64>,
    },

    /// Finish a transaction that used a lock
    Complete {
        lock_id: String,

        /// Records the transaction modified
        #[arg(long = "touched", value_delimiter = ',')]
        touched: Vec<String>,

        #[arg(long, default_value = "all")]
        release: Release,
    },

    /// Remove expired locks now
    Sweep,
}

impl Config {
    /// Get the effective store directory.
    pub fn effective_store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("feature-lock")
        })
    }

    /// Lifetime for a command, falling back to the configured default.
    pub fn expiry(&self, secs: Option<u64>) -> Duration {
        Duration::from_secs(secs.unwrap_or(self.default_expiry_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    AllOrNothing,
    BestEffort,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::AllOrNothing => write!(f, "all-or-nothing"),
            Mode::BestEffort => write!(f, "best-effort"),
        }
    }
}

impl From<Mode> for AcquireMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::AllOrNothing => AcquireMode::AllOrNothing,
            Mode::BestEffort => AcquireMode::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Release {
    All,
    Some,
}

impl std::fmt::Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Release::All => write!(f, "all"),
            Release::Some => write!(f, "some"),
        }
    }
}

impl From<Release> for ReleaseAction {
    fn from(release: Release) -> Self {
        match release {
            Release::All => ReleaseAction::All,
            Release::Some => ReleaseAction::Some,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_defaults() {
        let config = Config::try_parse_from([
            "feature-lock-local",
            "--store-dir",
            "/tmp/locks",
            "acquire",
            "--record-type",
            "Road",
            "R1",
            "R2",
        ])
        .unwrap();

        assert_eq!(config.effective_store_dir(), PathBuf::from("/tmp/locks"));
        assert_eq!(config.page_size, 256);
        match config.command {
            Command::Acquire {
                ref record_type,
                ref ids,
                mode,
                expiry_secs,
            } => {
                assert_eq!(record_type, "Road");
                assert_eq!(ids, &["R1", "R2"]);
                assert_eq!(mode, Mode::AllOrNothing);
                assert_eq!(config.expiry(expiry_secs), Duration::from_secs(300));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_complete_parses_touched_list() {
        let config = Config::try_parse_from([
            "feature-lock-local",
            "complete",
            "lock-1",
            "--touched",
            "R1,R2",
            "--release",
            "some",
        ])
        .unwrap();

        match config.command {
            Command::Complete {
                lock_id,
                touched,
                release,
            } => {
                assert_eq!(lock_id, "lock-1");
                assert_eq!(touched, vec!["R1", "R2"]);
                assert_eq!(ReleaseAction::from(release), ReleaseAction::Some);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_acquire_requires_ids() {
        let result = Config::try_parse_from([
            "feature-lock-local",
            "acquire",
            "--record-type",
            "Road",
        ]);
        assert!(result.is_err());
    }
}
