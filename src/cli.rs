//! Command-line interface definitions

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Result, SyncError};
use crate::session::SessionConfig;

/// Delta-transfer directory synchronizer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[allow(clippy::struct_excessive_bools)]
pub struct Args {
    /// Source directory or file (omitted in --server mode)
    #[arg(value_name = "SOURCE", required_unless_present = "server")]
    pub source: Option<String>,

    /// Destination directory, or [user@]host:path for a remote push
    #[arg(value_name = "DEST", required_unless_present = "server")]
    pub destination: Option<String>,

    /// Archive mode: recursive, preserve perms and times, keep symlinks
    #[arg(short = 'a', long)]
    pub archive: bool,

    /// Recurse into directories
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Compress frame payloads, adapting the level to the link
    #[arg(short = 'z', long)]
    pub compress: bool,

    /// Walk and classify only; transfer no file bytes
    #[arg(long)]
    pub dry_run: bool,

    /// Compare whole-file hashes instead of size and mtime
    #[arg(short = 'c', long)]
    pub checksum: bool,

    /// Skip files whose destination copy is newer
    #[arg(short = 'u', long)]
    pub update: bool,

    /// Remove destination paths that are not in the source
    #[arg(long)]
    pub delete: bool,

    /// Exclude source paths matching this glob (repeatable)
    #[arg(long, value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Show a transfer progress bar
    #[arg(long)]
    pub progress: bool,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Run as the receiving peer over stdin/stdout; DEST is taken from
    /// the remaining argument
    #[arg(long, value_name = "DEST")]
    pub server: Option<PathBuf>,

    /// Shell command used to reach a remote host
    #[arg(long, default_value = "ssh")]
    pub remote_shell: String,
}

/// Where a sync endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote {
        user: Option<String>,
        host: String,
        path: PathBuf,
    },
}

impl Location {
    /// Parse `[user@]host:path` or a plain local path. A single-character
    /// prefix before `:` is treated as a Windows-style drive, not a host.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        if let Some((head, tail)) = spec.split_once(':') {
            if head.len() > 1 && !head.contains('/') {
                let (user, host) = match head.split_once('@') {
                    Some((user, host)) => (Some(user.to_string()), host.to_string()),
                    None => (None, head.to_string()),
                };
                return Self::Remote {
                    user,
                    host,
                    path: PathBuf::from(tail),
                };
            }
        }
        Self::Local(PathBuf::from(spec))
    }
}

impl Args {
    /// Validate flag combinations and paths.
    pub fn validate(&self) -> Result<()> {
        if self.quiet && self.verbose > 0 {
            return Err(SyncError::Config(
                "cannot use both --quiet and --verbose".to_string(),
            ));
        }
        if self.server.is_some() {
            if self.source.is_some() || self.destination.is_some() {
                return Err(SyncError::Config(
                    "--server takes no SOURCE/DEST arguments".to_string(),
                ));
            }
            return Ok(());
        }

        let source = self.source_location();
        match &source {
            Location::Local(path) => {
                if !path.exists() {
                    return Err(SyncError::Config(format!(
                        "source path does not exist: {}",
                        path.display()
                    )));
                }
            }
            Location::Remote { .. } => {
                return Err(SyncError::Config(
                    "pulling from a remote source is not supported; push instead".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn source_location(&self) -> Location {
        Location::parse(self.source.as_deref().unwrap_or(""))
    }

    #[must_use]
    pub fn dest_location(&self) -> Location {
        Location::parse(self.destination.as_deref().unwrap_or(""))
    }

    /// Whether directory recursion is on.
    #[must_use]
    pub const fn should_recurse(&self) -> bool {
        self.recursive || self.archive
    }

    /// The configuration record the session core consumes.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            recursive: self.should_recurse(),
            compress: self.compress,
            checksum: self.checksum,
            update: self.update,
            delete: self.delete,
            dry_run: self.dry_run,
            progress: self.progress,
            excludes: self.exclude.clone(),
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_parses_local_and_remote() {
        assert_eq!(Location::parse("/tmp/x"), Location::Local("/tmp/x".into()));
        assert_eq!(
            Location::parse("host:/srv/data"),
            Location::Remote {
                user: None,
                host: "host".to_string(),
                path: "/srv/data".into(),
            }
        );
        assert_eq!(
            Location::parse("alice@host:rel/path"),
            Location::Remote {
                user: Some("alice".to_string()),
                host: "host".to_string(),
                path: "rel/path".into(),
            }
        );
        // Drive-letter-looking specs stay local.
        assert_eq!(Location::parse("c:tmp"), Location::Local("c:tmp".into()));
    }

    #[test]
    fn validate_rejects_quiet_verbose_conflict() {
        let args = Args::parse_from(["psync", "-q", "-v", "src", "dst"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_source() {
        let args = Args::parse_from(["psync", "/definitely/not/there", "dst"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn archive_implies_recursive() {
        let args = Args::parse_from(["psync", "-a", ".", "dst"]);
        assert!(args.should_recurse());
        assert!(args.session_config().recursive);
    }

    #[test]
    fn session_config_carries_flags() {
        let args = Args::parse_from([
            "psync",
            "-z",
            "--delete",
            "--checksum",
            "--exclude",
            "*.log",
            ".",
            "dst",
        ]);
        let config = args.session_config();
        assert!(config.compress);
        assert!(config.delete);
        assert!(config.checksum);
        assert_eq!(config.excludes, vec!["*.log".to_string()]);
    }

    #[test]
    fn server_mode_needs_no_positionals() {
        let args = Args::parse_from(["psync", "--server", "/srv/dest"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.server, Some(PathBuf::from("/srv/dest")));
    }
}
