use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::MIRROOT_VERSION;

#[derive(Parser, Debug)]
#[clap(version = MIRROOT_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Debug)]
    pub verbosity: LevelFilter,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install a new system onto a ZFS mirror of two drives
    Install {
        /// Host name of the new system
        hostname: String,

        /// First drive of the mirror; boots by default
        drive_a: PathBuf,

        /// Second drive of the mirror
        drive_b: PathBuf,

        /// Installation configuration
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// Destroy pools and signatures found on the drives first
        #[clap(long)]
        prewipe: bool,

        /// Timezone of the new system, overriding the configuration
        #[clap(long)]
        timezone: Option<String>,

        /// Do not ask for confirmation
        #[clap(short, long)]
        yes: bool,

        /// Unmount and export the pool once installation completes
        #[clap(long, conflicts_with = "keep_mounted")]
        finalize: bool,

        /// Leave the new system mounted at the target for inspection
        #[clap(long)]
        keep_mounted: bool,

        /// Path to save an eventual fatal error
        #[clap(short, long)]
        error: Option<PathBuf>,
    },

    /// Destroy pools on two drives and clear their signatures and partition tables
    Wipe {
        drive_a: PathBuf,
        drive_b: PathBuf,

        /// Do not ask for confirmation
        #[clap(short, long)]
        yes: bool,
    },

    /// Validate the first boot and retract the forced pool import
    #[clap(name = "first-boot", hide(true))]
    FirstBoot,

    /// Replicate the mounted ESP to every other drive of the mirror
    #[clap(name = "sync-esp")]
    SyncEsp,

    /// Substitute a new drive for a failed pool member
    #[clap(name = "replace-drive")]
    ReplaceDrive {
        /// Pool member to replace, as listed by `zpool status`
        #[clap(long)]
        failed: String,

        /// The blank drive taking its place
        #[clap(long)]
        new: PathBuf,

        /// Pool to operate on
        #[clap(long)]
        pool: Option<String>,

        /// Do not ask for confirmation
        #[clap(short, long)]
        yes: bool,
    },

    /// Print pool health, ESP mirror membership and first-boot state
    Status {
        /// Pool to report on
        #[clap(long)]
        pool: Option<String>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Install { .. } => "install",
            Commands::Wipe { .. } => "wipe",
            Commands::FirstBoot => "first-boot",
            Commands::SyncEsp => "sync-esp",
            Commands::ReplaceDrive { .. } => "replace-drive",
            Commands::Status { .. } => "status",
        }
    }

    /// Commands whose log is worth keeping on disk.
    pub fn keeps_session_log(&self) -> bool {
        !matches!(self, Commands::Status { .. })
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_args() {
        let cli = Cli::parse_from([
            "mirroot",
            "install",
            "zfs-host01",
            "/dev/sda",
            "/dev/sdb",
            "--prewipe",
            "--yes",
            "--timezone",
            "Europe/Berlin",
        ]);
        match cli.command {
            Commands::Install {
                hostname,
                drive_b,
                prewipe,
                yes,
                timezone,
                finalize,
                ..
            } => {
                assert_eq!(hostname, "zfs-host01");
                assert_eq!(drive_b, PathBuf::from("/dev/sdb"));
                assert!(prewipe && yes && !finalize);
                assert_eq!(timezone.as_deref(), Some("Europe/Berlin"));
            }
            other => panic!("unexpected command {other}"),
        }
    }

    #[test]
    fn test_finalize_conflicts_with_keep_mounted() {
        assert!(Cli::try_parse_from([
            "mirroot",
            "install",
            "h",
            "/dev/sda",
            "/dev/sdb",
            "--finalize",
            "--keep-mounted",
        ])
        .is_err());
    }

    #[test]
    fn test_names() {
        let cli = Cli::parse_from(["mirroot", "first-boot"]);
        assert_eq!(cli.command.to_string(), "first-boot");
        let cli = Cli::parse_from(["mirroot", "replace-drive", "--failed", "sdb3", "--new", "/dev/sdc"]);
        assert_eq!(cli.command.name(), "replace-drive");
        assert!(!Cli::parse_from(["mirroot", "status"]).command.keeps_session_log());
    }
}
