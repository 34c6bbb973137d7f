use clap::{Parser, Subcommand};
use std::path::PathBuf;

const HELP_EPILOG: &str = r#"Server options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml)
  DB_PATH     (default: data/fbop.db)
  PORT        (default: 5151 or config.listen_port)

The `sweep` command deletes expired invite and lookup codes once and exits.
The `install` command sets up the systemd service, the weekly sweep timer
and a default config. Run it as root (or with sudo) for system-wide install.
"#;

#[derive(Debug, Parser)]
#[command(
    name = "fbop-server",
    version,
    about = "First Bank of Pig server",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Optional subcommand. Without one, runs the server.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Delete expired codes once and exit
    Sweep {
        /// Maximum documents deleted per collection (1..=500)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Install systemd units + default config (run as root for system-wide)
    Install {
        /// Destination path for the server unit
        #[arg(long, default_value = "/etc/systemd/system/fbop-server.service")]
        unit_path: PathBuf,
        /// Directory receiving fbop-sweep.service and fbop-sweep.timer
        #[arg(long, default_value = "/etc/systemd/system")]
        timer_dir: PathBuf,
        /// systemd OnCalendar expression for the sweep timer
        #[arg(long, default_value = "Sun *-*-* 03:00:00")]
        schedule: String,
        /// Destination path for server config
        #[arg(long, default_value = "/etc/fbop/config.yaml")]
        config_path: PathBuf,
        /// Default DB path to include in unit env
        #[arg(long, default_value = "/var/lib/fbop/fbop.db")]
        db_path: PathBuf,
        /// Absolute path to the server binary used in ExecStart
        #[arg(long)]
        bin_path: Option<PathBuf>,
        /// systemd service user (defaults to 'fbop')
        #[arg(long, default_value = "fbop")]
        user: String,
        /// systemd service group (defaults to 'fbop')
        #[arg(long, default_value = "fbop")]
        group: String,
        /// Working directory for the service (defaults to /var/lib/fbop)
        #[arg(long, default_value = "/var/lib/fbop")]
        working_dir: PathBuf,
        /// Overwrite files if they already exist
        #[arg(long)]
        force: bool,
    },
    /// Uninstall systemd units; optionally remove config
    Uninstall {
        /// Path to the server unit to remove
        #[arg(long, default_value = "/etc/systemd/system/fbop-server.service")]
        unit_path: PathBuf,
        /// Directory holding fbop-sweep.service and fbop-sweep.timer
        #[arg(long, default_value = "/etc/systemd/system")]
        timer_dir: PathBuf,
        /// Also remove config file
        #[arg(long)]
        remove_config: bool,
        /// Path to config file
        #[arg(long, default_value = "/etc/fbop/config.yaml")]
        config_path: PathBuf,
    },
}
