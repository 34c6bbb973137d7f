use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

const HELP_EPILOG: &str = r#"Config resolution order:
  1) --config/-c PATH
  2) $FBOP_CONFIG
  3) platform default, e.g. ~/.config/fbop/client.yaml

Amounts are dollars with up to two decimals: 5, 12.30, $4.99.
Sign-in tokens are kept in the OS keyring, keyed by server URL.
"#;

#[derive(Debug, Parser)]
#[command(
    name = "fbop-client",
    version,
    about = "First Bank of Pig command-line client for parents and kid devices",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Server URL (e.g., http://127.0.0.1:5151). Saved to config on first use.
    #[arg(short, long)]
    pub server: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in and save the token in the keyring
    SignIn {
        /// Sign in without credentials (kid devices)
        #[arg(long, conflicts_with = "username")]
        anonymous: bool,
        /// Username. Falls back to prompt.
        #[arg(long)]
        username: Option<String>,
    },
    /// End the session and forget the stored token
    SignOut,
    /// Show who is signed in, the server version and the current family
    Whoami,
    /// Create a family owned by the signed-in parent
    CreateFamily { name: String },
    /// Rename the current family
    RenameFamily { name: String },
    /// Delete the current family (owner only)
    DeleteFamily,
    /// List the parents of the current family
    Parents,
    /// Remove a parent from the family; the owner cannot be removed
    RemoveParent { principal_id: String },
    /// Mint a 24-hour invite code for another parent
    Invite,
    /// Join a family with an invite code
    Join { code: String },
    /// Add a child to the family
    AddChild { name: String },
    /// List children with their balances
    Children,
    /// Rename a child
    RenameChild { child_id: String, name: String },
    /// Remove a child; its transactions are kept
    RemoveChild { child_id: String },
    /// Mint a 1-hour lookup code a kid device can scan
    Qr {
        child_id: String,
        /// Also write the QR code as an SVG image
        #[arg(long)]
        svg: Option<PathBuf>,
    },
    /// Pair this device with a child using a lookup code (kid mode)
    Pair {
        code: String,
        /// Name shown to parents in the device list
        #[arg(long)]
        device_name: Option<String>,
    },
    /// Record money going into a child's account
    Deposit(TransactionArgs),
    /// Record money coming out of a child's account
    Withdraw(TransactionArgs),
    /// Replace a transaction's amount, description and date
    EditTx {
        child_id: String,
        tx_id: String,
        /// Signed dollar amount; negative for a withdrawal
        #[arg(allow_hyphen_values = true)]
        amount: String,
        description: String,
        /// Effective date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Delete a transaction
    DeleteTx { child_id: String, tx_id: String },
    /// Show a balance and its transactions. Kid devices omit CHILD.
    Balance { child_id: Option<String> },
    /// List devices registered to a child
    Devices {
        child_id: String,
        /// Keep printing the list as devices pair or are revoked
        #[arg(long)]
        watch: bool,
    },
    /// Revoke a device's access to a child
    Revoke {
        child_id: String,
        principal_id: String,
    },
    /// Kid session: check access, then follow transactions until revoked
    Watch,
    /// Clear the local config, keeping only the server URL
    Reset,
}

#[derive(Debug, clap::Args)]
pub struct TransactionArgs {
    pub child_id: String,
    /// Dollar amount, e.g. 5 or 12.30
    pub amount: String,
    pub description: String,
    /// Effective date (YYYY-MM-DD); defaults to today
    #[arg(long)]
    pub date: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_money_commands() {
        let cli = Cli::try_parse_from([
            "fbop-client",
            "deposit",
            "C1",
            "5.00",
            "birthday",
            "--date",
            "2026-03-01",
        ])
        .unwrap();
        match cli.command {
            Command::Deposit(args) => {
                assert_eq!(args.child_id, "C1");
                assert_eq!(args.amount, "5.00");
                assert_eq!(args.date, NaiveDate::from_ymd_opt(2026, 3, 1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn anonymous_and_username_conflict() {
        assert!(
            Cli::try_parse_from(["fbop-client", "sign-in", "--anonymous", "--username", "a"])
                .is_err()
        );
        let cli = Cli::try_parse_from(["fbop-client", "-s", "pig.local", "pair", "qz4k8mnp"])
            .unwrap();
        assert_eq!(cli.server.as_deref(), Some("pig.local"));
        assert!(matches!(cli.command, Command::Pair { device_name: None, .. }));
    }

    #[test]
    fn edits_take_negative_amounts() {
        let cli =
            Cli::try_parse_from(["fbop-client", "edit-tx", "C1", "T1", "-2.50", "candy"]).unwrap();
        match cli.command {
            Command::EditTx { amount, .. } => assert_eq!(amount, "-2.50"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
