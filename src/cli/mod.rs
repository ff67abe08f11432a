//! CLI entry point for pairlink.

pub mod link;

use clap::{Parser, Subcommand};

/// Link this machine to a remote storage account
#[derive(Parser, Debug)]
#[command(name = "pairlink", version, about = "pairlink: remote account linking")]
pub struct Cli {
    /// Service base URL (overrides PAIRLINK_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Link an account
    Link(LinkArgs),
    /// Show linked accounts
    Status,
    /// Remove a linked account
    Unlink(UnlinkArgs),
}

/// Arguments for the `link` subcommand group.
#[derive(Parser, Debug)]
pub struct LinkArgs {
    #[command(subcommand)]
    pub command: LinkCommands,
}

/// Link methods.
#[derive(Subcommand, Debug)]
pub enum LinkCommands {
    /// Scan a pairing code with the companion app
    Pair(PairArgs),
    /// Approve a device code in a browser
    Device(DeviceArgs),
}

#[derive(Parser, Debug)]
pub struct PairArgs {
    /// Label to store the credential under
    #[arg(long, default_value = "default")]
    pub account: String,
}

#[derive(Parser, Debug)]
pub struct DeviceArgs {
    /// Label to store the credential under
    #[arg(long, default_value = "default")]
    pub account: String,

    /// Scopes to request (repeatable; defaults to the configured scopes)
    #[arg(long = "scope")]
    pub scopes: Vec<String>,
}

/// Arguments for `pairlink unlink`.
#[derive(Parser, Debug)]
pub struct UnlinkArgs {
    #[arg(long, default_value = "default")]
    pub account: String,
}
