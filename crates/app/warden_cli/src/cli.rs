use std::path::PathBuf;

use clap::{Parser, Subcommand};
use warden_core::auth::secret::DEFAULT_SECRET_BYTES;

#[derive(Parser, Debug)]
#[command(name = "warden", about = "Warden operator tools", version)]
pub struct Cli {
    /// Path to the TOML config file. Created with defaults if missing.
    #[arg(long, short, env = "WARDEN_CONFIG", default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a new base64url signing secret
    GenSecret {
        /// Secret length in bytes
        #[arg(long, default_value_t = DEFAULT_SECRET_BYTES)]
        bytes: usize,
    },

    /// Create a user account. The password is read from WARDEN_PASSWORD,
    /// or from the first line of stdin with --password-stdin.
    CreateUser {
        username: String,
        /// Read the password from stdin instead of WARDEN_PASSWORD
        #[arg(long)]
        password_stdin: bool,
    },

    /// Delete a user account and its sessions
    DeleteUser { username: String },

    /// Ban a user by username
    BanUser { username: String },

    /// Lift a user ban
    UnbanUser { username: String },

    /// Add an IP address to the ban list
    BanIp { ip: String },

    /// Remove an IP address from the ban list
    UnbanIp { ip: String },

    /// Add a hardware id to the ban list
    BanHwid { hwid: String },

    /// Remove a hardware id from the ban list
    UnbanHwid { hwid: String },

    /// Invalidate every access and refresh token of a user
    RevokeSessions { username: String },

    /// Print version
    Version,
}
