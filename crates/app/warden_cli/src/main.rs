pub use self::error::{Error, Result};

mod cli;
mod error;
mod logging;

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands};
use warden_core::auth::jwt::TokenService;
use warden_core::auth::secret::generate_secret;
use warden_core::config::{AuthSettings, Backend, WardenConfig};
use warden_core::models::auth::User;
use warden_core::store::{self, CredentialStore, StoreError};

/// Environment variable holding the password for `create-user`.
const PASSWORD_ENV: &str = "WARDEN_PASSWORD";

fn main() {
    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::GenSecret { bytes } => {
            if bytes == 0 {
                return Err(Error::Custom("secret length must be positive".into()));
            }
            println!("{}", generate_secret(bytes)?);
        }
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        command => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(admin(&cli.config, command))?;
        }
    }

    Ok(())
}

/// Commands that need the credential store.
async fn admin(config_path: &Path, command: Commands) -> Result<()> {
    let config = load_config(config_path)?;
    let credentials = open_store(&config).await?;

    match command {
        Commands::CreateUser {
            username,
            password_stdin,
        } => {
            let password = read_password(password_stdin)?;
            let id = credentials.create_user(&username, &password).await?;
            log::info!("created user {username}");
            println!("{id}");
        }
        Commands::DeleteUser { username } => {
            let user = lookup(&credentials, &username).await?;
            credentials.delete_user(&user.id).await?;
            log::info!("deleted user {username}");
        }
        Commands::BanUser { username } => {
            let user = lookup(&credentials, &username).await?;
            credentials.ban_user(&user.id).await?;
            log::info!("banned user {username}");
        }
        Commands::UnbanUser { username } => {
            let user = lookup(&credentials, &username).await?;
            credentials.unban_user(&user.id).await?;
            log::info!("unbanned user {username}");
        }
        Commands::BanIp { ip } => {
            credentials.ban_ip(&ip).await?;
            log::info!("banned IP {ip}");
        }
        Commands::UnbanIp { ip } => {
            credentials.unban_ip(&ip).await?;
            log::info!("unbanned IP {ip}");
        }
        Commands::BanHwid { hwid } => {
            credentials.ban_hwid(&hwid).await?;
            log::info!("banned HWID {hwid}");
        }
        Commands::UnbanHwid { hwid } => {
            credentials.unban_hwid(&hwid).await?;
            log::info!("unbanned HWID {hwid}");
        }
        Commands::RevokeSessions { username } => {
            let user = lookup(&credentials, &username).await?;
            let settings = AuthSettings::from_config(&config.protections)?;
            let tokens = TokenService::new(Arc::new(settings), credentials);
            let revoked = tokens.revoke_all_for_user(&user.id).await?;
            log::info!("revoked {revoked} refresh token(s) of {username}");
            println!("{revoked}");
        }
        Commands::GenSecret { .. } | Commands::Version => {}
    }

    Ok(())
}

/// Password for a new user, from stdin or [`PASSWORD_ENV`]. Never argv.
fn read_password(from_stdin: bool) -> Result<String> {
    if from_stdin {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        let password = line.trim_end_matches(['\r', '\n']);
        if password.is_empty() {
            return Err(Error::Custom("no password on stdin".into()));
        }
        return Ok(password.to_string());
    }
    match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => Ok(password),
        _ => Err(Error::Custom(format!(
            "no password given: set {PASSWORD_ENV} or pass --password-stdin"
        ))),
    }
}

fn load_config(path: &Path) -> Result<WardenConfig> {
    let (config, created) = WardenConfig::load_or_init(path)?;
    if created {
        log::info!("wrote default config to {}", path.display());
    }
    Ok(config)
}

async fn open_store(config: &WardenConfig) -> Result<CredentialStore> {
    if config.storage.backend()? == Backend::Embedded {
        return Err(Error::Custom(
            "the embedded store only lives inside the server process; \
             enable sqlite or redis to manage it from the command line"
                .into(),
        ));
    }
    let repo = store::open(&config.storage).await?;
    Ok(CredentialStore::new(repo, config.storage.operation_timeout()))
}

async fn lookup(credentials: &CredentialStore, username: &str) -> Result<User> {
    credentials
        .find_user_by_username(username)
        .await?
        .ok_or_else(|| StoreError::UserNotFound(username.to_string()).into())
}
