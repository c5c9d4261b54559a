//! Command handling for the Marketspace CLI.
//!
//! `App` wires the API client, the credential store and the session manager
//! together and runs one command against them.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use marketspace_core::{
    ApiClient, AuthError, Config, CredentialStore, SessionManager, SessionState, UserProfile,
};
use tracing::{debug, error, info, warn};

/// Maximum length for email input.
const MAX_EMAIL_LENGTH: usize = 254;

/// Maximum length for password input.
/// 128 chars accommodates password managers and passphrases.
const MAX_PASSWORD_LENGTH: usize = 128;

/// Environment variables, shown after the generated help
const ENV_HELP: &str = "\
Environment:
  MARKETSPACE_API_URL   API base URL (overrides config)
  MARKETSPACE_EMAIL     Default email for login
  MARKETSPACE_PASSWORD  Password for login (skips the prompt)
  RUST_LOG              Log filter, e.g. RUST_LOG=debug";

#[derive(Debug, Parser)]
#[command(name = "marketspace", version)]
#[command(about = "Marketspace CLI - sign in and manage your Marketspace session", long_about = None)]
#[command(after_help = ENV_HELP, arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Sign in (password from MARKETSPACE_PASSWORD or a prompt)
    Login {
        /// Email address; defaults to MARKETSPACE_EMAIL or the last one used
        email: Option<String>,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the signed-in user
    #[command(name = "whoami")]
    WhoAmI {
        /// Fetch the profile from the API before showing it
        #[arg(long)]
        remote: bool,
    },
    /// Show session state and token age
    Status,
    /// Change the display name of the signed-in user
    SetName {
        #[arg(required = true, num_args = 1..)]
        name: Vec<String>,
    },
    /// Change the phone number of the signed-in user
    SetPhone { phone: String },
}

pub struct App {
    config: Config,
    api: ApiClient,
    session: SessionManager,
}

impl App {
    /// Build the client and restore the stored session
    pub async fn new(config: Config) -> Result<Self> {
        let api = ApiClient::new(&config.api_base_url)?;
        let store = config.open_store()?;

        let session = SessionManager::start(
            CredentialStore::new(store),
            Arc::new(api.clone()),
            config.session_options(),
        )
        .await;
        debug!(state = ?session.state(), "Session restored");

        Ok(Self {
            config,
            api,
            session,
        })
    }

    pub async fn run(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Login { email } => self.login(email).await,
            Command::Logout => self.logout().await,
            Command::WhoAmI { remote } => self.whoami(remote).await,
            Command::Status => self.status(),
            Command::SetName { name } => {
                let name = name.join(" ").trim().to_string();
                if name.is_empty() {
                    bail!("Name cannot be empty");
                }
                self.edit_profile(|profile| profile.name = name).await
            }
            Command::SetPhone { phone } => {
                self.edit_profile(|profile| profile.phone = Some(phone)).await
            }
        }
    }

    /// Detach the session from the client and persist pending writes
    pub async fn shutdown(&self) -> Result<(), AuthError> {
        self.session.shutdown().await
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    async fn login(&mut self, email: Option<String>) -> Result<()> {
        let email = match email.or_else(|| std::env::var("MARKETSPACE_EMAIL").ok()) {
            Some(email) => email,
            None => self.prompt_email()?,
        };
        let password = match std::env::var("MARKETSPACE_PASSWORD") {
            Ok(password) => password,
            Err(_) => rpassword::prompt_password("Password: ")?,
        };

        if email.is_empty() || password.is_empty() {
            bail!("Email and password required");
        }
        if email.len() > MAX_EMAIL_LENGTH || password.len() > MAX_PASSWORD_LENGTH {
            bail!("Email or password too long");
        }

        println!("Signing in...");
        match self.session.sign_in(&email, &password).await {
            Ok(()) => {
                self.config.last_email = Some(email);
                if let Err(e) = self.config.save() {
                    warn!(error = %e, "Failed to save config");
                }

                let name = self
                    .session
                    .user()
                    .map(|u| u.display_name().to_string())
                    .unwrap_or_default();
                info!("Login successful");
                println!("Signed in as {}", name);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Login failed");
                Err(anyhow!(e.user_message()))
            }
        }
    }

    fn prompt_email(&self) -> Result<String> {
        match self.config.last_email {
            Some(ref last) => print!("Email [{}]: ", last),
            None => print!("Email: "),
        }
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();

        Ok(match (input.is_empty(), &self.config.last_email) {
            (true, Some(last)) => last.clone(),
            _ => input.to_string(),
        })
    }

    async fn logout(&mut self) -> Result<()> {
        if self.session.state() != SessionState::Authenticated {
            println!("Not signed in.");
        }
        // Always clear storage, even if restore found only half a session
        self.session.sign_out().await;
        println!("Signed out.");
        Ok(())
    }

    // =========================================================================
    // Profile
    // =========================================================================

    async fn whoami(&mut self, remote: bool) -> Result<()> {
        if self.session.state() != SessionState::Authenticated {
            bail!(AuthError::NotSignedIn.user_message());
        }

        if remote {
            let profile = self
                .api
                .fetch_me()
                .await
                .map_err(|e| anyhow!(AuthError::from(e).user_message()))?;
            self.session.update_profile(profile).await?;
        }

        let user = self
            .session
            .user()
            .ok_or_else(|| anyhow!(AuthError::NotSignedIn.user_message()))?;
        self.print_profile(&user);
        Ok(())
    }

    fn print_profile(&self, user: &UserProfile) {
        println!("Name:   {}", user.display_name());
        println!("Email:  {}", user.email);
        println!("Phone:  {}", user.phone.as_deref().unwrap_or("-"));
        match user.avatar_url(self.api.base_url()) {
            Some(url) => println!("Avatar: {}", url),
            None => println!("Avatar: -"),
        }
        println!("ID:     {}", user.id);
    }

    async fn edit_profile(&mut self, edit: impl FnOnce(&mut UserProfile)) -> Result<()> {
        let mut profile = self
            .session
            .user()
            .ok_or_else(|| anyhow!(AuthError::NotSignedIn.user_message()))?;
        edit(&mut profile);

        self.session.update_profile(profile.clone()).await.map_err(|e| {
            error!(error = %e, "Profile update failed");
            anyhow!(e.user_message())
        })?;
        self.print_profile(&profile);
        Ok(())
    }

    fn status(&self) -> Result<()> {
        let snapshot = self.session.snapshot();
        println!("State:      {:?}", snapshot.state);
        println!("Generation: {}", snapshot.generation);
        println!("API:        {}", self.config.api_base_url);
        println!("Storage:    {:?}", self.config.storage_backend);
        if let Some(user) = snapshot.user {
            println!("User:       {} <{}>", user.display_name(), user.email);
        }
        if let Some(token) = self.session.auth_token() {
            println!("Token age:  {}", token.age_display());
            println!(
                "Refresh:    {}",
                if token.refresh_token.is_some() { "available" } else { "none" }
            );
        }
        Ok(())
    }
}
