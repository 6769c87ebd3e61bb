use std::sync::Arc;

use clap::Parser as _;
use clap_derive::{Parser, Subcommand};
use lms_auth::client::{ApiClient, FileStorage};
use lms_auth::config::Configuration;
use lms_auth::{RoleName, TokenIssuer, TokenPayload, crypto};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Hash a password to paste into the `users` section of the configuration.
    HashPassword { password: String },
    /// Issue a token pair for a configured user, signed with configured secrets.
    Issue {
        /// ID of the user.
        user: String,
        /// Configuration file, instead of `LMS_CONFIG` or `config.yaml`.
        #[clap(long, short)]
        config: Option<String>,
        /// Sign with this role instead of the configured one.
        #[clap(long, short)]
        role: Option<RoleName>,
    },
    /// Print the payload of a token without checking its signature.
    Decode { token: String },
    /// Sign in on a running server and print who the token belongs to.
    Whoami {
        email: String,
        password: String,
        #[clap(long, short, default_value = "http://localhost:8080")]
        url: String,
        /// Keep tokens in this JSON file and reuse them on the next run,
        /// instead of signing out.
        #[clap(long, short)]
        store: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Commands::HashPassword { password } => {
            println!("{}", crypto::hash_password(password)?);
        },
        Commands::Issue { user, config, role } => {
            let mut configuration = Configuration::default();
            if let Some(path) = config {
                configuration = configuration.path(path);
            }
            let configuration = configuration.read()?;

            let Some(user) = configuration.users.iter().find(|u| u.id == user) else {
                return Err(format!("user {user:?} is not in configuration").into());
            };

            let issuer = TokenIssuer::new(
                &configuration.url,
                &configuration.token.access_secret,
                &configuration.token.refresh_secret,
            )?;
            let mut user = user.clone();
            if let Some(role) = role {
                user.role.name = role;
            }
            let tokens = issuer.generate_tokens(&user)?;
            println!("{}", serde_json::to_string_pretty(&tokens)?);
        },
        Commands::Decode { token } => match TokenIssuer::decode_token(&token) {
            Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
            None => return Err("token is malformed".into()),
        },
        Commands::Whoami {
            email,
            password,
            url,
            store,
        } => {
            let client = match &store {
                Some(path) => ApiClient::builder(url)
                    .storage(Arc::new(FileStorage::new(path)))
                    .build()?,
                None => ApiClient::new(url)?,
            };
            client.session().restore().await?;
            if client.session().access_token().await.is_none() {
                client.login(&email, &password).await?;
            }

            let payload: TokenPayload = client.get_json("/api/auth/me").await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);

            if store.is_none() {
                client.logout().await?;
            }
        },
    }

    Ok(())
}
