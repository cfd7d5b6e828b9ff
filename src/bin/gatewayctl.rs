use clap::{Parser, Subcommand};
use pim_security_gateway::auth::credentials::{default_params, hash_password};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gatewayctl")]
#[command(about = "Admin CLI for the PIM security gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, env = "PIM_GATEWAY_ADMIN_KEY")]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Admin(AdminCommands),
    /// Print an Argon2id hash for a `[[users]]` password_hash entry
    HashPassword { password: String },
}

/// Calls to the admin API.
#[derive(Subcommand)]
enum AdminCommands {
    /// Check gateway status and store backend
    Status,
    /// Invalidate every token issued to a user so far
    Invalidate { user_id: String },
    /// Show failed attempts and lockout for a login identifier
    Lockout { identifier: String },
    /// Clear the lockout and attempt counter for a login identifier
    Unlock { identifier: String },
    /// Revoke a single access token
    Revoke {
        token: String,
        #[arg(long)]
        owner: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let command = match cli.command {
        Commands::Admin(command) => command,
        Commands::HashPassword { password } => {
            let hash = hash_password(&password, default_params()).map_err(|e| e.to_string())?;
            println!("{}", hash);
            return Ok(());
        }
    };

    let key = cli
        .key
        .ok_or("admin key required: pass --key or set PIM_GATEWAY_ADMIN_KEY")?;
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", key))?,
    );

    let request = match command {
        AdminCommands::Status => client.get(format!("{}/admin/status", base)),
        AdminCommands::Invalidate { user_id } => {
            client.post(format!("{}/admin/users/{}/invalidate", base, user_id))
        }
        AdminCommands::Lockout { identifier } => {
            client.get(format!("{}/admin/lockouts/{}", base, identifier))
        }
        AdminCommands::Unlock { identifier } => {
            client.delete(format!("{}/admin/lockouts/{}", base, identifier))
        }
        AdminCommands::Revoke { token, owner } => client
            .post(format!("{}/admin/tokens/revoke", base))
            .json(&serde_json::json!({ "token": token, "owner_user_id": owner })),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    if status == reqwest::StatusCode::NO_CONTENT {
        println!("OK");
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
