//! User and subscription commands.
//!
//! Provides list, get, create, activate, and cancel operations.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum UserCommands {
    /// List all users
    List,

    /// Show one user with its subscription
    Get {
        /// User ID
        user_id: Uuid,
    },

    /// Create a user
    Create(CreateArgs),

    /// Activate (or renew) the user's subscription
    Activate {
        /// User ID
        user_id: Uuid,

        /// Queue the activation for a background worker instead of waiting
        #[arg(long)]
        queued: bool,
    },

    /// Cancel the user's active subscription
    Cancel {
        /// User ID
        user_id: Uuid,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Telegram user id
    #[arg(long)]
    telegram_id: i64,

    /// First name
    #[arg(long)]
    first_name: String,

    #[arg(long)]
    last_name: Option<String>,

    #[arg(long)]
    username: Option<String>,

    /// IETF language tag, e.g. `en`
    #[arg(long)]
    language_code: Option<String>,

    #[arg(long)]
    email: Option<String>,

    #[arg(long)]
    bot: bool,

    #[arg(long)]
    premium: bool,
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest {
    telegram_id: i64,
    first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    is_bot: bool,
    is_premium: bool,
}

impl From<CreateArgs> for CreateUserRequest {
    fn from(args: CreateArgs) -> Self {
        Self {
            telegram_id: args.telegram_id,
            first_name: args.first_name,
            last_name: args.last_name,
            username: args.username,
            language_code: args.language_code,
            email: args.email,
            is_bot: args.bot,
            is_premium: args.premium,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo {
    id: Uuid,
    telegram_id: i64,
    #[serde(default)]
    username: Option<String>,
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    language_code: Option<String>,
    is_bot: bool,
    is_premium: bool,
    #[serde(default)]
    email: Option<String>,
    created_at: DateTime<Utc>,
    subscription_status: String,
    #[serde(default)]
    subscription_provider: Option<String>,
    #[serde(default)]
    subscription_plan: Option<String>,
    #[serde(default)]
    subscription_activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    subscription_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize, Tabled)]
struct UserRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Telegram ID")]
    telegram_id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Subscription")]
    subscription: String,
    #[tabled(rename = "Expires")]
    expires: String,
}

impl From<UserInfo> for UserRow {
    fn from(u: UserInfo) -> Self {
        let name = match &u.last_name {
            Some(last) => format!("{} {}", u.first_name, last),
            None => u.first_name.clone(),
        };
        Self {
            id: u.id.to_string()[..8].to_string(),
            telegram_id: u.telegram_id,
            name,
            subscription: u.subscription_status,
            expires: output::timestamp(u.subscription_expires_at),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedJob {
    job_id: Uuid,
    queue: String,
}

fn print_user(user: &UserInfo) {
    output::print_header(&format!("User: {}", user.first_name));
    output::print_detail("ID", &user.id.to_string());
    output::print_detail("Telegram ID", &user.telegram_id.to_string());
    if let Some(username) = &user.username {
        output::print_detail("Username", username);
    }
    if let Some(email) = &user.email {
        output::print_detail("Email", email);
    }
    output::print_detail("Created", output::timestamp(Some(user.created_at)));
    output::print_detail("Subscription", output::subscription_status(&user.subscription_status));
    if let Some(plan) = &user.subscription_plan {
        output::print_detail("Plan", plan);
    }
    if let Some(provider) = &user.subscription_provider {
        output::print_detail("Provider", provider);
    }
    output::print_detail("Activated", output::timestamp(user.subscription_activated_at));
    output::print_detail("Expires", output::expiry(user.subscription_expires_at, Utc::now()));
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: UserCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        UserCommands::List => {
            let users: Vec<UserInfo> = client.get("/api/v1/users").await?;
            let rows: Vec<UserRow> = users.into_iter().map(UserRow::from).collect();
            output::print_list(&rows, format)?;
        }

        UserCommands::Get { user_id } => {
            let user: UserInfo = client.get(&format!("/api/v1/users/{}", user_id)).await?;
            match format {
                OutputFormat::Table => print_user(&user),
                _ => output::print_item(&user, format)?,
            }
        }

        UserCommands::Create(args) => {
            let request = CreateUserRequest::from(args);
            let user: UserInfo = client.post("/api/v1/users", Some(&request)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("User {} created", user.id)),
                _ => output::print_item(&user, format)?,
            }
        }

        UserCommands::Activate { user_id, queued: true } => {
            let job: AcceptedJob = client
                .post(
                    &format!("/api/v1/users/{}/subscription/activation-jobs", user_id),
                    None::<&()>,
                )
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Activation queued as job {} on {}", job.job_id, job.queue))
                }
                _ => output::print_item(&job, format)?,
            }
        }

        UserCommands::Activate { user_id, queued: false } => {
            let user: UserInfo = client
                .post(&format!("/api/v1/users/{}/subscription/activate", user_id), None::<&()>)
                .await?;
            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "Subscription active until {}",
                    output::expiry(user.subscription_expires_at, Utc::now())
                )),
                _ => output::print_item(&user, format)?,
            }
        }

        UserCommands::Cancel { user_id } => {
            let user: UserInfo = client
                .post(&format!("/api/v1/users/{}/subscription/cancel", user_id), None::<&()>)
                .await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Subscription for {} canceled", user.id)),
                _ => output::print_item(&user, format)?,
            }
        }
    }

    Ok(())
}
