use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use escrow_desk::{
    config::{create_default_config_file, AppConfig},
    logging, Actor, Database, DealRegistry, DealType, FeeSchedule, LoyaltyTier, Role,
    SystemClock, TokenIssuer, TracingNotifier,
};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "escrowctl")]
#[command(about = "Operator tool for the escrow deal engine")]
struct Cli {
    #[arg(short, long, default_value = "escrow.toml", env = "ESCROW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file with every default spelled out
    InitConfig {
        #[arg(long)]
        force: bool,
    },
    /// Issue an API token for a user
    IssueToken {
        user_id: i64,
        #[arg(long, default_value = "user")]
        role: Role,
    },
    /// Quote a fee without touching the database
    QuoteFee {
        #[arg(long)]
        deal_type: DealType,
        #[arg(long, default_value = "0")]
        price: Decimal,
        #[arg(long)]
        addon: Option<Decimal>,
        #[arg(long, default_value_t = 0)]
        trust: i32,
        #[arg(long, default_value_t = 0)]
        tier: u8,
        #[arg(long)]
        vip: bool,
    },
    /// Add a chat room to the pool
    RegisterRoom {
        handle: String,
        #[arg(long)]
        title: Option<String>,
        /// Operator recorded as the room's creator
        #[arg(long = "as", default_value_t = 0)]
        operator: i64,
    },
    /// List rooms in the pool
    ListRooms {
        #[arg(long)]
        free: bool,
    },
    /// Create or update a user
    UpsertUser {
        user_id: i64,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        role: Option<Role>,
    },
    /// Put a guarantor on or off shift
    Shift {
        user_id: i64,
        #[arg(long)]
        off: bool,
    },
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        AppConfig::load(path)?
    } else {
        AppConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::InitConfig { force } = &cli.command {
        if cli.config.exists() && !force {
            bail!("{} already exists, pass --force to overwrite", cli.config.display());
        }
        create_default_config_file(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    logging::init(&config.logging);

    match cli.command {
        Command::InitConfig { .. } => {}
        Command::IssueToken { user_id, role } => {
            let secret = config
                .get_jwt_secret()
                .context("auth.jwt_secret or JWT_SECRET must be set")?;
            let issuer = TokenIssuer::new(secret, config.auth.token_ttl_hours)?;
            println!("{}", issuer.issue(Actor::new(user_id, role))?);
        }
        Command::QuoteFee {
            deal_type,
            price,
            addon,
            trust,
            tier,
            vip,
        } => {
            let tier = LoyaltyTier::from_level(tier)?;
            let quote = FeeSchedule::default().quote(price, deal_type, addon, trust, tier, vip);
            println!("{}", serde_json::to_string_pretty(&quote)?);
        }
        Command::RegisterRoom {
            handle,
            title,
            operator,
        } => {
            let registry = registry(&config).await?;
            let room = registry
                .register_room(&Actor::new(operator, Role::Owner), &handle, title.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&room)?);
        }
        Command::ListRooms { free } => {
            let registry = registry(&config).await?;
            let listed = if free {
                registry.rooms().list_free().await?
            } else {
                registry.rooms().list_all().await?
            };
            println!("{}", serde_json::to_string_pretty(&listed)?);
        }
        Command::UpsertUser {
            user_id,
            username,
            role,
        } => {
            let db = Database::new(&config.database).await?;
            db.upsert_user(user_id, username.as_deref(), chrono::Utc::now())
                .await?;
            if let Some(role) = role {
                db.set_role(user_id, role).await?;
            }
            let user = db.require_user(user_id).await?;
            info!("User {} saved with role {}", user.id, user.role.as_str());
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::Shift { user_id, off } => {
            let db = Database::new(&config.database).await?;
            db.set_on_shift(user_id, !off).await?;
            println!(
                "User {} is now {}",
                user_id,
                if off { "off shift" } else { "on shift" }
            );
        }
    }

    Ok(())
}

async fn registry(config: &AppConfig) -> anyhow::Result<DealRegistry> {
    let db = Database::new(&config.database).await?;
    Ok(DealRegistry::new(
        db,
        config,
        Arc::new(TracingNotifier),
        Arc::new(SystemClock),
    ))
}
