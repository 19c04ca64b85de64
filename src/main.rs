use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use wordgate::quota::UserStore;

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    /// Run the HTTP service.
    Server,

    /// Mint a bearer token for the given user.
    Jwt { uid: String, ttl: f64 },

    /// Manage user usage records.
    User {
        #[clap(subcommand)]
        cmd: UserCmd,
    },
}

#[derive(clap::Subcommand, Debug)]
enum UserCmd {
    /// Register a user with zero usage.
    Add { uid: String },

    /// Print a user's usage for the current UTC day.
    Show { uid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    wordgate::tracing::init()?;
    tracing::debug!(?cli, "Starting.");
    let conf = wordgate::conf::global();
    match &cli.cmd {
        Cmd::Server => wordgate::server::run().await,
        Cmd::Jwt { uid, ttl } => {
            let claims = wordgate::auth::Claims::new(
                uid,
                Duration::from_secs_f64(*ttl),
                &conf.jwt,
            )?;
            let encoded: String = claims.to_str(&conf.jwt)?;
            println!("{encoded}");
            Ok(())
        }
        Cmd::User { cmd } => {
            let storage = wordgate::data::Storage::connect(
                wordgate::server::DB_FILE,
                Duration::from_secs_f32(conf.sqlite_busy_timeout),
            )
            .await?;
            match cmd {
                UserCmd::Add { uid } => {
                    if storage.user_add(uid).await? {
                        tracing::info!(?uid, "User added.");
                    } else {
                        tracing::warn!(?uid, "User already exists.");
                    }
                    Ok(())
                }
                UserCmd::Show { uid } => {
                    let record = storage
                        .find_by_identity(uid)
                        .await?
                        .with_context(|| format!("User not found: {uid:?}"))?;
                    let gate = wordgate::quota::Gate::from_conf(&conf);
                    let stats = gate.usage(&record, chrono::Utc::now());
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                    Ok(())
                }
            }
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

fn human_panic_setup() {
    macro_rules! repo {
        () => {
            env!("CARGO_PKG_REPOSITORY")
        };
    }
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .homepage(repo!())
    .support(concat!("- Submit an issue at ", repo!(), "/issues")));
}
