//! # deta
//!
//! Terminal client for the Deta AI assistant, plus the small HTTP service
//! that hosts its helper functions.
//!
//! - **chat**: streaming conversations with per-day usage limits for guests,
//!   a timed premium model and cloud history for signed-in users
//! - **serve**: `generate-title` and `transcribe` over HTTP
//! - **discover** / **profile**: the community feed and account pages

mod app;
mod cli;
mod config;
mod functions;
mod models;
mod providers;
mod repl;
mod services;

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::cli::{Cli, Commands, DiscoverCommand, ProfileCommand};
use crate::config::FunctionsConfig;
use crate::functions::FunctionsState;
use crate::models::{PostDraft, ProfileUpdate};
use crate::services::discover::{PostWatcher, SeenPosts};
use crate::services::markdown;
use crate::services::profile::ProfileService;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.command.default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { addr } => serve(addr).await,
        Commands::Chat {
            ephemeral,
            conversation,
        } => {
            let app = App::load().await?;
            repl::run(&app, ephemeral, conversation).await
        }
        Commands::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => read_password().await?,
            };
            let mut app = App::load().await?;
            let session = app.login(&email, &password).await?;
            println!("Signed in as {}", session.email.as_deref().unwrap_or(&email));
            Ok(())
        }
        Commands::Logout => {
            let mut app = App::load().await?;
            app.logout().await?;
            println!("Signed out");
            Ok(())
        }
        Commands::Discover { command } => {
            let app = App::load().await?;
            discover(&app, command.unwrap_or(DiscoverCommand::List)).await
        }
        Commands::Profile { command } => {
            let app = App::load().await?;
            profile(&app, command.unwrap_or(ProfileCommand::Show)).await
        }
        Commands::Transcribe { path } => {
            let app = App::load().await?;
            println!("{}", app.transcribe(&path).await?);
            Ok(())
        }
    }
}

async fn serve(addr: Option<std::net::SocketAddr>) -> Result<()> {
    let mut config = FunctionsConfig::from_env();
    if let Some(addr) = addr {
        config.http_addr = addr;
    }
    info!("Starting Deta functions v{}", env!("CARGO_PKG_VERSION"));
    info!(
        title_gateway = config.gateway_api_key.is_some(),
        identity = config.supabase_url.is_some(),
        anonymous_limit = config.anonymous_transcription_limit,
        "Loaded configuration"
    );

    let addr = config.http_addr;
    let state = FunctionsState::from_config(config);

    tokio::select! {
        result = functions::serve(state, addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
    Ok(())
}

async fn read_password() -> Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("Password is required");
    }
    Ok(password)
}

async fn discover(app: &App, command: DiscoverCommand) -> Result<()> {
    let service = app.discover();
    match command {
        DiscoverCommand::List => {
            let feed = service.feed().await?;
            if feed.is_empty() {
                println!("No posts yet.");
            }
            for entry in feed {
                let author = entry
                    .author
                    .as_ref()
                    .map(|a| a.display_name().to_string())
                    .unwrap_or_else(|| "Unknown".to_string());
                let draft = if entry.post.published { "" } else { " [hidden]" };
                println!(
                    "{}  {}{}\n    by {} on {}\n    {}",
                    entry.post.id,
                    entry.post.title,
                    draft,
                    author,
                    entry.post.created_at.format("%Y-%m-%d"),
                    markdown::preview(&entry.post.content, 150)
                );
            }
        }
        DiscoverCommand::Show { id } => {
            let entry = service.post(&id).await?;
            println!("{}", entry.post.title);
            if let Some(author) = &entry.author {
                let badge = if author.verified { " (verified)" } else { "" };
                println!("by {}{}", author.display_name(), badge);
            }
            if let Some(url) = &entry.post.image_url {
                println!("[image] {url}");
            }
            println!("\n{}", markdown::to_plain_text(&entry.post.content));
            if app.identity().is_authenticated() {
                SeenPosts::new(app.local_store(false)?).mark(&entry.post.id).await;
            }
        }
        DiscoverCommand::Watch { interval } => {
            app.require_session()?;
            let seen = SeenPosts::new(app.local_store(false)?);
            let mut watcher = PostWatcher::new(service, seen, Utc::now());
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            println!("Watching for new posts. Ctrl-C to stop.");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match watcher.poll().await {
                            Ok(notices) => {
                                for notice in notices {
                                    println!("New post: {}\n    {}", notice.title, notice.preview);
                                    watcher.acknowledge(&notice).await;
                                }
                            }
                            Err(e) => tracing::warn!("Discover poll failed: {}", e),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        DiscoverCommand::Create {
            title,
            content,
            image_url,
        } => {
            let post = service
                .create_post(&PostDraft {
                    title,
                    content,
                    image_url,
                })
                .await?;
            println!("Published {}", post.id);
        }
        DiscoverCommand::Edit {
            id,
            title,
            content,
            image_url,
        } => {
            service
                .update_post(
                    &id,
                    &PostDraft {
                        title,
                        content,
                        image_url,
                    },
                )
                .await?;
            println!("Updated {id}");
        }
        DiscoverCommand::Delete { id } => {
            service.delete_post(&id).await?;
            println!("Deleted {id}");
        }
        DiscoverCommand::Toggle { id } => {
            let published = service.toggle_published(&id).await?;
            println!("{id} is now {}", if published { "published" } else { "hidden" });
        }
    }
    Ok(())
}

async fn profile(app: &App, command: ProfileCommand) -> Result<()> {
    let session = app.require_session()?.clone();
    let service = ProfileService::new(&app.client(), session);
    match command {
        ProfileCommand::Show => {
            let profile = service.load_or_create().await?;
            println!("{}", profile.display_name());
            if let Some(handle) = &profile.handle {
                println!("@{handle}");
            }
            if profile.verified {
                println!("Verified");
            }
            if let Some(bio) = &profile.bio {
                println!("\n{bio}");
            }
        }
        ProfileCommand::Update { name, handle, bio } => {
            let saved = service
                .update(&ProfileUpdate {
                    full_name: name,
                    handle,
                    bio,
                })
                .await?;
            println!("Profile updated: {}", saved.full_name);
        }
        ProfileCommand::Avatar { path } => {
            service.set_avatar(&path).await?;
            println!("Avatar updated");
        }
        ProfileCommand::Stats => {
            let stats = service.usage_stats().await?;
            println!(
                "Conversations: {}\nMessages: {}\nImages: {}",
                stats.conversations, stats.messages, stats.images
            );
        }
    }
    Ok(())
}
