//! Command-line interface for Deta.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Deta AI assistant: terminal chat client and helper functions server.
#[derive(Parser, Debug, Clone)]
#[command(name = "deta")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the title and transcription functions over HTTP
    Serve {
        /// Listen address, overriding HTTP_ADDR
        #[arg(long)]
        addr: Option<SocketAddr>,
    },

    /// Start an interactive chat
    Chat {
        /// Keep usage counters in memory instead of the data directory
        #[arg(long)]
        ephemeral: bool,

        /// Open an existing conversation (signed-in users only)
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Sign in with e-mail and password
    Login {
        #[arg(short, long, env = "DETA_EMAIL")]
        email: String,

        /// Read from standard input when omitted
        #[arg(long, env = "DETA_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Forget the stored session
    Logout,

    /// Browse and manage Discover posts
    Discover {
        #[command(subcommand)]
        command: Option<DiscoverCommand>,
    },

    /// Show or edit your profile
    Profile {
        #[command(subcommand)]
        command: Option<ProfileCommand>,
    },

    /// Transcribe an audio recording to text
    Transcribe {
        /// Audio file (webm, ogg, mp3, wav, m4a)
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum DiscoverCommand {
    /// List posts, newest first
    List,

    /// Show one post in full
    Show { id: String },

    /// Poll for newly published posts and print a notice for each
    Watch {
        /// Seconds between polls
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },

    /// Publish a new post (admins only)
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        image_url: Option<String>,
    },

    /// Replace a post's title, content and image (admins only)
    Edit {
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        image_url: Option<String>,
    },

    /// Delete a post (admins only)
    Delete { id: String },

    /// Publish or hide a post (admins only)
    Toggle { id: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProfileCommand {
    Show,

    /// Update name, handle and bio
    Update {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        handle: String,
        #[arg(long, default_value = "")]
        bio: String,
    },

    /// Upload an image file as your avatar
    Avatar { path: PathBuf },

    /// Conversation, message and image counts
    Stats,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Commands {
    /// Interactive commands keep the terminal quiet unless RUST_LOG says
    /// otherwise.
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Commands::Serve { .. } => "info,deta=debug",
            _ => "warn",
        }
    }
}
