use std::path::PathBuf;

use clap::Parser;

/// Repeating a URL flag past this many times is a usage error, not a
/// silent truncation.
pub const MAX_NEW_TAB_URLS: usize = 16;
const MAX_NEW_TAB_URL_LEN: usize = 2048;

/// Process exits with this code on any CLI usage error (unknown flag,
/// missing required value, or a value that fails validation below).
/// `clap`'s own parse failures already exit with this code by default,
/// so validation here only needs to match it, not set it up.
pub const EXIT_CLI: i32 = 2;
pub const EXIT_INTERNAL_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "castcore-client", version, about = "Low-latency remote desktop client")]
pub struct Cli {
    /// Host or IP address of the server to connect to.
    #[arg(long)]
    pub server_ip: String,

    /// Display name this session presents to the server.
    #[arg(long)]
    pub user: String,

    /// Hex-encoded 16-byte pre-shared session key.
    #[arg(long)]
    pub key: String,

    /// URL to open in a new browser tab once connected. Repeatable, up
    /// to `MAX_NEW_TAB_URLS` times.
    #[arg(long = "new-tab-url")]
    pub new_tab_url: Vec<String>,

    /// Optional override for the session name shown server-side;
    /// defaults to `user` when absent.
    #[arg(long)]
    pub name: Option<String>,

    /// Path to an optional TOML connection config; CLI flags win over
    /// anything it sets.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Validates the repeatable/bounded fields `clap` itself can't
    /// express (max count, max length). Returns a human-readable
    /// message for the caller to print to stderr before exiting
    /// `EXIT_CLI`.
    pub fn validate(&self) -> Result<(), String> {
        if self.new_tab_url.len() > MAX_NEW_TAB_URLS {
            return Err(format!(
                "too many --new-tab-url flags: got {}, max {MAX_NEW_TAB_URLS}",
                self.new_tab_url.len()
            ));
        }
        for url in &self.new_tab_url {
            if url.len() > MAX_NEW_TAB_URL_LEN {
                return Err(format!(
                    "--new-tab-url value exceeds {MAX_NEW_TAB_URL_LEN} characters"
                ));
            }
        }
        Ok(())
    }

    pub fn session_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.user)
    }
}
