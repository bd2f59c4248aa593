//! cloud_drive CLI - Interact with an Amazon Cloud Drive account.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glob::glob;
use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cloud_drive::models::format_size;
use cloud_drive::{Authenticator, ByteRange, ClientConfig, CloudDrive, Credentials};

/// CLI tool for interacting with Amazon Cloud Drive.
#[derive(Parser)]
#[command(name = "cloud_drive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the OAuth credentials JSON file. Refreshed tokens are written back to it.
    /// Without it, credentials are read from CLOUDDRIVE_* environment variables.
    #[arg(long, env = "CLOUDDRIVE_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Maximum attempts for requests that hit the rate limit.
    #[arg(long, env = "CLOUDDRIVE_MAX_RETRIES", default_value_t = cloud_drive::config::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Enable debug logging.
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the root folder.
    Root,

    /// List the children of a folder.
    Ls {
        /// Folder ID (defaults to the root folder).
        folder: Option<String>,
    },

    /// Create a folder.
    Mkdir {
        name: String,

        /// Parent folder ID (defaults to the root folder).
        #[arg(long, short = 'p')]
        parent: Option<String>,
    },

    /// Upload files to a folder.
    Upload {
        /// File patterns to upload (supports glob patterns like *.tar, file_{1,2,3}.txt).
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Destination folder ID (defaults to the root folder).
        #[arg(long, short = 't')]
        to: Option<String>,
    },

    /// Download a file to local filesystem.
    Download {
        /// Node ID to download.
        node: String,

        /// Local destination path (file or directory).
        #[arg(long, short = 't', default_value = ".")]
        to: PathBuf,

        /// Inclusive byte range, e.g. 0-1023.
        #[arg(long, value_parser = parse_range)]
        range: Option<ByteRange>,

        /// Download through the node's temporary link.
        #[arg(long)]
        temp_link: bool,
    },

    /// Move a node to the trash.
    Rm { node: String },

    /// Move a node to another folder.
    Mv {
        node: String,

        /// Current parent folder ID.
        #[arg(long)]
        from: String,

        /// Destination folder ID.
        #[arg(long)]
        to: String,
    },

    /// Rename a node.
    Rename { node: String, name: String },

    /// Show the account quota.
    Quota,

    /// Poll the change feed.
    Changes {
        /// Checkpoint returned by a previous poll.
        #[arg(long, default_value = "")]
        checkpoint: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let auth = load_authenticator(cli.credentials.as_ref())?;
    let config = ClientConfig::default().with_max_retries(cli.max_retries);

    let client = CloudDrive::connect(reqwest::Client::new(), auth, config)
        .await
        .context("Failed to discover account endpoints")?;

    match cli.command {
        Commands::Root => {
            let root = client.lookup_root().await.context("Failed to look up root")?;
            println!("{}", root);
        }

        Commands::Ls { folder } => {
            let folder_id = folder_or_root(&client, folder).await?;
            let nodes = client
                .node_children(&folder_id)
                .await
                .with_context(|| format!("Failed to list folder: {}", folder_id))?;

            if nodes.is_empty() {
                println!("No files found.");
            } else {
                println!("ID\tSIZE\tKIND\tNAME");
                for node in nodes {
                    println!("{}", node);
                }
            }
        }

        Commands::Mkdir { name, parent } => {
            let parent_id = folder_or_root(&client, parent).await?;
            let node = client
                .create_folder(&parent_id, &name)
                .await
                .with_context(|| format!("Failed to create folder: {}", name))?;
            println!("{}", node);
        }

        Commands::Upload { patterns, to } => {
            let folder_id = folder_or_root(&client, to).await?;

            let files_to_upload = collect_upload_files(&patterns)?;
            if files_to_upload.is_empty() {
                anyhow::bail!("No files to upload");
            }

            println!("Uploading {} file(s) to {}...", files_to_upload.len(), folder_id);

            for (idx, file_path) in files_to_upload.iter().enumerate() {
                let filename = file_path.file_name().unwrap_or_default().to_string_lossy();
                print!("[{}/{}] Uploading {}... ", idx + 1, files_to_upload.len(), filename);

                match client.upload_file(file_path, &folder_id).await {
                    Ok(node) => {
                        println!("OK ({})", node.id);
                    }
                    Err(e) => {
                        println!("FAILED");
                        eprintln!("  Error: {}", e);
                    }
                }
            }

            println!("Done.");
        }

        Commands::Download {
            node,
            to,
            range,
            temp_link,
        } => {
            let final_path = if to.is_dir() {
                let metadata = client
                    .lookup_node_by_id(&node)
                    .await
                    .with_context(|| format!("Failed to look up node: {}", node))?;
                to.join(&metadata.name)
            } else {
                if let Some(parent) = to.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
                    }
                }
                to
            };

            print!("Downloading {}... ", node);

            let download = if temp_link {
                client.download_node_by_temp_link(&node, range).await
            } else {
                client.download_node(&node, range).await
            }
            .with_context(|| format!("Failed to download node: {}", node))?;

            let written = download
                .save_to(&final_path)
                .await
                .with_context(|| format!("Failed to write {:?}", final_path))?;

            println!("OK ({})", format_size(written));
            println!("Saved to: {:?}", final_path);
        }

        Commands::Rm { node } => {
            client
                .delete_node(&node)
                .await
                .with_context(|| format!("Failed to trash node: {}", node))?;
            println!("Trashed {}", node);
        }

        Commands::Mv { node, from, to } => {
            let moved = client
                .move_node(&node, &from, &to)
                .await
                .with_context(|| format!("Failed to move node: {}", node))?;
            println!("{}", moved);
        }

        Commands::Rename { node, name } => {
            let renamed = client
                .rename_node(&node, &name)
                .await
                .with_context(|| format!("Failed to rename node: {}", node))?;
            println!("{}", renamed);
        }

        Commands::Quota => {
            let quota = client.quota().await.context("Failed to get quota")?;
            println!("Quota:     {}", format_size(quota.quota));
            println!("Available: {}", format_size(quota.available));
            if let Some(at) = quota.last_calculated {
                println!("Calculated at: {}", at);
            }
        }

        Commands::Changes { checkpoint } => {
            let changes = client
                .changes(&checkpoint)
                .await
                .context("Failed to poll changes")?;
            if changes.reset {
                println!("Feed was reset; full listing follows.");
            }
            for node in &changes.nodes {
                println!("{}", node);
            }
            println!("Checkpoint: {}", changes.checkpoint);
        }
    }

    Ok(())
}

/// Build the authenticator, persisting refreshed tokens when a credentials file is used.
fn load_authenticator(path: Option<&PathBuf>) -> Result<Authenticator> {
    let Some(path) = path else {
        let credentials =
            Credentials::from_env().context("Failed to load credentials from environment")?;
        return Ok(Authenticator::new(credentials));
    };

    let persist_path = path.clone();
    let auth = Authenticator::from_file(path)
        .with_context(|| format!("Failed to load credentials from {:?}", path))?
        .on_refresh(move |credentials| {
            let _ = persist_credentials(persist_path.clone(), credentials.clone());
        });
    Ok(auth)
}

/// Write refreshed credentials off the async workers.
fn persist_credentials(path: PathBuf, credentials: Credentials) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = save_credentials(&path, &credentials) {
            warn!(path = ?path, error = %e, "Failed to persist refreshed credentials");
        }
    })
}

fn save_credentials(path: &Path, credentials: &Credentials) -> Result<()> {
    let json = serde_json::to_string_pretty(credentials)?;
    std::fs::write(path, json)?;
    Ok(())
}

async fn folder_or_root(client: &CloudDrive, folder: Option<String>) -> Result<String> {
    match folder {
        Some(id) => Ok(id),
        None => Ok(client
            .lookup_root()
            .await
            .context("Failed to look up root")?
            .id),
    }
}

/// Parse an inclusive `start-end` byte range.
fn parse_range(value: &str) -> std::result::Result<ByteRange, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {:?}", value))?;
    let start: u64 = start.trim().parse().map_err(|e| format!("bad start: {}", e))?;
    let end: u64 = end.trim().parse().map_err(|e| format!("bad end: {}", e))?;
    if end < start {
        return Err(format!("range end {} is before start {}", end, start));
    }
    Ok(ByteRange::new(start, end))
}

/// Resolve upload arguments to a sorted, deduplicated list of local files.
///
/// Each argument is brace-expanded, then globbed. An argument that matches
/// nothing is kept if it names an existing file.
fn collect_upload_files(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();

    for pattern in patterns.iter().flat_map(|p| expand_braces(p)) {
        let before = files.len();
        for entry in glob(&pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))? {
            match entry {
                Ok(path) if path.is_file() => {
                    files.insert(path);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable path"),
            }
        }

        if files.len() == before {
            let literal = PathBuf::from(&pattern);
            if literal.is_file() {
                files.insert(literal);
            } else {
                eprintln!("Warning: No files matched pattern: {}", pattern);
            }
        }
    }

    Ok(files.into_iter().collect())
}

/// Expand `{a,b}` alternatives, e.g. `file_{1,2}.txt` to `file_1.txt` and `file_2.txt`.
fn expand_braces(pattern: &str) -> Vec<String> {
    let group = pattern
        .find('{')
        .and_then(|open| pattern[open..].find('}').map(|len| (open, open + len)));

    let Some((open, close)) = group else {
        return vec![pattern.to_string()];
    };

    let (head, tail) = (&pattern[..open], &pattern[close + 1..]);
    let mut expanded = Vec::new();
    for choice in pattern[open + 1..close].split(',') {
        expanded.extend(expand_braces(&format!("{}{}{}", head, choice.trim(), tail)));
    }
    expanded
}
