use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use kiosk::config::Config;
use kiosk::feed::{self, Article, Fetcher, OpmlFeed};
use kiosk::registry::{Completion, CompletionOutcome, EditOutcome, Registry};
use kiosk::storage::{Database, DatabaseError, Feed};
use kiosk::util::{strip_control_chars, truncate_to_width, validate_url_for_open};

/// Column budget for feed names and article titles in listings.
const NAME_WIDTH: usize = 40;
const TITLE_WIDTH: usize = 70;

/// Get the config directory path (~/.config/kiosk/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("kiosk"))
}

#[derive(Parser, Debug)]
#[command(name = "kiosk", version, about = "RSS/RDF feed subscriptions from the command line")]
struct Args {
    /// Config file (default: ~/.config/kiosk/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List subscribed feeds
    List,
    /// Subscribe to a feed and fetch it once
    Add { name: String, url: String },
    /// Rename a feed or change its url
    Edit {
        /// Feed id or 1-based position
        feed: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Unsubscribe from a feed
    Remove {
        /// Feed id or 1-based position
        feed: String,
    },
    /// Move feeds (1-based positions) in front of position TO; one past the end appends
    Move {
        to: usize,
        #[arg(required = true)]
        from: Vec<usize>,
    },
    /// Fetch a feed and print its articles
    Show {
        /// Feed id or 1-based position
        feed: String,
        /// Only articles whose title, description or category contains this text
        #[arg(long)]
        search: Option<String>,
        /// Print articles as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fetch every feed and report failures
    Refresh,
    /// Open an article's link in the browser
    Open {
        /// Feed id or 1-based position
        feed: String,
        /// 1-based article number as printed by `show`
        article: usize,
    },
    /// Subscribe to every feed in an OPML file
    Import { file: PathBuf },
    /// Write subscriptions to an OPML file
    Export { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        eprintln!("Created config directory: {}", config_dir.display());
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config_dir.join("kiosk.db");
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        eprintln!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of kiosk appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let fetcher = Fetcher::new(&config).context("Failed to build HTTP client")?;
    let mut registry = Registry::load(db, fetcher)
        .await
        .context("Failed to load subscriptions")?;

    run(&mut registry, args.command).await
}

async fn run(registry: &mut Registry, command: Command) -> Result<()> {
    match command {
        Command::List => {
            if registry.feeds().is_empty() {
                println!("No subscriptions. Add one with: kiosk add <name> <url>");
            }
            for (i, feed) in registry.feeds().iter().enumerate() {
                println!(
                    "{:>3}. {:<width$}  {}  [{}]",
                    i + 1,
                    terminal_safe(&feed.name, NAME_WIDTH),
                    strip_control_chars(&feed.url),
                    feed.id,
                    width = NAME_WIDTH
                );
            }
        }

        Command::Add { name, url } => {
            let feed = Feed::new(name, url);
            let id = feed.id;
            registry.add(feed).await?;
            println!("Subscribed [{}]", id);
            report_completions(&registry.wait_idle().await);
        }

        Command::Edit { feed, name, url } => {
            let id = resolve_feed(registry, &feed)?;
            let Some(current) = registry.feed(id).cloned() else {
                anyhow::bail!("No feed {}", feed);
            };
            let updated = Feed {
                name: name.unwrap_or(current.name),
                url: url.unwrap_or(current.url),
                ..current
            };
            match registry.edit(updated).await? {
                EditOutcome::NotFound => anyhow::bail!("No feed {}", feed),
                EditOutcome::Renamed => println!("Saved."),
                EditOutcome::UrlChanged(_) => {
                    println!("Saved; fetching new url.");
                    report_completions(&registry.wait_idle().await);
                }
            }
        }

        Command::Remove { feed } => {
            let id = resolve_feed(registry, &feed)?;
            if registry.delete(id).await? {
                println!("Unsubscribed [{}]", id);
            }
        }

        Command::Move { to, from } => {
            let to = to
                .checked_sub(1)
                .context("Positions start at 1")?;
            let from = from
                .into_iter()
                .map(|p| p.checked_sub(1).context("Positions start at 1"))
                .collect::<Result<Vec<_>>>()?;
            registry.move_feeds(&from, to).await?;
            for (i, feed) in registry.feeds().iter().enumerate() {
                println!("{:>3}. {}", i + 1, terminal_safe(&feed.name, NAME_WIDTH));
            }
        }

        Command::Show { feed, search, json } => {
            let id = resolve_feed(registry, &feed)?;
            registry.refresh(id).await?;
            let articles = registry.search(id, search.as_deref().unwrap_or(""))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&articles)?);
            } else {
                print_articles(&articles);
            }
        }

        Command::Refresh => {
            let report = registry.refresh_all().await;
            println!(
                "Refreshed {} of {} feeds.",
                report.succeeded,
                report.succeeded + report.failed.len()
            );
            for (id, error) in &report.failed {
                let name = registry.feed(*id).map(|f| f.name.as_str()).unwrap_or("?");
                eprintln!("  {}: {}", terminal_safe(name, NAME_WIDTH), error);
            }
        }

        Command::Open { feed, article } => {
            let id = resolve_feed(registry, &feed)?;
            registry.refresh(id).await?;
            let articles = registry.articles(id).unwrap_or_default();
            let picked = article
                .checked_sub(1)
                .and_then(|i| articles.get(i))
                .with_context(|| format!("No article {} (feed has {})", article, articles.len()))?;
            let url = validate_url_for_open(&picked.link)
                .with_context(|| format!("Refusing to open {:?}", picked.link))?;
            open::that(url.as_str()).context("Failed to launch browser")?;
        }

        Command::Import { file } => {
            let entries = feed::parse_opml(&file)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            let added = registry.import(&entries).await?;
            println!(
                "Imported {} new feeds ({} already subscribed).",
                added,
                entries.len() - added
            );
            report_completions(&registry.wait_idle().await);
        }

        Command::Export { file } => {
            let entries: Vec<OpmlFeed> = registry
                .feeds()
                .iter()
                .map(|f| OpmlFeed {
                    title: f.name.clone(),
                    xml_url: f.url.clone(),
                })
                .collect();
            feed::export_to_file(&entries, &file)
                .with_context(|| format!("Failed to export to {}", file.display()))?;
            println!("Exported {} feeds to {}", entries.len(), file.display());
        }
    }
    Ok(())
}

/// Accepts a feed id or a 1-based list position.
fn resolve_feed(registry: &Registry, reference: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(reference) {
        if registry.feed(id).is_some() {
            return Ok(id);
        }
        anyhow::bail!("No feed with id {}", id);
    }
    let position: usize = reference
        .parse()
        .with_context(|| format!("{:?} is neither a feed id nor a position", reference))?;
    position
        .checked_sub(1)
        .and_then(|i| registry.feeds().get(i))
        .map(|f| f.id)
        .with_context(|| format!("No feed at position {}", position))
}

fn terminal_safe(s: &str, width: usize) -> String {
    truncate_to_width(&strip_control_chars(s), width).into_owned()
}

fn print_articles(articles: &[Article]) {
    if articles.is_empty() {
        println!("No articles.");
    }
    for (i, article) in articles.iter().enumerate() {
        println!("{:>3}. {}", i + 1, terminal_safe(&article.title, TITLE_WIDTH));
        let mut meta = Vec::new();
        if !article.pub_date.is_empty() {
            meta.push(strip_control_chars(&article.pub_date).into_owned());
        }
        if !article.creator.is_empty() {
            meta.push(strip_control_chars(&article.creator).into_owned());
        }
        if let Some(categories) = &article.categories {
            let joined: Vec<&str> = categories.iter().map(|c| &**c).collect();
            meta.push(strip_control_chars(&joined.join(", ")).into_owned());
        }
        if !meta.is_empty() {
            println!("     {}", meta.join(" | "));
        }
    }
}

fn report_completions(completions: &[Completion]) {
    for completion in completions {
        match &completion.outcome {
            CompletionOutcome::Replaced { count } => println!("Fetched {} articles.", count),
            CompletionOutcome::Failed(e) => eprintln!("Warning: fetch failed: {}", e),
            CompletionOutcome::Panicked(msg) => eprintln!("Warning: fetch crashed: {}", msg),
        }
    }
}
