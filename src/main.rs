use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use feedmailer::app::{AddSubscription, App, AppError, DeliveryOutcome};
use feedmailer::config::Config;
use feedmailer::feed::HttpFeedSource;
use feedmailer::mail::{MailError, SmtpMailer};
use feedmailer::storage::{Database, DatabaseError};
use feedmailer::util::single_line;

/// Overrides the application directory (config and database).
const APP_DIR_ENV: &str = "FEEDMAILER_APP_DIR";

/// Get the application directory (`$FEEDMAILER_APP_DIR` or ~/.config/feedmailer/)
fn get_app_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(APP_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedmailer"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedmailer",
    version,
    about = "Deliver RSS/Atom feed articles by email"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe an email address to a feed
    Add {
        /// Feed location (http or https)
        url: String,

        /// Title to use instead of the feed's own
        #[arg(long)]
        title: Option<String>,

        /// Recipient (defaults to `email` in config.toml)
        #[arg(long)]
        email: Option<String>,

        /// Deliver new articles as a single digest mail
        #[arg(long)]
        digest: bool,

        /// Maximum description length in delivered mail
        #[arg(long, value_name = "N")]
        desc_length: Option<u32>,
    },

    /// List subscriptions
    List,

    /// List subscribed feeds
    ListFeeds,

    /// Remove a subscription
    Remove { subscription_id: i64 },

    /// Fetch latest articles and store them for mailing
    Refresh {
        /// Only refresh this feed
        feed_id: Option<i64>,
    },

    /// Email articles newer than each subscription's last delivery
    Deliver {
        #[arg(required = true)]
        subscription_ids: Vec<i64>,

        /// Print what would be delivered without sending or recording anything
        #[arg(long)]
        pretend: bool,
    },
}

/// Log to stderr and append to `<app dir>/feedmailer.log`.
///
/// An unopenable log file leaves stderr logging in place.
fn init_tracing(log_path: &Path) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedmailer=info"));

    let (file_layer, open_error) = match OpenOptions::new().create(true).append(true).open(log_path)
    {
        Ok(file) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = open_error {
        tracing::warn!(path = %log_path.display(), error = %e, "Failed to open log file");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let app_dir = get_app_dir()?;
    let created = !app_dir.exists();
    if created {
        std::fs::create_dir_all(&app_dir).with_context(|| {
            format!("Failed to create application directory '{}'", app_dir.display())
        })?;
    }

    init_tracing(&app_dir.join("feedmailer.log"));
    if created {
        tracing::debug!(path = %app_dir.display(), "Created application directory");
    }

    // Config may hold an SMTP password: user-only access
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&app_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&app_dir, perms) {
                    tracing::warn!(
                        path = %app_dir.display(),
                        error = %e,
                        "Failed to set application directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %app_dir.display(),
                    error = %e,
                    "Failed to read application directory metadata"
                );
            }
        }
    }

    let config_path = app_dir.join("config.toml");
    if Config::write_default(&config_path).context("Failed to write default config")? {
        eprintln!(
            "A default config was created at '{}'. SMTP settings will need to be set before delivering can work.",
            config_path.display()
        );
    }
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    let db_path = app_dir.join("feedmailer.db");
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Busy) => {
            anyhow::bail!("Another feedmailer process is writing to the database. Try again shortly.")
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let source = HttpFeedSource::new().context("Failed to create HTTP client")?;

    let mailer = match &args.command {
        Command::Deliver { pretend: false, .. } => {
            match SmtpMailer::new(&config.smtp, &config.sender_name) {
                Ok(mailer) => Some(mailer),
                Err(MailError::NotConfigured) => None,
                Err(e) => return Err(e).context("Invalid SMTP configuration"),
            }
        }
        _ => None,
    };

    let app = App::new(db, source, mailer, config.content_type);

    match args.command {
        Command::Add {
            url,
            title,
            email,
            digest,
            desc_length,
        } => {
            let req = AddSubscription {
                url,
                title,
                email: email.or_else(|| config.email.clone()),
                digest: digest || config.digest,
                desc_length: desc_length.unwrap_or(config.desc_length),
            };
            match app.add_subscription(req).await {
                Ok(sub) => println!(
                    "{}. \"{}\" -> {}",
                    sub.subscription_id,
                    single_line(&sub.title),
                    sub.email
                ),
                Err(e) => report(&e),
            }
        }

        Command::List => match app.list_subscriptions().await {
            Ok(subs) if subs.is_empty() => println!("No subscriptions added yet"),
            Ok(subs) => {
                for s in subs {
                    let mode = if s.digest { " (digest)" } else { "" };
                    println!(
                        "{}. \"{}\" -> {}{}",
                        s.subscription_id,
                        single_line(&s.title),
                        s.email,
                        mode
                    );
                }
            }
            Err(e) => report(&e),
        },

        Command::ListFeeds => match app.list_feeds().await {
            Ok(feeds) if feeds.is_empty() => println!(
                "No feeds added yet. Feeds are automatically created through subscriptions."
            ),
            Ok(feeds) => {
                for f in feeds {
                    println!("{}. \"{}\" - {}", f.feed_id, single_line(&f.title), f.url);
                }
            }
            Err(e) => report(&e),
        },

        Command::Remove { subscription_id } => match app.remove_subscription(subscription_id).await
        {
            Ok(()) => println!("Removed subscription {}", subscription_id),
            Err(e) => report(&e),
        },

        Command::Refresh {
            feed_id: Some(feed_id),
        } => match app.refresh_feed(feed_id).await {
            Ok(0) => println!("No new articles found for feed {}", feed_id),
            Ok(n) => println!("Found {} new article(s) for feed {}", n, feed_id),
            Err(e) => report(&e),
        },

        Command::Refresh { feed_id: None } => match app.refresh_all().await {
            Ok(summary) => {
                for outcome in &summary.outcomes {
                    let title = single_line(&outcome.feed.title);
                    match &outcome.result {
                        Ok(n) => println!("{}. \"{}\": {} new", outcome.feed.feed_id, title, n),
                        Err(e) => {
                            println!("{}. \"{}\": failed: {}", outcome.feed.feed_id, title, e)
                        }
                    }
                }
                println!("{} new articles found in total", summary.total_new());
            }
            Err(e) => report(&e),
        },

        Command::Deliver {
            subscription_ids,
            pretend,
        } => {
            let results = app
                .deliver(&subscription_ids, pretend)
                .await
                .context("Delivery not attempted")?;

            for delivery in results {
                let id = delivery.subscription_id;
                match delivery.outcome {
                    DeliveryOutcome::NotFound => {
                        eprintln!("Error: No subscription exists with id {}", id)
                    }
                    DeliveryOutcome::NothingToDeliver => {
                        println!("No articles to deliver for subscription {}", id)
                    }
                    DeliveryOutcome::Pretended {
                        subscription,
                        articles,
                    } => {
                        for a in articles {
                            println!(
                                "{}. {} - {} ({})",
                                a.article_id,
                                single_line(&subscription.title),
                                single_line(a.title.as_deref().unwrap_or_default()),
                                a.url
                            );
                        }
                    }
                    DeliveryOutcome::Delivered { sent, failed: 0 } => {
                        println!("Subscription {}: sent {} mail(s)", id, sent)
                    }
                    DeliveryOutcome::Delivered { sent, failed } => println!(
                        "Subscription {}: sent {} mail(s), {} failed",
                        id, sent, failed
                    ),
                    DeliveryOutcome::Failed(e) => {
                        eprintln!("Error: subscription {}: {}", id, e)
                    }
                }
            }
        }
    }

    Ok(())
}

fn report(err: &AppError) {
    eprintln!("Error: {}", err);
}
