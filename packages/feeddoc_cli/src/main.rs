//! feeddoc command line
//!
//! Works against a local store directory holding a blob store and a feed
//! register, so several processes on one machine can share feeds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use feeddoc::config::{FeedDocConfig, LiveOptions, PollOptions};
use feeddoc::convergent::{ConvergentDocument, Value};
use feeddoc::document::{DocSerialized, DocumentReader, DocumentWriter};
use feeddoc::feed::{
    ContentStore, FeedRegister, LocalFileContentStore, LocalFileFeedRegister, OwnerAddress, Topic,
};
use feeddoc::identity::FeedIdentity;
use feeddoc::timeline::{Chapter, PartialChapter, TimelineReader, TimelineWriter};
use feeddoc::FeedError;

/// Publish and follow signed timelines and documents
#[derive(Parser, Debug)]
#[command(name = "feeddoc")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding blobs and feeds
    #[arg(long, default_value = "./feeddoc-store")]
    store: PathBuf,

    /// Optional JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a signing key, or show the address of an existing one
    Keygen {
        #[arg(long, default_value = "./feeddoc.key")]
        key: PathBuf,
    },

    /// Append a chapter to a timeline
    Post {
        #[arg(long, default_value = "./feeddoc.key")]
        key: PathBuf,
        #[arg(long)]
        topic: String,
        /// Chapter content; parsed as JSON when possible
        content: String,
    },

    /// Print the newest chapter of a timeline
    Latest {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        topic: String,
    },

    /// Print a timeline newest first
    Log {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Follow a timeline and print chapters as they arrive
    Watch {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },

    /// Set a field on a document and publish the change
    DocSet {
        #[arg(long, default_value = "./feeddoc.key")]
        key: PathBuf,
        /// Document name; its meta feed topic is derived from it
        #[arg(long)]
        doc: String,
        /// Session file kept between runs
        #[arg(long)]
        state: PathBuf,
        item: String,
        field: String,
        /// Field value; parsed as JSON when possible
        value: String,
    },

    /// Print the current state of a document
    DocShow {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        doc: String,
    },
}

struct Backend {
    store: Arc<dyn ContentStore>,
    register: Arc<dyn FeedRegister>,
    config: FeedDocConfig,
}

impl Backend {
    fn open(dir: &Path, config: Option<&Path>) -> Result<Self, FeedError> {
        let config = match config {
            Some(path) => FeedDocConfig::load(path)?,
            None => FeedDocConfig::default(),
        };
        Ok(Self {
            store: Arc::new(LocalFileContentStore::new(dir.join("blobs"))?),
            register: Arc::new(LocalFileFeedRegister::new(dir.join("feeds"))?),
            config,
        })
    }

    fn timeline_reader(
        &self,
        owner: OwnerAddress,
        topic: &str,
    ) -> TimelineReader<serde_json::Value> {
        TimelineReader::with_config(
            self.store.clone(),
            self.register.clone(),
            owner,
            Topic::from_name(topic),
            self.config.timeline.clone(),
        )
    }
}

fn load_key(path: &Path) -> Result<Arc<FeedIdentity>, FeedError> {
    FeedIdentity::load_or_generate(path)
        .map(Arc::new)
        .map_err(|e| FeedError::Persistence(format!("key {}: {}", path.display(), e)))
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_chapter(chapter: &Chapter<serde_json::Value>) -> Result<(), FeedError> {
    println!("{}", chapter.id);
    println!("{}", serde_json::to_string_pretty(chapter)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), FeedError> {
    let backend = Backend::open(&cli.store, cli.config.as_deref())?;

    match cli.command {
        Command::Keygen { key } => {
            let identity = load_key(&key)?;
            println!("{}", identity.address());
        }

        Command::Post {
            key,
            topic,
            content,
        } => {
            let identity = load_key(&key)?;
            let writer: TimelineWriter<serde_json::Value> = TimelineWriter::with_config(
                backend.store.clone(),
                backend.register.clone(),
                identity,
                Topic::from_name(&topic),
                backend.config.timeline.clone(),
            );
            let chapter = writer.add_chapter(PartialChapter::new(parse_json(&content))).await?;
            println!("{}", chapter.id);
        }

        Command::Latest { owner, topic } => {
            let reader = backend.timeline_reader(owner.parse()?, &topic);
            match reader.get_latest_chapter().await? {
                Some(chapter) => print_chapter(&chapter)?,
                None => println!("(empty)"),
            }
        }

        Command::Log {
            owner,
            topic,
            limit,
        } => {
            let reader = backend.timeline_reader(owner.parse()?, &topic);
            let mut chapters = reader.iter(None).take(limit);
            while let Some(chapter) = chapters.next().await {
                print_chapter(&chapter?)?;
            }
        }

        Command::Watch {
            owner,
            topic,
            interval_ms,
        } => {
            let reader = backend.timeline_reader(owner.parse()?, &topic);
            let options = LiveOptions {
                poll: PollOptions::every(interval_ms),
                backfill: true,
                ..backend.config.live.clone()
            };
            let subscription = reader.live(options, |batch| {
                for chapter in &batch {
                    if let Err(e) = print_chapter(chapter) {
                        log::warn!("failed to print chapter {}: {}", chapter.id, e);
                    }
                }
            });
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| FeedError::transport(format!("signal handler: {}", e)))?;
            subscription.stop();
            subscription.join().await?;
        }

        Command::DocSet {
            key,
            doc,
            state,
            item,
            field,
            value,
        } => {
            let identity = load_key(&key)?;
            let writer = if state.exists() {
                DocumentWriter::load(
                    &DocSerialized::read_from(&state)?,
                    backend.store.clone(),
                    backend.register.clone(),
                    identity,
                    backend.config.timeline.clone(),
                )?
            } else {
                DocumentWriter::create(
                    backend.store.clone(),
                    backend.register.clone(),
                    identity,
                    Topic::from_name(&doc),
                    ConvergentDocument::new_replica(),
                    backend.config.timeline.clone(),
                )
                .await?
            };

            writer.pull().await?;
            let value: Value = serde_json::from_value(parse_json(&value))?;
            writer.change(|doc| {
                doc.set(&item, &field, value);
            })
            .await;
            match writer.push().await? {
                Some(id) => println!("{}", id),
                None => println!("(unchanged)"),
            }
            writer.save().await?.write_to(&state)?;
        }

        Command::DocShow { owner, doc } => {
            let reader = DocumentReader::from_meta_feed(
                backend.store.clone(),
                backend.register.clone(),
                owner.parse()?,
                Topic::from_name(&doc),
                ConvergentDocument::new_replica(),
                backend.config.timeline.clone(),
            )
            .await?;
            reader.pull().await?;
            let state = reader.read(|doc| doc.materialize()).await;
            for (item_id, item) in state.iter_existing() {
                println!("{} ({})", item_id, item.item_type);
                for (field, value) in &item.fields {
                    println!("  {} = {}", field, serde_json::to_string(value)?);
                }
                for (set, elements) in &item.sets {
                    println!("  {} = {}", set, serde_json::to_string(elements)?);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
