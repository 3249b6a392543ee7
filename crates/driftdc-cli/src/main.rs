//! driftdc - a command-line Direct Connect client.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use driftdc_client::{Core, CoreCommand, Notice};
use driftdc_proto::{SearchKind, SizeConstraint};
use driftdc_transfer::JsonStore;
use driftdc_tth::Root;
use std::path::PathBuf;
use std::sync::Arc;

/// Direct Connect client: hubs, search, segmented TTH-verified
/// downloads.
#[derive(Parser)]
#[command(name = "driftdc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured hubs and keep running
    Daemon,

    /// Search the configured hubs and print results
    Search {
        /// Search terms
        terms: Vec<String>,

        /// Search for an exact Tiger tree root instead
        #[arg(long)]
        tth: Option<String>,

        /// Seconds to wait for results
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },

    /// Hash a local file and print its Tiger tree root
    Hash {
        /// File to hash
        file: PathBuf,
    },

    /// Build the share and write its files.xml.bz2
    Filelist {
        /// Output path (default: files.xml.bz2)
        #[arg(short, long, default_value = "files.xml.bz2")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let path = cli.config.unwrap_or_else(config::default_path);
    let loaded = config::load(&path)?;

    match cli.command {
        Commands::Daemon => run_daemon(loaded).await,
        Commands::Search { terms, tth, wait } => run_search(loaded, terms, tth, wait).await,
        Commands::Hash { file } => hash_file(&file),
        Commands::Filelist { output } => write_filelist(loaded, &output).await,
    }
}

fn open_store(cfg: &driftdc_client::Config) -> anyhow::Result<Arc<JsonStore>> {
    std::fs::create_dir_all(&cfg.incoming_dir)
        .with_context(|| format!("creating {}", cfg.incoming_dir.display()))?;
    let store = JsonStore::open(cfg.incoming_dir.join("queue.json"))
        .context("opening download state")?;
    Ok(Arc::new(store))
}

fn connect_hubs(loaded: &config::Loaded, cmd: &tokio::sync::mpsc::UnboundedSender<CoreCommand>) {
    for hub in &loaded.hubs {
        let _ = cmd.send(CoreCommand::AddHub {
            url: hub.url.clone(),
            nick: hub.nick.clone(),
            password: hub.password.clone(),
            encoding: hub.encoding.clone(),
        });
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Hub { hub_id, text } => println!("[hub {hub_id}] {text}"),
        Notice::HubState { hub_id, state } => {
            tracing::debug!(hub_id, ?state, "hub state");
        }
        Notice::Chat {
            hub_id,
            from,
            text,
        } => match from {
            Some(nick) => println!("[hub {hub_id}] <{nick}> {text}"),
            None => println!("[hub {hub_id}] {text}"),
        },
        Notice::Private {
            hub_id,
            from,
            text,
        } => println!("[hub {hub_id}] PM <{from}> {text}"),
        Notice::SearchHit { result, .. } => {
            let size = result
                .size
                .map_or_else(|| "DIR".to_owned(), |s| s.to_string());
            let tth = result
                .tth
                .map_or_else(String::new, |t| format!(" TTH:{t}"));
            println!(
                "  {} {:>12}  slots {}{}",
                result.path, size, result.slots_free, tth
            );
        }
        Notice::PasswordNeeded { hub_id } => {
            println!("[hub {hub_id}] password required; set one in the config file");
        }
        Notice::TransferDone { dest } => println!("finished: {}", dest.display()),
        Notice::TransferFailed { dest, reason } => {
            println!("failed: {} ({reason})", dest.display());
        }
        Notice::FilelistReady { uid, path } => {
            println!("file list of {uid}: {}", path.display());
        }
    }
}

async fn run_daemon(loaded: config::Loaded) -> anyhow::Result<()> {
    let store = open_store(&loaded.config)?;
    let (core, mut notices, cmd) = Core::new(loaded.config.clone(), store);
    tokio::spawn(core.run());
    connect_hubs(&loaded, &cmd);

    println!("driftdc {} running, ^C to quit", env!("CARGO_PKG_VERSION"));
    loop {
        tokio::select! {
            Some(notice) = notices.recv() => print_notice(&notice),
            _ = tokio::signal::ctrl_c() => {
                println!("\nshutting down");
                return Ok(());
            }
        }
    }
}

async fn run_search(
    loaded: config::Loaded,
    terms: Vec<String>,
    tth: Option<String>,
    wait: u64,
) -> anyhow::Result<()> {
    if loaded.hubs.is_empty() {
        anyhow::bail!("no hubs configured");
    }
    let (kind, tth) = match tth {
        Some(t) => {
            let root = Root::from_base32(&t).map_err(|_| anyhow::anyhow!("invalid TTH root"))?;
            (SearchKind::Tth, Some(root))
        }
        None => {
            if terms.is_empty() {
                anyhow::bail!("give search terms or --tth");
            }
            (SearchKind::Any, None)
        }
    };

    let store = open_store(&loaded.config)?;
    let (core, mut notices, cmd) = Core::new(loaded.config.clone(), store);
    tokio::spawn(core.run());
    connect_hubs(&loaded, &cmd);

    // Give the sessions a moment to log in before broadcasting.
    let mut logged_in = false;
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(wait);
    let mut hits = 0u32;
    loop {
        tokio::select! {
            Some(notice) = notices.recv() => {
                if let Notice::Hub { text, .. } = &notice {
                    if text == "logged in" && !logged_in {
                        logged_in = true;
                        let _ = cmd.send(CoreCommand::Search {
                            kind,
                            size: SizeConstraint::None,
                            terms: terms.clone(),
                            tth,
                        });
                        println!("searching...");
                    }
                }
                if matches!(notice, Notice::SearchHit { .. }) {
                    hits += 1;
                }
                print_notice(&notice);
            }
            () = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    println!("{hits} result(s)");
    Ok(())
}

fn hash_file(file: &PathBuf) -> anyhow::Result<()> {
    use std::io::Read;
    let mut f = std::fs::File::open(file).with_context(|| format!("{}", file.display()))?;
    let size = f.metadata()?.len();
    let bs = driftdc_tth::tree::block_size(size, 4096).max(driftdc_tth::MIN_BLOCK_SIZE);
    let mut hasher = driftdc_tth::TthHasher::new(bs);
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let (root, blocks) = hasher.finalize();
    println!("{root}");
    tracing::debug!(size, blocks = blocks.len(), block_size = bs, "hashed");
    Ok(())
}

async fn write_filelist(loaded: config::Loaded, output: &PathBuf) -> anyhow::Result<()> {
    if loaded.config.share_dirs.is_empty() {
        anyhow::bail!("nothing shared; add [share] entries to the config");
    }
    let share = driftdc_client::ShareIndex::new();
    share
        .rebuild(&loaded.config, driftdc_net::Bucket::new(loaded.config.hash_rate))
        .await
        .context("building share")?;
    let list = share
        .list
        .read()
        .map_err(|_| anyhow::anyhow!("share lock poisoned"))?;
    driftdc_filelist::xml::save_filelist(&list, output).context("writing file list")?;
    println!(
        "{}: {} bytes shared",
        output.display(),
        list.size(list.root())
    );
    Ok(())
}
