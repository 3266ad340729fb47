use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{self, Config};
use crate::download::{BatchEvent, DownloadCoordinator};
use crate::enclosure::EnclosureResolver;
use crate::feed::{self, FeedWalker};
use crate::handles::HandleDirectory;
use crate::hub::{self, HttpHub, Hub};
use crate::ipfs::{KuboClient, ObjectStore};
use crate::logging::{self, Sink};
use crate::message::Signer;
use crate::publish::{Publisher, UploadRequest, UploadStage, DEFAULT_CAST_TEXT};
use crate::storage::{self, KvCache};
use crate::ui;

#[derive(Debug, Parser)]
#[command(
    name = "lemon3",
    version,
    about = "Share and collect file enclosures on Farcaster, stored on IPFS."
)]
pub struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Browse enclosures live, with the recent casts of the given authors.
    Tui {
        #[arg(value_name = "HANDLE")]
        handles: Vec<String>,
    },
    /// Sync an author's enclosures and download everything new.
    Feed {
        #[arg(value_name = "@HANDLE")]
        handle: String,
        /// Stop after this many pages of history.
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Download the enclosure of a single cast.
    Download {
        /// The cast, as @handle/0xhash (the full hash).
        #[arg(value_name = "@HANDLE/0xHASH")]
        cast: String,
        /// Directory to save into.
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
    /// Store a file on IPFS and announce it in a cast.
    Upload(UploadArgs),
    /// Inspect or change the configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    pub file: PathBuf,
    /// Cover image stored next to the file.
    #[arg(long)]
    pub artwork: Option<PathBuf>,
    #[arg(long)]
    pub title: Option<String>,
    /// File name recorded in the metadata.
    #[arg(long = "name")]
    pub filename: Option<String>,
    /// Mime type; sniffed from the content when omitted.
    #[arg(long = "mime")]
    pub mime_type: Option<String>,
    /// Description text, `@path` to read it from a file or `@-` for stdin.
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long = "cast", default_value = DEFAULT_CAST_TEXT)]
    pub cast_text: String,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location.
    Path,
    /// List every key with its effective value.
    Ls,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => config::default_path().context("config: unable to determine default config path")?,
    };

    let command = match cli.command {
        Command::Config(command) => return run_config(command, &config_path),
        command => command,
    };

    let sink = match &command {
        Command::Tui { .. } => match logging::default_log_file() {
            Some(path) => Sink::File(path),
            None => Sink::Stderr,
        },
        _ => Sink::Stderr,
    };
    if let Err(err) = logging::init(sink) {
        eprintln!("warning: {err:#}");
    }

    let cfg = config::load(config::LoadOptions {
        config_file: Some(config_path.clone()),
        env_prefix: None,
    })
    .context("load config")?;
    debug!(path = %config_path.display(), "config loaded");

    match command {
        Command::Tui { handles } => run_tui(&cfg, &handles),
        Command::Feed { handle, max_pages } => run_feed(&cfg, &handle, max_pages),
        Command::Download { cast, dir } => run_download(&cfg, &cast, dir),
        Command::Upload(args) => run_upload(&cfg, args),
        Command::Config(command) => run_config(command, &config_path),
    }
}

/// The collaborators every command shares, built once per process.
struct Services {
    store: Arc<storage::Store>,
    hub: Arc<dyn Hub>,
    ipfs: Arc<dyn ObjectStore>,
    resolver: EnclosureResolver,
    handles: HandleDirectory,
}

impl Services {
    fn connect(cfg: &Config) -> Result<Self> {
        let store =
            Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);
        let hub: Arc<dyn Hub> = Arc::new(
            HttpHub::new(hub::ClientConfig {
                url: cfg.hub.url.clone(),
                api_key: Some(cfg.hub.api_key.clone()),
                poll_interval: cfg.hub.poll_interval,
                ..hub::ClientConfig::default()
            })
            .context("connect to hub")?,
        );
        let ipfs: Arc<dyn ObjectStore> =
            Arc::new(KuboClient::new(&cfg.ipfs.api_url).context("connect to ipfs")?);
        let cache: Arc<dyn KvCache> = store.clone();
        let resolver = EnclosureResolver::new(ipfs.clone(), cache.clone());
        let handles = HandleDirectory::new(hub.clone(), cache);
        Ok(Self {
            store,
            hub,
            ipfs,
            resolver,
            handles,
        })
    }

    fn downloads(&self, cfg: &Config) -> DownloadCoordinator {
        DownloadCoordinator::new(self.ipfs.clone(), self.resolver.clone())
            .with_progress_interval(cfg.download.progress_interval)
    }

    /// Closes the cache if nothing else holds it.
    fn close(self) {
        let Services {
            store,
            hub,
            ipfs,
            resolver,
            handles,
        } = self;
        drop((hub, ipfs, resolver, handles));
        match Arc::try_unwrap(store) {
            Ok(store) => {
                if let Err(err) = store.close() {
                    warn!(error = %err, "cache close failed");
                }
            }
            Err(_) => debug!("cache still in use at exit"),
        }
    }
}

fn run_tui(cfg: &Config, handles: &[String]) -> Result<()> {
    let services = Services::connect(cfg)?;

    let viewer = account_fid(cfg, services.hub.as_ref()).unwrap_or_else(|err| {
        warn!(error = %err, "no local identity");
        None
    });
    let mut backfill: Vec<u64> = viewer.into_iter().collect();
    for handle in handles {
        let handle = handle.trim_start_matches('@');
        match services.hub.resolve_author_id(handle) {
            Ok(fid) if !backfill.contains(&fid) => backfill.push(fid),
            Ok(_) => {}
            Err(err) => eprintln!("Skipping @{handle}: {err}"),
        }
    }

    let publisher = match (viewer, signer(cfg)?) {
        (Some(fid), Some(signer)) => Some(Arc::new(Publisher::new(
            services.hub.clone(),
            services.ipfs.clone(),
            cfg.ipfs.gateway_url.clone(),
            fid,
            signer,
        ))),
        _ => None,
    };

    let options = ui::Options {
        hub: services.hub.clone(),
        resolver: services.resolver.clone(),
        handles: services.handles.clone(),
        downloads: services.downloads(cfg),
        download_root: cfg.download.root(),
        viewer,
        backfill,
        publisher,
        start_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    let mut model = ui::Model::new(options);
    let result = model.run();
    drop(model);
    services.close();
    result
}

fn run_feed(cfg: &Config, handle: &str, max_pages: Option<u32>) -> Result<()> {
    let handle = handle.trim_start_matches('@');
    if handle.is_empty() {
        bail!("feed: expected an @handle");
    }
    let services = Services::connect(cfg)?;
    let checkpoints = CheckpointStore::new(cfg.download.root());
    let first_run = checkpoints
        .load(handle)
        .map(|prior| prior.is_first_run())
        .with_context(|| format!("load checkpoint for @{handle}"))?;
    if first_run {
        println!("[+] First sync for @{handle}.");
    }

    let walker = FeedWalker::new(services.hub.clone(), services.resolver.clone())
        .with_max_pages(max_pages.or(cfg.feed.max_pages));
    let outcome = walker
        .sync_and_save(&checkpoints, handle, cfg.feed.page_size)
        .with_context(|| format!("sync @{handle}"))?;
    println!(
        "[+] {} new enclosure(s), {} known in total.",
        outcome.new_casts.len(),
        outcome.checkpoint.casts.len()
    );

    let dest = checkpoints.author_dir(handle)?;
    let downloads = services.downloads(cfg);
    let mut bar: Option<ProgressBar> = None;
    let report = downloads.download_batch(&outcome.checkpoint.casts, &dest, &mut |event| {
        match event {
            BatchEvent::Started { meta, .. } => {
                let pb = byte_bar(meta.size);
                pb.set_message(meta.filename.clone());
                bar = Some(pb);
            }
            BatchEvent::Progress { progress, .. } => {
                if let Some(pb) = &bar {
                    if progress.total > 0 {
                        pb.set_length(progress.total);
                    }
                    pb.set_position(progress.done);
                }
            }
            BatchEvent::Finished { path, .. } => {
                if let Some(pb) = bar.take() {
                    pb.finish_with_message(format!("saved {}", path.display()));
                }
            }
            BatchEvent::Skipped { path, .. } => {
                println!("[=] {} already downloaded.", path.display());
            }
            BatchEvent::Failed { cast, error } => {
                if let Some(pb) = bar.take() {
                    pb.abandon_with_message("failed");
                }
                eprintln!("[!] {}: {error}", cast.reference());
            }
        }
    });

    println!(
        "[+] {} downloaded, {} skipped, {} failed.",
        report.downloaded.len(),
        report.skipped.len(),
        report.failed.len()
    );
    info!(handle, failed = report.failed.len(), "feed download finished");
    services.close();
    Ok(())
}

fn run_download(cfg: &Config, reference: &str, dir: Option<PathBuf>) -> Result<()> {
    let Some((handle, hash)) = feed::parse_cast_reference(reference) else {
        bail!("download: invalid cast {reference:?}, expected @handle/0xhash");
    };
    let services = Services::connect(cfg)?;
    let walker = FeedWalker::new(services.hub.clone(), services.resolver.clone());
    let cast = walker
        .fetch_cast(handle, hash)
        .with_context(|| format!("fetch {reference}"))?;
    let meta = cast
        .enclosure
        .as_ref()
        .context("download: enclosure metadata missing")?;
    println!("[+] {} ({})", meta.filename, meta.human_size());

    let dest = dir.unwrap_or_else(|| PathBuf::from("."));
    let pb = byte_bar(meta.size);
    pb.set_message(meta.filename.clone());
    let path = services
        .downloads(cfg)
        .download_enclosure(meta, &dest, &mut |progress| {
            if progress.total > 0 {
                pb.set_length(progress.total);
            }
            pb.set_position(progress.done);
        })
        .with_context(|| format!("download {}", meta.file_cid()))?;
    pb.finish_with_message(format!("saved {}", path.display()));
    services.close();
    Ok(())
}

fn run_upload(cfg: &Config, args: UploadArgs) -> Result<()> {
    let signer = signer(cfg)?.context(
        "upload: no app key configured (lemon3 config set account.private_key <hex>)",
    )?;
    let description = read_description(&args.description)?;
    let services = Services::connect(cfg)?;
    let fid = account_fid(cfg, services.hub.as_ref())?
        .context("upload: set account.fid or account.fname first")?;

    let publisher = Publisher::new(
        services.hub.clone(),
        services.ipfs.clone(),
        cfg.ipfs.gateway_url.clone(),
        fid,
        signer,
    );
    let request = UploadRequest {
        file: args.file,
        artwork: args.artwork,
        title: args.title,
        filename: args.filename,
        mime_type: args.mime_type,
        description,
        cast_text: args.cast_text,
    };

    let mut bar: Option<(UploadStage, ProgressBar)> = None;
    let published = publisher
        .publish(&request, &mut |stage, done, total| {
            if bar.as_ref().map(|(current, _)| *current) != Some(stage) {
                if let Some((_, pb)) = bar.take() {
                    pb.finish();
                }
                let pb = byte_bar(total);
                pb.set_message(match stage {
                    UploadStage::File => "file",
                    UploadStage::Artwork => "artwork",
                });
                bar = Some((stage, pb));
            }
            if let Some((_, pb)) = &bar {
                pb.set_position(done);
            }
        })
        .context("upload")?;
    if let Some((_, pb)) = bar.take() {
        pb.finish();
    }

    println!("[+] {} pinned.", published.metadata.enclosed.cid);
    if let Some(artwork) = published.metadata.artwork_cid() {
        println!("[+] {artwork} pinned.");
    }
    println!("[+] metadata {} pinned.", published.metadata_cid);
    println!("[+] cast {} submitted.", published.cast_hash);
    services.close();
    Ok(())
}

fn run_config(command: ConfigCommand, path: &Path) -> Result<()> {
    match command {
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Ls => {
            let cfg = config::load(config::LoadOptions {
                config_file: Some(path.to_path_buf()),
                env_prefix: None,
            })?;
            for (key, value) in config::entries(&cfg) {
                println!("{key} = {value}");
            }
        }
        ConfigCommand::Get { key } => {
            let cfg = config::load(config::LoadOptions {
                config_file: Some(path.to_path_buf()),
                env_prefix: None,
            })?;
            println!("{}", config::get_key(&cfg, &key)?);
        }
        ConfigCommand::Set { key, value } => {
            let mut cfg = config::load_file(path)?;
            config::set_key(&mut cfg, &key, &value)?;
            config::save(path, &cfg)?;
        }
    }
    Ok(())
}

fn signer(cfg: &Config) -> Result<Option<Signer>> {
    let key = cfg.account.private_key.trim();
    if key.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        Signer::from_hex(key).context("config: account.private_key")?,
    ))
}

/// The configured fid, or the one registered for the configured fname.
fn account_fid(cfg: &Config, hub: &dyn Hub) -> Result<Option<u64>> {
    if cfg.account.fid != 0 {
        return Ok(Some(cfg.account.fid));
    }
    let fname = cfg.account.fname.trim();
    if fname.is_empty() {
        return Ok(None);
    }
    let fid = hub
        .resolve_author_id(fname)
        .with_context(|| format!("resolve account @{fname}"))?;
    Ok(Some(fid))
}

fn read_description(raw: &str) -> Result<String> {
    let Some(source) = raw.strip_prefix('@') else {
        return Ok(raw.to_string());
    };
    let text = if source == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("read description from stdin")?;
        text
    } else {
        fs::read_to_string(source).with_context(|| format!("read description file {source}"))?
    };
    Ok(text.trim().to_string())
}

fn byte_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:20!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb
}
