//! Tumblr-Vault main entry point
//!
//! This is the command-line interface for the Tumblr-Vault blog archiver.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tumblr_vault::backup::coord::install_signal_handlers;
use tumblr_vault::backup::driver::{BackupDriver, EXIT_ERRORS};
use tumblr_vault::config::{
    compute_config_hash, load_file_config, parse_period, parse_request, validate, FileConfig,
    ImageNames, Options,
};

/// Tumblr-Vault: an incremental Tumblr blog archiver
///
/// Backs up one or more blogs' posts and media into browsable local
/// archives, resuming interrupted runs and extending complete ones
/// incrementally.
#[derive(Parser, Debug)]
#[command(name = "tumblr-vault")]
#[command(version)]
#[command(about = "An incremental Tumblr blog archiver", long_about = None)]
struct Cli {
    /// Blog names (or custom domains) to back up
    #[arg(value_name = "BLOG", required = true)]
    blogs: Vec<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Path to a TOML settings file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// API key (overrides the settings file and TUMBLR_API_KEY)
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Directory archives are created under
    #[arg(long, value_name = "DIR")]
    output_root: Option<PathBuf>,

    /// Archive directory for a single blog (relative to the output root)
    #[arg(short = 'O', long, value_name = "DIR")]
    outdir: Option<PathBuf>,

    /// Save each post in its own folder, named posts/<id>/index.html
    #[arg(short = 'D', long)]
    dirs: bool,

    /// Save media files in one folder per hostname
    #[arg(long)]
    hostdirs: bool,

    /// Image file naming: o (original), i (post id), bi (blog + post id)
    #[arg(short = 'I', long, value_name = "FMT", value_parser = parse_image_names)]
    image_names: Option<ImageNames>,

    /// Back up the account's likes instead of its posts
    #[arg(short = 'l', long)]
    likes: bool,

    /// Only back up posts newer than the newest one already saved
    #[arg(short = 'i', long)]
    incremental: bool,

    /// Continue an interrupted backup
    #[arg(short = 'c', long = "continue")]
    resume: bool,

    /// Allow backup-changing option mismatches against a prior archive
    #[arg(long)]
    ignore_diffopt: bool,

    /// Save only this many posts
    #[arg(short = 'n', long, value_name = "N")]
    count: Option<usize>,

    /// Skip this many newest posts
    #[arg(short = 's', long, value_name = "N", default_value_t = 0)]
    skip: usize,

    /// Limit the backup to a period: y, m, d or YYYY[MM[DD]][Z], or a
    /// start,end pair
    #[arg(short = 'p', long, value_name = "PERIOD")]
    period: Option<String>,

    /// Save only posts matching TYPE:TAG,TAG (repeatable)
    #[arg(short = 'Q', long = "request", value_name = "TYPE:TAGS")]
    request: Vec<String>,

    /// Save only posts matching a /pointer=value expression
    #[arg(long, value_name = "EXPR")]
    filter: Option<String>,

    /// Skip reblogged posts
    #[arg(long, conflicts_with = "only_reblog")]
    no_reblog: bool,

    /// Save only reblogged posts
    #[arg(long)]
    only_reblog: bool,

    /// Save images referenced by posts
    #[arg(short = 'k', long)]
    save_images: bool,

    /// Save Tumblr-hosted videos
    #[arg(long)]
    save_video: bool,

    /// Save audio files
    #[arg(long)]
    save_audio: bool,

    /// Scrape and save post notes
    #[arg(long)]
    save_notes: bool,

    /// Limit the number of saved notes per post
    #[arg(long, value_name = "N")]
    notes_limit: Option<u32>,

    /// Save the raw API document of every post under json/
    #[arg(short = 'j', long = "json")]
    save_json: bool,

    /// Never overwrite an existing post file
    #[arg(long)]
    no_post_clobber: bool,

    /// Previous archive directories, one per blog, reused as media sources
    #[arg(long, value_name = "DIR", num_args = 1..)]
    prev_archives: Vec<PathBuf>,

    /// Reprocess the saved json/ documents of the archive itself
    #[arg(long)]
    reuse_json: bool,

    /// Don't download anything new; reuse saved or prior-archive media
    #[arg(long)]
    no_get: bool,

    /// Maintain a media.json list of media URLs per post
    #[arg(long)]
    media_list: bool,

    /// Back up exactly these post ids (comma-separated)
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    ids: Option<Vec<u64>>,

    /// Build per-tag index pages
    #[arg(long, conflicts_with = "dirs")]
    tag_index: bool,

    /// Posts per monthly archive page
    #[arg(long, value_name = "N", default_value_t = 50)]
    posts_per_page: usize,

    /// Number of post-saving worker threads
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// User agent for all outgoing requests
    #[arg(long, value_name = "UA")]
    user_agent: Option<String>,
}

fn parse_image_names(value: &str) -> Result<ImageNames, String> {
    match value {
        "o" => Ok(ImageNames::Original),
        "i" => Ok(ImageNames::PostId),
        "bi" => Ok(ImageNames::BlogPostId),
        other => Err(format!("expected 'o', 'i' or 'bi', got '{}'", other)),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    // Load the optional settings file
    let file_config = match &cli.config {
        Some(path) => {
            let config = load_file_config(path)?;
            let hash = compute_config_hash(path)?;
            tracing::info!("Settings loaded from {} (hash: {})", path.display(), hash);
            config
        }
        None => FileConfig::default(),
    };

    let options = build_options(&cli, &file_config)?;
    validate(&options)?;

    if !cli.prev_archives.is_empty() {
        check_prev_archives(&cli, &options)?;
    }

    let api_key = cli
        .api_key
        .clone()
        .or(file_config.api.api_key)
        .or_else(|| std::env::var("TUMBLR_API_KEY").ok())
        .unwrap_or_default();
    let needs_api = !options.reuse_json && cli.prev_archives.is_empty();
    if api_key.is_empty() && needs_api {
        eprintln!(
            "Missing API key; get your own at https://www.tumblr.com/oauth/apps\n\
             and pass it with --api-key, the settings file, or TUMBLR_API_KEY."
        );
        std::process::exit(EXIT_ERRORS);
    }

    let output_root = cli
        .output_root
        .clone()
        .or(file_config.backup.output_root.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    install_signal_handlers();

    let mut driver = BackupDriver::new(options, api_key, output_root);
    let code = driver.run(&cli.blogs, &cli.prev_archives);
    std::process::exit(code);
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("tumblr_vault=info,warn"),
            1 => EnvFilter::new("tumblr_vault=debug,info"),
            2 => EnvFilter::new("tumblr_vault=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Merges CLI flags over the settings file into one option set
fn build_options(cli: &Cli, file_config: &FileConfig) -> Result<Options, Box<dyn std::error::Error>> {
    let mut options = Options {
        likes: cli.likes,
        dirs: cli.dirs,
        hostdirs: cli.hostdirs,
        image_names: cli.image_names.unwrap_or_default(),
        save_images: cli.save_images,
        save_video: cli.save_video,
        save_audio: cli.save_audio,
        save_notes: cli.save_notes,
        notes_limit: cli.notes_limit,
        save_json: cli.save_json,
        count: cli.count,
        skip: cli.skip,
        period: None,
        request: None,
        filter: cli.filter.clone(),
        no_reblog: cli.no_reblog,
        only_reblog: cli.only_reblog,
        prev_archive: cli.prev_archives.first().cloned(),
        user_agent: cli.user_agent.clone().or(file_config.api.user_agent.clone()),
        no_get: cli.no_get,
        media_list: cli.media_list,
        idents: cli.ids.clone(),
        reuse_json: cli.reuse_json,
        tag_index: cli.tag_index,
        posts_per_page: cli.posts_per_page,
        incremental: cli.incremental,
        resume: cli.resume,
        ignore_diffopt: cli.ignore_diffopt,
        no_post_clobber: cli.no_post_clobber,
        threads: cli
            .threads
            .or(file_config.backup.threads)
            .unwrap_or_else(|| Options::default().threads),
        outdir: cli.outdir.clone(),
    };

    if let Some(period) = &cli.period {
        options.period = Some(parse_period(period)?);
    }
    if !cli.request.is_empty() {
        options.request = Some(parse_request(&cli.request)?);
    }
    if options.resume || options.incremental {
        // Do not clobber or count posts that were already backed up
        options.no_post_clobber = true;
    }
    if cli.outdir.is_some() && cli.blogs.len() > 1 {
        return Err("-O can only be used for a single blog".into());
    }

    Ok(options)
}

/// Sanity checks for --prev-archives
fn check_prev_archives(cli: &Cli, options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    if cli.prev_archives.len() != cli.blogs.len() {
        return Err(format!(
            "--prev-archives: expected {} directories, got {}",
            cli.blogs.len(),
            cli.prev_archives.len()
        )
        .into());
    }
    for (blog, prev) in cli.blogs.iter().zip(&cli.prev_archives) {
        if !prev.is_dir() {
            return Err(format!(
                "--prev-archives: directory '{}' cannot be read",
                prev.display()
            )
            .into());
        }
        let blog_dir = options
            .outdir
            .clone()
            .unwrap_or_else(|| PathBuf::from(blog));
        if let (Ok(prev_real), Ok(blog_real)) = (prev.canonicalize(), blog_dir.canonicalize()) {
            if prev_real == blog_real {
                return Err(format!(
                    "--prev-archives: directory '{}' is also being written to; use --reuse-json \
                     instead if you want this, or specify --outdir if you don't",
                    prev.display()
                )
                .into());
            }
        }
    }
    Ok(())
}
