use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use raw_history::config::Config;
use raw_history::history::{self, clipboard::Clipboard};
use raw_history::{Context, Develop};

/// Maintenance of the RAW editor's edit history
#[derive(Parser, Debug)]
#[command(name = "raw-history")]
#[command(about = "Inspect and maintain stored edit histories", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the editor's own)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Image record and history summary
    Info { imgid: i32 },
    /// Stored history, newest first
    History { imgid: i32 },
    /// Compress the histories whose cursor is at the top
    Compress {
        #[arg(required = true)]
        imgids: Vec<i32>,
    },
    /// Drop the items at or past END
    Truncate { imgid: i32, end: i32 },
    /// Delete whole histories
    Delete {
        #[arg(required = true)]
        imgids: Vec<i32>,
    },
    /// Paste the history of SRC onto DEST images
    Copy {
        src: i32,
        #[arg(required = true)]
        dest: Vec<i32>,
        /// Only these history item numbers
        #[arg(long, value_delimiter = ',')]
        ops: Vec<i32>,
        /// Include image-specific modules
        #[arg(long)]
        full: bool,
        /// Also copy the module order
        #[arg(long)]
        iop_order: bool,
    },
    /// Mark the thumbnail as up to date with the history
    Mipmap { imgid: i32 },
    /// Write the sidecar file next to the image
    ExportSidecar { imgid: i32 },
    /// Replace the stored history with a sidecar's
    ApplySidecar { imgid: i32, path: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path).with_context(|| format!("reading {}", path.display()))?,
        None => Config::load()?,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let ctx = Context::open(config).context("opening the catalog")?;
    let writer = ctx.config.write_sidecar_files.then(|| ctx.start_sidecar_writer(runtime.handle()));

    run(&ctx, cli.command)?;

    if let Some(writer) = writer {
        runtime.block_on(writer.flush());
    }
    Ok(())
}

fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Info { imgid } => {
            let img = ctx.image_cache.read(imgid).with_context(|| format!("no image {imgid}"))?;
            println!("{} ({})", img.filename, img.folder);
            println!("flags:         {:?}", img.flags);
            println!("history items: {}", img.history_items);
            println!("history hash:  {:#018x}", img.history_hash);
            println!("mipmap hash:   {:#018x}", img.mipmap_hash);
            drop(img);
            println!("history end:   {}", ctx.library.history_get_end(imgid)?);
            println!("cursor:        {:?}", history::end_attop(ctx, imgid)?);
        }
        Command::History { imgid } => {
            println!("{}", history::items_as_string(ctx, imgid)?);
        }
        Command::Compress { imgids } => {
            let skipped = history::compress_on_list(ctx, &imgids)?;
            if skipped > 0 {
                println!("{skipped} image(s) not compressed: history cursor is not at the top");
            }
        }
        Command::Truncate { imgid, end } => {
            history::truncate_on_image(ctx, imgid, end)?;
            let dev = Develop::load(ctx.clone(), imgid)?;
            println!("{} items, end {}", dev.history.len(), dev.history_end());
        }
        Command::Delete { imgids } => {
            history::delete_on_list(ctx, &imgids, true)?;
        }
        Command::Copy { src, dest, ops, full, iop_order } => {
            let mut clipboard = Clipboard::default();
            if ops.is_empty() {
                clipboard.copy(src);
                clipboard.full_copy = full;
            } else {
                clipboard.copy_parts(src, &ops);
            }
            clipboard.copy_iop_order = iop_order;
            let pasted = clipboard.paste_on_list(ctx, &dest, true)?;
            println!("pasted onto {pasted} image(s)");
        }
        Command::Mipmap { imgid } => {
            history::hash_set_mipmap(ctx, imgid)?;
        }
        Command::ExportSidecar { imgid } => {
            let path = history::export_sidecar(ctx, imgid)?;
            println!("{}", path.display());
        }
        Command::ApplySidecar { imgid, path } => {
            history::load_and_apply(ctx, imgid, &path)?;
        }
    }
    Ok(())
}
