use clap::{ArgAction, Parser, Subcommand};
use diskview::{FileType, LoopbackConfig, PullClass, Session, SessionConfig};
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "diskview", about = "Browse disk images, loopback mounts and RAID arrays")]
struct Cli {
    /// JSON session configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Mount a loopback for this run (repeatable)
    #[arg(short = 'l', long = "loop", value_name = "NAME=PATH", global = true)]
    loops: Vec<String>,
    /// Device used for names without a (device) part
    #[arg(short, long, global = true)]
    root: Option<String>,
    /// More log output (repeat for more)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every device the session can open
    Devices,
    /// Identify the filesystem on a device
    Probe {
        device: String,
    },
    /// List a directory, e.g. "(ld0)/boot"
    Ls {
        name: String,
    },
    /// Write a file to stdout
    Cat {
        name: String,
        /// Skip the decompression filters
        #[arg(long)]
        raw: bool,
    },
    /// Copy a file to the host
    Extract {
        name: String,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        raw: bool,
    },
    /// CRC32 and BLAKE3 of a file's content
    Sum {
        name: String,
        #[arg(long)]
        raw: bool,
    },
    /// Hex dump part of a file
    Dump {
        name: String,
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long, default_value = "256")]
        length: u64,
        #[arg(long)]
        raw: bool,
    },
}

const COPY_CHUNK: usize = 64 << 10;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    stderrlog::new()
        .module(module_path!())
        .verbosity(1 + cli.verbose as usize)
        .quiet(cli.quiet)
        .init()?;

    let session = build_session(&cli)?;

    match cli.command {

        // ── Devices ──────────────────────────────────────────────────────────
        Commands::Devices => {
            for pull in [PullClass::None, PullClass::Removable] {
                session.device_iterate(&mut |name| {
                    println!("{name}");
                    false
                }, pull);
            }
        }

        // ── Probe ────────────────────────────────────────────────────────────
        Commands::Probe { device } => {
            let info = session.probe(&device)?;
            println!("  Device     {device}");
            println!("  Filesystem {}", info.fs);
            println!("  Label      {}", info.label.as_deref().unwrap_or("-"));
            println!("  UUID       {}", info.uuid.as_deref().unwrap_or("-"));
            if let Some(mtime) = info.mtime {
                println!("  Modified   {}", format_time(mtime));
            }
        }

        // ── Ls ───────────────────────────────────────────────────────────────
        Commands::Ls { name } => {
            println!("{:>12}  {:<19}  Name", "Size", "Modified");
            session.dir(&name, &mut |entry, info| {
                let size = info.size.map(|s| s.to_string()).unwrap_or_default();
                let mtime = info.mtime.map(format_time).unwrap_or_default();
                let slash = if info.is_dir { "/" } else { "" };
                println!("{size:>12}  {mtime:<19}  {entry}{slash}");
                false
            })?;
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { name, raw } => {
            let mut file = session.file_open(&name, file_type(FileType::EXTRACT, raw))?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut file, &mut out)?;
            out.flush()?;
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { name, output, raw } => {
            let mut file = session.file_open(&name, file_type(FileType::EXTRACT, raw))?;
            let mut out = std::fs::File::create(&output)?;
            let n = io::copy(&mut file, &mut out)?;
            println!("Extracted {n} bytes to {}", output.display());
        }

        // ── Sum ──────────────────────────────────────────────────────────────
        Commands::Sum { name, raw } => {
            let mut file = session.file_open(&name, file_type(FileType::HASH_LIST, raw))?;
            let mut crc = crc32fast::Hasher::new();
            let mut b3 = blake3::Hasher::new();
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut total = 0u64;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                crc.update(&buf[..n]);
                b3.update(&buf[..n]);
                total += n as u64;
            }
            println!("  Bytes   {total}");
            println!("  CRC32   {:08x}", crc.finalize());
            println!("  BLAKE3  {}", b3.finalize().to_hex());
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { name, offset, length, raw } => {
            let mut file = session.file_open(&name, file_type(FileType::NONE, raw))?;
            file.seek(offset)?;
            let mut buf = vec![0u8; usize::try_from(length)?];
            let n = file.read_full(&mut buf)?;
            for (i, row) in buf[..n].chunks(16).enumerate() {
                let ascii: String = row
                    .iter()
                    .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                    .collect();
                println!("{:08x}  {:<32}  {ascii}", offset + 16 * i as u64, hex::encode(row));
            }
        }
    }
    Ok(())
}

fn build_session(cli: &Cli) -> Result<Session, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    for spec in &cli.loops {
        let (name, path) = spec
            .split_once('=')
            .ok_or_else(|| format!("--loop expects NAME=PATH, got `{spec}'"))?;
        config.loopbacks.push(LoopbackConfig {
            name:       name.to_string(),
            path:       path.to_string(),
            decompress: true,
        });
    }
    if cli.root.is_some() {
        config.root = cli.root.clone();
    }
    Ok(Session::from_config(&config)?)
}

fn file_type(base: FileType, raw: bool) -> FileType {
    if raw { base | FileType::NO_DECOMPRESS } else { base }
}

fn format_time(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}
