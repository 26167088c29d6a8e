use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{ArgAction, Parser, Subcommand};
use log::{error, info, LevelFilter};
use logfs::{FormatOptions, LfsResult, MmapDevice, Owner, Volume, DEFAULT_CAPACITY};

#[derive(Parser)]
#[command(name = "logfs", version, about = "Log-structured filesystem in a single disk image")]
struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create (or overwrite) a disk image holding an empty filesystem.
    Mkfs {
        disk: PathBuf,
        /// Image size in bytes.
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        size: u64,
        /// Permission bits of the root directory, in octal.
        #[arg(long, default_value = "755", value_parser = parse_octal)]
        root_mode: u32,
    },
    /// Serve a disk image through FUSE until it is unmounted.
    Mount {
        disk: PathBuf,
        mountpoint: PathBuf,
        #[arg(long)]
        allow_other: bool,
        #[arg(long)]
        auto_unmount: bool,
        #[arg(long)]
        read_only: bool,
    },
    /// Print the superblock and every record version as JSON lines.
    Dump { disk: PathBuf },
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn mkfs(disk: PathBuf, size: u64, root_mode: u32) -> LfsResult<()> {
    let device = MmapDevice::create(&disk, size)?;
    let options = FormatOptions {
        root_perm: root_mode,
        owner: current_owner(),
    };
    let volume = Volume::format(device, &options)?;
    volume.unmount()?;
    info!("formatted {} ({} bytes)", disk.display(), size);
    Ok(())
}

#[cfg(feature = "fuse")]
fn mount(
    disk: PathBuf,
    mountpoint: PathBuf,
    allow_other: bool,
    auto_unmount: bool,
    read_only: bool,
) -> LfsResult<()> {
    let volume = Volume::mount(MmapDevice::open(&disk)?)?;
    let options = logfs::fuse::MountOptions {
        fsname: disk.display().to_string(),
        allow_other,
        auto_unmount,
        read_only,
    };
    logfs::fuse::mount(volume, mountpoint, &options)
}

#[cfg(not(feature = "fuse"))]
fn mount(disk: PathBuf, _: PathBuf, _: bool, _: bool, _: bool) -> LfsResult<()> {
    error!(
        "cannot mount {}: logfs was built without the `fuse` feature",
        disk.display()
    );
    Err(io::Error::new(io::ErrorKind::Unsupported, "FUSE support not compiled in").into())
}

fn dump(disk: PathBuf) -> LfsResult<()> {
    let volume = Volume::mount(MmapDevice::open(&disk)?)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let superblock = serde_json::to_string(&volume.superblock()).map_err(io::Error::from)?;
    writeln!(out, "{}", superblock)?;
    for entry in volume.dump()? {
        let line = serde_json::to_string(&entry).map_err(io::Error::from)?;
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

#[cfg(unix)]
fn current_owner() -> Owner {
    use std::os::unix::fs::MetadataExt;
    // owner of $HOME stands in for the invoking user
    std::env::var_os("HOME")
        .and_then(|home| std::fs::metadata(home).ok())
        .map(|m| Owner {
            uid: m.uid(),
            gid: m.gid(),
        })
        .unwrap_or_default()
}

#[cfg(not(unix))]
fn current_owner() -> Owner {
    Owner::default()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let result = match cli.command {
        Command::Mkfs {
            disk,
            size,
            root_mode,
        } => mkfs(disk, size, root_mode),
        Command::Mount {
            disk,
            mountpoint,
            allow_other,
            auto_unmount,
            read_only,
        } => mount(disk, mountpoint, allow_other, auto_unmount, read_only),
        Command::Dump { disk } => dump(disk),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("logfs: {}", e);
            ExitCode::FAILURE
        }
    }
}
