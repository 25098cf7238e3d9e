// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: update utility
 *
 * Copyright (c) 2025 Code Construct
 */

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::io;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use argh::FromArgs;

use fota::{
    Agent, BootOutcome, Config, Event, FileSource, PackageHeader, Platform,
    ProgressStore, RootFs, SharedOps, TransferProgress, UbiResume, VersionInfo,
    VersionSource, VerifyKey,
};
use fota_linux::{CommandRunner, FileSettings, FwEnv, LinuxDevices};

type LinuxAgent = Agent<FwEnv, CommandRunner, FileSettings>;

#[derive(FromArgs, Debug)]
#[argh(description = "Firmware over-the-air update utility")]
struct Args {
    #[argh(switch, short = 'd')]
    /// debug logging
    debug: bool,

    #[argh(switch)]
    /// trace logging
    trace: bool,

    /// directory for download state files, default /
    #[argh(option, default = "PathBuf::from(\"/\")")]
    state_dir: PathBuf,

    /// settings store directory, default /var/lib/fota
    #[argh(option, default = "PathBuf::from(\"/var/lib/fota\")")]
    kv_dir: PathBuf,

    /// root filesystem layout (ubi or ext4), detected from the kernel
    /// command line by default
    #[argh(option, from_str_fn(parse_rootfs))]
    rootfs: Option<RootFs>,

    /// hex RSA modulus of the package signing key, replacing the built in
    /// key
    #[argh(option)]
    modulus: Option<String>,

    /// resuming a partly written UBI volume: restart (default) or seek
    #[argh(option, default = "UbiResume::Restart")]
    ubi_resume: UbiResume,

    #[argh(subcommand)]
    command: Command,
}

fn parse_rootfs(s: &str) -> Result<RootFs, String> {
    match s {
        "ubi" => Ok(RootFs::Ubi),
        "ext4" => Ok(RootFs::Ext4),
        _ => Err(format!("unknown rootfs '{s}', expected ubi or ext4")),
    }
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    PkgInfo(PkgInfoCommand),
    Check(CheckCommand),
    Download(DownloadCommand),
    Verify(VerifyCommand),
    Commit(CommitCommand),
    BootCheck(BootCheckCommand),
    State(StateCommand),
    AvailableSize(AvailableSizeCommand),
    Version(VersionCommand),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "pkg-info", description = "Show package contents")]
struct PkgInfoCommand {
    #[argh(positional)]
    file: String,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "check",
    description = "Record an available update"
)]
struct CheckCommand {
    /// package URL
    #[argh(positional)]
    url: String,

    /// version of the package
    #[argh(option)]
    version: String,

    /// changelog text
    #[argh(option, default = "String::new()")]
    changelog: String,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "download",
    description = "Download and verify a package, resuming a previous attempt"
)]
struct DownloadCommand {
    /// package file, or file:// URL. Defaults to the recorded update.
    #[argh(positional)]
    file: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "verify",
    description = "Verify the downloaded package"
)]
struct VerifyCommand {}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "commit",
    description = "Switch to the downloaded package and reboot"
)]
struct CommitCommand {
    /// seconds to wait before rebooting
    #[argh(option, default = "0")]
    delay: u64,

    /// don't reboot
    #[argh(switch)]
    no_reboot: bool,

    /// don't require confirmation
    #[argh(switch, short = 'y')]
    confirm: bool,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "boot-check",
    description = "Confirm or roll back an update after boot"
)]
struct BootCheckCommand {}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "state", description = "Show update state")]
struct StateCommand {}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "available-size",
    description = "Show space available for an image"
)]
struct AvailableSizeCommand {
    /// image name, the root filesystem free space if omitted
    #[argh(positional)]
    image: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "version", description = "Print fotactl version")]
struct VersionCommand {}

/// Version details given on the command line
struct Announced(Option<VersionInfo>);

impl VersionSource for Announced {
    fn latest(&mut self) -> io::Result<VersionInfo> {
        self.0
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no version"))
    }
}

fn duration_str(d: &chrono::Duration) -> String {
    let secs = d.num_seconds();
    if secs < 0 {
        "unknown".to_string()
    } else if secs > 86400 {
        format!("{} days", secs / 86400)
    } else {
        let mut s = secs;
        let h = s / 3600;
        s -= h * 3600;
        let m = s / 60;
        s -= m * 60;
        format!("{:02}:{:02}:{:02}", h, m, s)
    }
}

fn bps_str(bps: f32) -> String {
    const B_PER_MB: f32 = 1_000_000.0;
    #[allow(non_upper_case_globals)]
    const B_PER_kB: f32 = 1_000.0;
    let threshold = 0.8;

    if bps > (B_PER_MB * threshold) {
        format!("{:.2} MB/sec", bps / B_PER_MB)
    } else if bps > (B_PER_kB * threshold) {
        format!("{:.2} kB/sec", bps / B_PER_kB)
    } else {
        format!("{:.0} B/sec", bps)
    }
}

fn print_progress(p: &TransferProgress) {
    println!(
        "{}/{} bytes, {:3}% {}, {} remaining",
        p.current,
        p.total,
        p.percent,
        bps_str(p.bps),
        duration_str(&p.remaining),
    );
}

fn print_events(rx: Receiver<Event>) {
    for ev in rx {
        match ev {
            Event::Version {
                current,
                new,
                changelog,
                ..
            } => {
                println!(
                    "Update available: {} -> {new}",
                    current.as_deref().unwrap_or("unknown")
                );
                if !changelog.is_empty() {
                    println!("{changelog}");
                }
            }
            Event::Progress(p) => print_progress(&p),
            Event::Finished => println!("Download complete and verified"),
            Event::Restart => println!("Switchover committed"),
            Event::Error { code, msg } => println!("Failed ({code}): {msg}"),
        }
    }
}

fn print_header(h: &PackageHeader) {
    println!("Package:");
    println!("  Header version: {}", h.version);
    println!("  Header size:    {}", h.header_size);
    println!("  Checksum:       0x{:08x}", h.checksum);
    println!("  Digest:         {:?}", h.digest);
    println!("  Signature:      {:?}", h.signature_type);
    println!("  MD5:            {}", hex::encode(h.md5sum));
    println!("  Package size:   {}", h.package_size());
    println!("  Images:");
    for (idx, img) in h.images.iter().enumerate() {
        println!(
            "   {:2}: {:16} offset 0x{:08x} size 0x{:08x}",
            idx, img.name, img.offset, img.size
        );
    }
}

fn confirm_commit() -> bool {
    use std::io::Write;
    let mut line = String::new();

    print!("\nSwitch to the new firmware and reboot (y,N)? ");
    let _ = io::stdout().flush();
    if io::stdin().read_line(&mut line).is_err() {
        return false;
    }

    line.trim().eq_ignore_ascii_case("y")
}

fn verify_key(modulus: Option<&str>) -> anyhow::Result<VerifyKey> {
    let key = match modulus {
        Some(m) => {
            let m = hex::decode(m.trim()).context("Bad modulus")?;
            VerifyKey::from_modulus(&m)?
        }
        None => VerifyKey::embedded()?,
    };
    Ok(key)
}

fn config(args: &Args) -> Config {
    let mut c = Config::with_state_dir(&args.state_dir);
    c.ubi_resume = args.ubi_resume;
    c
}

fn open_agent(args: &Args, config: Config) -> anyhow::Result<LinuxAgent> {
    let rootfs = match args.rootfs {
        Some(r) => r,
        None => fota_linux::detect_rootfs().context("Can't detect root filesystem")?,
    };
    let table = fota_linux::discover(rootfs).context("Can't find A/B partitions")?;
    debug!("partitions: {table:?}");

    let settings = FileSettings::open(&args.kv_dir)
        .with_context(|| format!("Can't open settings in {}", args.kv_dir.display()))?;
    let platform = Platform {
        env: FwEnv::default(),
        runner: CommandRunner,
        settings,
    };
    let ops: SharedOps = Arc::new(LinuxDevices::default());
    let key = verify_key(args.modulus.as_deref())?;

    let agent = Agent::new(config, table, ops, platform, key)
        .context("Can't read boot environment")?;
    agent.start()?;
    Ok(agent)
}

// Print events until the agent is dropped
fn with_events<T>(
    agent: LinuxAgent,
    f: impl FnOnce(&LinuxAgent) -> T,
) -> T {
    let rx = agent.subscribe();
    let printer = std::thread::spawn(move || print_events(rx));
    let r = f(&agent);
    drop(agent);
    if printer.join().is_err() {
        warn!("event printer failed");
    }
    r
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let level = if args.trace {
        log::LevelFilter::Trace
    } else if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    match &args.command {
        Command::Version(_) => {
            println!("fotactl version {}", env!("VERSION"));
        }
        Command::PkgInfo(p) => {
            let buf = std::fs::read(&p.file)
                .with_context(|| format!("Can't open package {}", p.file))?;
            let h = PackageHeader::parse(&buf)
                .with_context(|| format!("Can't parse package {}", p.file))?;
            h.validate_layout(Some(buf.len() as u64))
                .context("Bad image layout")?;
            print_header(&h);
        }
        Command::Check(c) => {
            let agent = open_agent(&args, config(&args))?;
            let mut src = Announced(Some(VersionInfo {
                version: c.version.clone(),
                url: c.url.clone(),
                changelog: c.changelog.clone(),
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            }));
            with_events(agent, |a| a.version_check(&mut src))?;
        }
        Command::Download(d) => {
            let agent = open_agent(&args, config(&args))?;
            let mut src = FileSource;
            with_events(agent, |a| match &d.file {
                Some(f) => a.download_url(f, &mut src),
                None => a.download(&mut src),
            })?;
        }
        Command::Verify(_) => {
            let c = config(&args);
            let store = ProgressStore::new(&c.progress_path, &c.header_path);
            let Some(mut p) = store.load()? else {
                bail!("No download recorded");
            };
            if !p.is_complete() {
                bail!("Download of {} incomplete at offset {}", p.url, p.offset);
            }
            let header = store.load_header()?;
            let key = verify_key(args.modulus.as_deref())?;
            fota::verify(&mut p, &header, &key).context("Verification failed")?;
            println!("{}: verified", p.url);
        }
        Command::Commit(c) => {
            let mut cfg = config(&args);
            cfg.reboot = !c.no_reboot;
            let agent = open_agent(&args, cfg)?;
            if !(c.confirm || confirm_commit()) {
                return Ok(());
            }
            let delay = Duration::from_secs(c.delay);
            with_events(agent, |a| a.restart(delay))?;
        }
        Command::BootCheck(_) => {
            let agent = open_agent(&args, config(&args))?;
            match agent.boot_check()? {
                BootOutcome::NoUpdate => println!("No update pending"),
                BootOutcome::Confirmed => println!("Update confirmed"),
                BootOutcome::RolledBack => println!("Update failed, rolled back"),
            }
        }
        Command::State(_) => {
            let c = config(&args);
            let agent = open_agent(&args, c.clone())?;
            println!("State: {:?}", agent.state());
            let store = ProgressStore::new(&c.progress_path, &c.header_path);
            match store.load()? {
                None => println!("No download recorded"),
                Some(p) => {
                    println!("Download: {}", p.url);
                    println!("  Offset: {}/{}", p.offset, p.total_size());
                    for img in &p.images {
                        println!(
                            "  {:16} {:>10}/{:<10} -> {}",
                            img.name,
                            img.written,
                            img.size,
                            img.path.display()
                        );
                    }
                }
            }
        }
        Command::AvailableSize(s) => {
            let agent = open_agent(&args, config(&args))?;
            let size = agent.available_size(s.image.as_deref())?;
            println!("{size}");
        }
    }

    Ok(())
}
