use anyhow::{anyhow, bail, Context};
use bootforge_core::{
    BlockIo, ChannelSink, Device, DeviceInspector, DeviceKind, DeviceManager, FatOptions,
    LogSink, PartitionFormatter, PartitionTableKind, Pipeline, ProgressEvent, ProvisionOptions,
};
use bootforge_formatters::fat::{BootSector, PlanRequest};
use bootforge_formatters::{builtin_registry, list_available_formatters, FatFormatter};
use bootforge_platform::{LinuxBackend, LinuxInspector, PlatformDeviceManager};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "bootforge")]
#[command(about = "Create bootable USB drives and FAT images", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TableArg {
    Mbr,
    Gpt,
}

#[derive(Subcommand)]
enum Commands {
    /// List drives
    List {
        #[arg(long)]
        json: bool,
    },
    /// List available formatters
    Formats,
    /// Show the FAT layout a volume of SIZE would get (e.g. 1440K, 64M, 8G)
    Plan {
        size: String,
        #[arg(long, default_value_t = 512)]
        sector_size: u32,
        #[arg(long)]
        fat_bits: Option<u8>,
        #[arg(long)]
        cluster_sectors: Option<u8>,
        #[arg(long)]
        no_align: bool,
        #[arg(long)]
        json: bool,
    },
    /// Format a partition or image file as FAT, without partitioning
    Format {
        path: PathBuf,
        #[arg(short, long)]
        label: Option<String>,
        #[arg(long)]
        fat_bits: Option<u8>,
        #[arg(long)]
        cluster_sectors: Option<u8>,
        /// Scan for bad sectors before writing
        #[arg(long)]
        check: bool,
        /// Same volume id and timestamp on every run
        #[arg(long)]
        invariant: bool,
        #[arg(short, long)]
        yes: bool,
    },
    /// Show the boot sector of an existing FAT volume
    Info {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Partition, format and copy an image onto a drive
    Provision {
        device: PathBuf,
        #[arg(short, long)]
        image: Option<PathBuf>,
        #[arg(long, value_enum)]
        table: Option<TableArg>,
        /// Zero the whole drive first
        #[arg(long)]
        full: bool,
        #[arg(short, long)]
        label: Option<String>,
        /// JSON file with provisioning options; flags override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        yes: bool,
    },
}

/// Byte count with an optional binary K/M/G/T suffix. Fractions are
/// allowed with a suffix, so `1.44M` works.
fn parse_size(text: &str) -> anyhow::Result<u64> {
    let text = text.trim();
    let (number, multiplier) = match text.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&text[..text.len() - 1], 1u64 << 10),
        Some('M') => (&text[..text.len() - 1], 1 << 20),
        Some('G') => (&text[..text.len() - 1], 1 << 30),
        Some('T') => (&text[..text.len() - 1], 1 << 40),
        _ => (text, 1),
    };
    if multiplier == 1 {
        return number.parse().with_context(|| format!("invalid size '{}'", text));
    }
    let value: f64 = number.parse().with_context(|| format!("invalid size '{}'", text))?;
    if value < 0.0 {
        bail!("size cannot be negative");
    }
    Ok((value * multiplier as f64) as u64)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn confirm(what: &str) -> anyhow::Result<bool> {
    println!("\nWARNING: This will ERASE ALL DATA on {}!", what);
    println!("Type 'yes' to continue: ");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

/// The enumerated disk `path` lives on, if any.
async fn owning_disk(manager: &PlatformDeviceManager, path: &Path) -> anyhow::Result<Option<Device>> {
    let path = path.to_string_lossy();
    let devices = manager.enumerate_devices().await?;
    Ok(devices
        .into_iter()
        .find(|d| bootforge_platform::linux::mounts::is_same_disk(&path, &d.id)))
}

async fn ensure_safe(manager: &PlatformDeviceManager, path: &Path) -> anyhow::Result<()> {
    if let Some(disk) = owning_disk(manager, path).await? {
        if disk.is_system {
            bail!("{} is a system drive, refusing to touch it", disk.id);
        }
        if !manager.is_safe_to_format(&disk).await? {
            bail!(
                "{} is in use (mounted at {:?} or held by another device), unmount it first",
                disk.id,
                disk.mount_points
            );
        }
    }
    Ok(())
}

async fn list(json: bool) -> anyhow::Result<()> {
    let manager = PlatformDeviceManager::new();
    let devices = manager.enumerate_devices().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }
    println!("Available devices:\n");
    for device in devices {
        println!("Device: {}", device.name);
        println!("  Path: {}", device.id);
        println!("  Size: {}", human_size(device.size));
        println!("  Type: {:?}", device.device_type);
        println!("  Removable: {}", if device.is_removable { "Yes" } else { "No" });
        println!("  System: {}", if device.is_system { "Yes (PROTECTED)" } else { "No" });
        if !device.mount_points.is_empty() {
            println!("  Mounted at: {:?}", device.mount_points);
        }
        println!();
    }
    Ok(())
}

fn plan(
    size: &str,
    sector_size: u32,
    fat_bits: Option<u8>,
    cluster_sectors: Option<u8>,
    no_align: bool,
    json: bool,
) -> anyhow::Result<()> {
    let size_bytes = parse_size(size)?;
    let request = PlanRequest {
        fat_bits,
        sectors_per_cluster: cluster_sectors,
        align: !no_align,
        ..PlanRequest::new(size_bytes, sector_size)
    };
    let layout = request.plan()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }
    println!("FAT{} layout for {} ({} bytes)", layout.fat_bits(), human_size(size_bytes), size_bytes);
    println!("  Sector size:          {}", layout.sector_size);
    println!("  Total sectors:        {}", layout.total_sectors);
    println!("  Sectors per cluster:  {} ({} bytes)", layout.sectors_per_cluster, layout.bytes_per_cluster());
    println!("  Clusters:             {}", layout.cluster_count);
    println!("  Reserved sectors:     {}", layout.reserved_sectors);
    println!("  FATs:                 {} x {} sectors", layout.num_fats, layout.fat_length_sectors);
    println!("  Root entries:         {}", layout.root_dir_entries);
    println!("  Data starts at:       sector {}", layout.data_start_sector());
    println!("  Media descriptor:     0x{:02X}", layout.media_descriptor);
    println!("  Geometry:             {} heads, {} sectors/track", layout.heads, layout.sectors_per_track);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn format_volume(
    path: &Path,
    label: Option<String>,
    fat_bits: Option<u8>,
    cluster_sectors: Option<u8>,
    check: bool,
    invariant: bool,
    yes: bool,
) -> anyhow::Result<()> {
    let inspector = LinuxInspector::new();
    let info = inspector.inspect_device(path)?;
    if !info.is_usable() {
        bail!("{} is neither an image file nor a block device", path.display());
    }
    if info.kind == DeviceKind::BlockDevice {
        ensure_safe(&PlatformDeviceManager::new(), path).await?;
    }

    let options = FatOptions {
        label,
        fat_bits,
        sectors_per_cluster: cluster_sectors,
        check_bad_sectors: check,
        invariant,
        verify_after_format: true,
        ..FatOptions::default()
    };
    let layout = FatFormatter::plan_for(&info, &options)?;
    println!(
        "{}: FAT{}, {} clusters of {} bytes",
        path.display(),
        layout.fat_bits(),
        layout.cluster_count,
        layout.bytes_per_cluster()
    );
    if !yes && !confirm(&path.display().to_string())? {
        println!("Format cancelled.");
        return Ok(());
    }

    let path = path.to_path_buf();
    let summary = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let summary = FatFormatter::new().format(&mut device, &info, &options, &LogSink)?;
        device.sync_device()?;
        Ok(summary)
    })
    .await??;

    println!("Format completed successfully!");
    println!("  Volume id: {:04X}-{:04X}", summary.volume_id >> 16, summary.volume_id & 0xFFFF);
    if summary.bad_sectors > 0 {
        println!("  Bad sectors: {}", summary.bad_sectors);
    }
    for warning in &summary.warnings {
        println!("  Warning: {}", warning);
    }
    Ok(())
}

fn show_info(path: &Path, json: bool) -> anyhow::Result<()> {
    let mut sector = [0u8; 512];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut sector))
        .with_context(|| format!("cannot read the boot sector of {}", path.display()))?;
    let boot = BootSector::parse(&sector)?;
    let layout = boot.layout()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }

    let volume = boot.extended.volume();
    println!("{}", path.display());
    println!("  OEM name:        {}", String::from_utf8_lossy(&boot.oem_name).trim_end());
    println!("  Type:            FAT{}{}", layout.fat_bits(), if boot.atari { " (Atari)" } else { "" });
    if volume.extended_signature {
        println!("  Label:           {}", String::from_utf8_lossy(&volume.label).trim_end());
        println!("  Volume id:       {:04X}-{:04X}", volume.volume_id >> 16, volume.volume_id & 0xFFFF);
    }
    println!("  Size:            {}", human_size(layout.total_sectors as u64 * layout.sector_size as u64));
    println!("  Clusters:        {} x {} bytes", layout.cluster_count, layout.bytes_per_cluster());
    println!("  FATs:            {} x {} sectors", layout.num_fats, layout.fat_length_sectors);
    println!("  Hidden sectors:  {}", layout.hidden_sectors);
    Ok(())
}

fn print_event(event: ProgressEvent) {
    match event {
        ProgressEvent::Progress(percent) => {
            print!("\r  {:3}%", percent);
            let _ = io::stdout().flush();
            if percent == 100 {
                println!();
            }
        }
        ProgressEvent::Status(text) => println!("{}", text),
        ProgressEvent::Log(text) => println!("  {}", text),
    }
}

#[allow(clippy::too_many_arguments)]
async fn provision(
    device: PathBuf,
    image: Option<PathBuf>,
    table: Option<TableArg>,
    full: bool,
    label: Option<String>,
    config: Option<PathBuf>,
    yes: bool,
) -> anyhow::Result<()> {
    let mut options = match &config {
        Some(path) => ProvisionOptions::from_json_file(path)
            .with_context(|| format!("cannot load {}", path.display()))?,
        None => ProvisionOptions::default(),
    };
    if let Some(image) = image {
        options.source_image = image;
    }
    if let Some(table) = table {
        options.partition_table = match table {
            TableArg::Mbr => PartitionTableKind::Mbr,
            TableArg::Gpt => PartitionTableKind::Gpt,
        };
    }
    if full {
        options.quick_format = false;
    }
    if label.is_some() {
        options.fat.label = label;
    }
    if options.source_image.as_os_str().is_empty() {
        bail!("no source image given (use --image or the config file)");
    }
    debug!("Provision options: {:?}", options);

    let manager = PlatformDeviceManager::new();
    let disk = manager
        .get_device_by_id(&device.to_string_lossy())
        .await?
        .ok_or_else(|| anyhow!("{} is not a whole disk known to the system", device.display()))?;
    ensure_safe(&manager, &device).await?;

    println!("Target device: {}", disk.name);
    println!("  Size: {}", human_size(disk.size));
    println!("  Image: {}", options.source_image.display());
    if !yes && !confirm(&disk.name)? {
        println!("Provisioning cancelled.");
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(Arc::new(builtin_registry()), Arc::new(ChannelSink::new(tx)));
    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            cancel.cancel();
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(event);
        }
    });

    let report = tokio::task::spawn_blocking(move || {
        let mut backend = LinuxBackend::new();
        pipeline.run(&mut backend, &device, &options)
    })
    .await?;
    // The pipeline and its sink are gone, so the printer drains and stops
    printer.await?;

    for (handle, reason) in &report.cleanup.failures {
        eprintln!("Cleanup: could not release {:?}: {}", handle, reason);
    }
    match report.error {
        None => {
            info!("Provisioned {}", report.target.display());
            println!("Provisioning of {} finished.", report.target.display());
            Ok(())
        }
        Some(e) => {
            let step = report.failed_step.map(|s| s.label()).unwrap_or("Provisioning");
            Err(anyhow!("{} failed ({}): {}", step, e.kind(), e))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List { json } => list(json).await?,
        Commands::Formats => {
            let registry = builtin_registry();
            println!("Available formatters:\n");
            for kind in list_available_formatters(&registry) {
                if let Some(formatter) = registry.get_formatter(kind) {
                    println!("  {} ({:?}, mounted as {})", formatter.name(), kind, kind.mount_type());
                }
            }
        }
        Commands::Plan {
            size,
            sector_size,
            fat_bits,
            cluster_sectors,
            no_align,
            json,
        } => plan(&size, sector_size, fat_bits, cluster_sectors, no_align, json)?,
        Commands::Format {
            path,
            label,
            fat_bits,
            cluster_sectors,
            check,
            invariant,
            yes,
        } => format_volume(&path, label, fat_bits, cluster_sectors, check, invariant, yes).await?,
        Commands::Info { path, json } => show_info(&path, json)?,
        Commands::Provision {
            device,
            image,
            table,
            full,
            label,
            config,
            yes,
        } => provision(device, image, table, full, label, config, yes).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_binary_suffixes() {
        assert_eq!(parse_size("1474560").unwrap(), 1_474_560);
        assert_eq!(parse_size("1440K").unwrap(), 1_474_560);
        assert_eq!(parse_size("64m").unwrap(), 64 << 20);
        assert_eq!(parse_size("8G").unwrap(), 8 << 30);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("-1G").is_err());
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512.00 B");
        assert_eq!(human_size(1_474_560), "1.41 MiB");
    }

    #[test]
    fn cli_parses_provision_flags() {
        let cli = Cli::try_parse_from([
            "bootforge", "-vv", "provision", "/dev/sdb", "--image", "live.iso", "--table", "gpt", "--full", "--yes",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Provision { device, table, full, yes, .. } => {
                assert_eq!(device, PathBuf::from("/dev/sdb"));
                assert!(matches!(table, Some(TableArg::Gpt)));
                assert!(full && yes);
            }
            _ => panic!("expected provision"),
        }
    }
}
