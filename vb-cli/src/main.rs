//! Thin control-plane harness exercising `vb_core::DeviceManager`'s entry
//! points end to end, analogous to the teacher pack's `nbdsrv`/`nbdclient`
//! binaries: manual `env::args()` parsing, `anyhow::Result` at the edge,
//! `tracing_subscriber::fmt` installed once in `main`.

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};

use vb_core::{BackingStore, CreateRecord, DecodedFlags, DeviceKind, DeviceManager, ProxyTransport, AUTO_DEVICE_NUMBER};
use vb_geom::{resolve_geometry, DeviceClassHint};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let manager = DeviceManager::new();

    match args[1].as_str() {
        "query-version" => {
            println!("{}", manager.query_version());
        }
        "query-driver" => {
            println!("{:#066b}", manager.query_driver());
        }
        "create" => cmd_create(&manager, &args[2..])?,
        "remove" => cmd_remove(&manager, &args[2..])?,
        "autostart" => cmd_autostart(&manager, &args[2..])?,
        _ => {
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <query-version|query-driver|create|remove|autostart> [args...]");
    eprintln!("  {program} create --file <path> --size <bytes> [--drive-letter <A-Z>]");
    eprintln!("  {program} create --anon --size <bytes> --name <name>");
    eprintln!("  {program} create --proxy-stream <host:port> --name <name> [--size <bytes>]");
    eprintln!("  {program} remove <id> [--force]");
    eprintln!("  {program} autostart <config.toml>");
}

fn cmd_create(manager: &DeviceManager, args: &[String]) -> anyhow::Result<()> {
    let mut file: Option<PathBuf> = None;
    let mut anon = false;
    let mut proxy_stream_addr: Option<String> = None;
    let mut size: Option<u64> = None;
    let mut name = String::new();
    let mut drive_letter: Option<char> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--file" => {
                i += 1;
                file = Some(PathBuf::from(args.get(i).context("--file requires a path")?));
            }
            "--anon" => anon = true,
            "--proxy-stream" => {
                i += 1;
                proxy_stream_addr = Some(args.get(i).context("--proxy-stream requires host:port")?.clone());
            }
            "--size" => {
                i += 1;
                size = Some(args.get(i).context("--size requires a byte count")?.parse()?);
            }
            "--name" => {
                i += 1;
                name = args.get(i).context("--name requires a value")?.clone();
            }
            "--drive-letter" => {
                i += 1;
                drive_letter = args.get(i).context("--drive-letter requires a letter")?.chars().next();
            }
            other => bail!("unrecognized argument: {other}"),
        }
        i += 1;
    }

    let mut proxy_transport = ProxyTransport::Direct;
    let backing = if let Some(addr) = &proxy_stream_addr {
        let stream = std::net::TcpStream::connect(addr)
            .with_context(|| format!("connecting to proxy server at {addr}"))?;
        let cancel = vb_proxy::CancelToken::new();
        let client = vb_proxy::StreamClient::new(stream, cancel.clone());
        proxy_transport = ProxyTransport::Stream;
        BackingStore::open_proxy_stream(client, size, cancel)?
    } else if anon {
        let size = size.context("--anon requires --size")?;
        BackingStore::open_anon(size)?
    } else {
        let path = file.context("create requires --file, --anon, or --proxy-stream")?;
        let handle = OpenOptions::new().read(true).write(true).open(&path)?;
        if name.is_empty() {
            name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        }
        BackingStore::open_file(handle, true)?
    };

    let total_bytes = backing.size() as i64;
    let extension = file.as_ref().and_then(|p| p.extension()).and_then(|e| e.to_str());
    let (geometry, read_only) = resolve_geometry(total_bytes, DeviceClassHint::Auto, extension)
        .map_err(|e| anyhow!("geometry resolution failed: {e}"))?;

    let record = CreateRecord {
        device_number: AUTO_DEVICE_NUMBER,
        geometry,
        image_offset: 0,
        flags: DecodedFlags {
            read_only,
            removable: matches!(geometry.media_kind, vb_geom::MediaKind::Removable),
            modified: false,
            device_kind: DeviceKind::Hd,
            backing_kind: backing.kind(),
            proxy_transport,
        },
        drive_letter,
        name,
    };

    let id = manager.create_device(record, backing)?;
    println!("created device {id}");
    Ok(())
}

fn cmd_remove(manager: &DeviceManager, args: &[String]) -> anyhow::Result<()> {
    let id: u32 = args.first().context("remove requires a device id")?.parse()?;
    let force = args.get(1).map(|a| a == "--force").unwrap_or(false);
    manager.remove_device(id, force)?;
    println!("removed device {id}");
    Ok(())
}

fn cmd_autostart(manager: &DeviceManager, args: &[String]) -> anyhow::Result<()> {
    let path = PathBuf::from(args.first().context("autostart requires a config path")?);
    let config = vb_core::autostart::AutostartConfig::load(&path)?;
    manager.set_disallowed_letters(config.disallowed_letters());

    for entry in &config.devices {
        let handle = OpenOptions::new().read(true).write(true).open(&entry.image_file)?;
        let backing = BackingStore::open_file(handle, true)?;
        let mut decoded = vb_core::device::decode_flags(entry.flags);

        let path = PathBuf::from(&entry.image_file);
        let extension = path.extension().and_then(|e| e.to_str());
        let (geometry, forced_read_only) = resolve_geometry(backing.size() as i64, DeviceClassHint::Auto, extension)
            .map_err(|e| anyhow!("geometry resolution failed for {}: {e}", entry.image_file))?;
        decoded.read_only = decoded.read_only || forced_read_only;

        let record = CreateRecord {
            device_number: AUTO_DEVICE_NUMBER,
            geometry,
            image_offset: entry.offset,
            flags: decoded,
            drive_letter: entry.drive_letter,
            name: entry.image_file.clone(),
        };

        let id = manager.create_device(record, backing)?;
        tracing::info!(device = id, image = %entry.image_file, "autostart device created");
    }

    Ok(())
}
