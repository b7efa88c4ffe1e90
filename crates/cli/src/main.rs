//! Operator tooling for the objcache core.
//!
//! This binary exposes the debug surface of the cache core:
//! 1. **storage list:** Configure stevedores from `-s` style specs and
//!    list them.
//! 2. **silo:** Create, dump, check or sync a persistent silo.
//! 3. **health:** Probe a backend address and render the probe window.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use objcache_core::Config;
use objcache_core::backend::probe::{ProbeSpec, ProbeTarget, ProbeWindow};
use objcache_core::backend::{Backend, BackendConfig};
use objcache_core::storage::StorageRegistry;
use objcache_core::storage::persistent::SiloStevedore;

#[derive(Parser, Debug)]
#[command(
    name = "objcache",
    author,
    version,
    about = "Object-cache core debug tooling",
    long_about = "Inspect and maintain objcache storage and backends.\n\nExamples:\n  objcache storage list -s malloc,256M -s cache=file,/tmp/cache.bin,1G\n  objcache silo create /var/cache/silo.bin --size 1G\n  objcache silo dump /var/cache/silo.bin --size 1G\n  objcache health 127.0.0.1:8080 --polls 8"
)]
struct Cli {
    /// Configuration document (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Storage stevedore operations.
    Storage {
        #[command(subcommand)]
        op: StorageOp,
    },

    /// Persistent silo maintenance.
    Silo {
        #[command(subcommand)]
        op: SiloOp,
    },

    /// Probe a backend and render its health window.
    Health {
        /// Backend address (host:port).
        addr: SocketAddr,

        /// Number of polls to run.
        #[arg(long, default_value_t = 8)]
        polls: u32,

        /// Probe URL.
        #[arg(long, default_value = "/")]
        url: String,
    },
}

#[derive(Subcommand, Debug)]
enum StorageOp {
    /// Configure stevedores and list them (storage.list).
    List {
        /// Storage specifications, `[name=]strategy[,arg]*`.
        #[arg(short = 's', required = true)]
        spec: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SiloOp {
    /// Create (or re-format) a silo file.
    Create {
        /// Silo file path.
        path: PathBuf,
        /// Silo size.
        #[arg(long, default_value = "64M")]
        size: String,
    },
    /// Print segment layout and population.
    Dump {
        /// Silo file path.
        path: PathBuf,
        /// Silo size.
        #[arg(long, default_value = "64M")]
        size: String,
    },
    /// Close and reopen the current segment.
    Sync {
        /// Silo file path.
        path: PathBuf,
        /// Silo size.
        #[arg(long, default_value = "64M")]
        size: String,
    },
}

fn parse_size(s: &str) -> u64 {
    let (num, mult) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1u64 << 10),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1u64 << 20),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    match num.trim().parse::<u64>() {
        Ok(v) => v * mult,
        Err(_) => {
            eprintln!("bad size: {s}");
            process::exit(2);
        }
    }
}

fn load_config(path: Option<&PathBuf>) {
    if let Some(path) = path {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("cannot read {}: {e}", path.display());
                process::exit(2);
            }
        };
        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("bad configuration: {e}");
                process::exit(2);
            }
        };
        let _ = cfg.install();
    }
}

fn open_silo(path: &PathBuf, size: &str) -> std::sync::Arc<SiloStevedore> {
    match SiloStevedore::create("silo", path, parse_size(size)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot open silo {}: {e}", path.display());
            process::exit(1);
        }
    }
}

fn wait_loaded(stv: &SiloStevedore) {
    while !stv.silo().is_loaded() {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

fn cmd_storage_list(specs: &[String]) {
    let registry = StorageRegistry::global();
    for spec in specs {
        if let Err(e) = registry.configure(spec) {
            eprintln!("{spec}: {e}");
            process::exit(2);
        }
    }
    println!("Storage devices:");
    for (ident, name) in registry.list() {
        println!("\tstorage.{ident} = {name}");
    }
    StorageRegistry::global().close_all();
}

fn cmd_health(addr: SocketAddr, polls: u32, url: &str) {
    let backend = Backend::new(BackendConfig {
        vcl_name: "probe".into(),
        hosthdr: addr.to_string(),
        ipv4: addr.is_ipv4().then_some(addr),
        ipv6: addr.is_ipv6().then_some(addr),
        saintmode_threshold: u32::MAX,
        ..BackendConfig::default()
    });
    let spec = ProbeSpec {
        url: Some(url.to_string()),
        interval: 0.2,
        initial: 0,
        ..ProbeSpec::default()
    };
    let target = ProbeTarget::new(backend.clone(), spec);
    for _ in 0..polls {
        target.poll_once();
    }

    let w = target.window();
    println!(
        "Backend {} is {}",
        backend.vcl_name(),
        if backend.is_healthy() { "Healthy" } else { "Sick" }
    );
    println!(
        "Current states  good: {:2} threshold: {:2} window: {:2}",
        w.good,
        target.spec().threshold,
        target.spec().window
    );
    println!("Average responsetime of good probes: {:.6}", w.avg);
    println!("Oldest                                                    Newest");
    println!("================================================================");
    for (map, ch, label) in [
        (w.good_ipv4, '4', "Good IPv4"),
        (w.good_ipv6, '6', "Good IPv6"),
        (w.err_xmit, 'x', "Error Xmit"),
        (w.good_xmit, 'X', "Good Xmit"),
        (w.err_recv, 'r', "Error Recv"),
        (w.good_recv, 'R', "Good Recv"),
        (w.happy, 'H', "Happy"),
    ] {
        if map != 0 || label == "Happy" {
            println!("{} {label}", ProbeWindow::render(map, ch));
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    load_config(cli.config.as_ref());

    match cli.command {
        Commands::Storage { op } => match op {
            StorageOp::List { spec } => cmd_storage_list(&spec),
        },
        Commands::Silo { op } => match op {
            SiloOp::Create { path, size } => {
                let stv = open_silo(&path, &size);
                wait_loaded(&stv);
                println!("created silo {}", path.display());
                stv.silo().sync_current();
                objcache_core::Stevedore::close(&*stv, true);
                objcache_core::Stevedore::close(&*stv, false);
            }
            SiloOp::Dump { path, size } => {
                let stv = open_silo(&path, &size);
                wait_loaded(&stv);
                print!("{}", stv.silo().report());
                objcache_core::Stevedore::close(&*stv, true);
                objcache_core::Stevedore::close(&*stv, false);
            }
            SiloOp::Sync { path, size } => {
                let stv = open_silo(&path, &size);
                wait_loaded(&stv);
                stv.silo().sync_current();
                print!("{}", stv.silo().report());
                objcache_core::Stevedore::close(&*stv, true);
                objcache_core::Stevedore::close(&*stv, false);
            }
        },
        Commands::Health { addr, polls, url } => cmd_health(addr, polls, &url),
    }
}
