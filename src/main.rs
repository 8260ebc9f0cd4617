//! Tapwire CLI

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use tapwire::config::Config;
use tapwire::proxy::ProxyServer;
use tapwire::recording::DirStore;

fn usage() -> ! {
    eprintln!("Tapwire v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: tapwire <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  run <config>        Start the recording proxy");
    eprintln!("  check <config>      Validate a configuration file");
    eprintln!("  show <record-dir>   List stored records");
    process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (Some(command), Some(target)) = (args.get(1), args.get(2)) else {
        usage();
    };
    let target = PathBuf::from(target);

    match command.as_str() {
        "run" => run(&target).await,
        "check" => {
            Config::from_file(&target)?;
            println!("{}: ok", target.display());
            Ok(())
        }
        "show" => show(&target),
        _ => {
            eprintln!("Unknown command: {command}");
            usage();
        }
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let addr = SocketAddr::from(([127, 0, 0, 1], config.listen_port));
    let server = ProxyServer::from_config(&config)?;
    server.run(addr).await?;
    Ok(())
}

fn show(dir: &Path) -> anyhow::Result<()> {
    if !dir.is_dir() {
        bail!("Directory not found: {}", dir.display());
    }

    let records = DirStore::open(dir)?.load_all()?;
    println!("Record directory: {}", dir.display());
    println!("{} records", records.len());
    println!();

    for record in &records {
        let status = record
            .response()
            .map_or_else(|| "---".to_string(), |response| response.status.to_string());
        let duration = record
            .duration_ms()
            .map_or_else(|| "-".to_string(), |ms| format!("{ms:.1}ms"));
        let size = record.response_body().map_or(0, <[u8]>::len);

        println!(
            "{}  {:<7} {} {}  {}B  {}  {}",
            record.id(),
            record.method(),
            status,
            record.url(),
            size,
            duration,
            record.outcome()
        );
    }

    Ok(())
}
