use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tierfs::api::{Client, Request, Response};
use tierfs::config::DEFAULT_SOCKET;
use tierfs::utils::format_size;

#[derive(Parser, Debug)]
#[command(name = "tierctl")]
#[command(about = "load and unload files of a running tierfs mount")]
#[command(version)]
struct Args {
    /// Control socket of the mount
    #[arg(short, long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy files into the tier
    Load { paths: Vec<PathBuf> },
    /// Drop files from the tier, writing back modified ones
    Unload { paths: Vec<PathBuf> },
    /// Show tier usage and cached files
    Status,
}

/// absolute form of `p`, the daemon maps it onto its root
fn absolute(p: &Path) -> std::io::Result<PathBuf> {
    match p.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) if p.is_absolute() => Ok(p.to_path_buf()),
        Err(_) => Ok(std::env::current_dir()?.join(p)),
    }
}

fn print(rsp: &Response) -> bool {
    match rsp {
        Response::Done => true,
        Response::Status(s) => {
            println!(
                "backend {} used {} of {}",
                s.backend,
                format_size(s.used),
                format_size(s.capacity)
            );
            for f in &s.files {
                println!(
                    "{:>10} {:>10} {:>4} {} {}",
                    format_size(f.stat.size),
                    format_size(f.stat.allocated),
                    f.stat.mappings,
                    if f.stat.dirty { "dirty" } else { "clean" },
                    f.path.display()
                );
            }
            true
        }
        Response::Error { errno, reason } => {
            eprintln!("error {}: {}", errno, reason);
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut client = Client::connect(&args.socket).await?;

    let reqs: Vec<Request> = match &args.command {
        Commands::Load { paths } => paths
            .iter()
            .map(|p| absolute(p).map(|path| Request::Load { path }))
            .collect::<std::io::Result<_>>()?,
        Commands::Unload { paths } => paths
            .iter()
            .map(|p| absolute(p).map(|path| Request::Unload { path }))
            .collect::<std::io::Result<_>>()?,
        Commands::Status => vec![Request::Status],
    };

    let mut ok = true;
    for req in &reqs {
        let rsp = client.call(req).await?;
        ok &= print(&rsp);
    }
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
