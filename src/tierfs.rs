use clap::Parser;
use tierfs::api::server;
use tierfs::config::MountArgs;
use tierfs::context::Context;
use tierfs::fs::Fs;
use tierfs::logger::Logger;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = MountArgs::parse();
    let log_path = args.log_file.to_string_lossy().to_string();
    if log_path == "-" {
        Logger::init().add_console();
    } else {
        Logger::init().add_file(&log_path, true);
    }
    log::set_max_level(args.log_level()?);
    println!("log write to {} level {}", log_path, args.log_level);

    let ctx = match Context::from_args(&args) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("create context fail, error {e}");
            eprintln!("tierfs: {e}");
            std::process::exit(1);
        }
    };

    for p in &args.preload {
        match ctx.resolve(p).and_then(|p| ctx.backend().load(&p)) {
            Ok(_) => log::info!("preload {:?} ok", p),
            Err(e) => log::warn!("preload {:?} fail, error {}", p, e),
        }
    }

    let listener = server::bind(&args.socket)?;
    tokio::spawn(server::serve(ctx.clone(), listener));
    log::info!("control socket {:?}", args.socket);

    let session = Fs::new(ctx.clone()).mount(&args.mountpoint, args.allow_other)?;
    log::info!("mounted {:?} on {:?}", args.root, args.mountpoint);

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sig_int.recv() => log::info!("got SIGINT"),
        _ = sig_term.recv() => log::info!("got SIGTERM"),
    }

    // stop serving before the cached files go away
    drop(session);
    tokio::task::spawn_blocking(move || ctx.shutdown()).await?;
    if let Err(e) = std::fs::remove_file(&args.socket) {
        log::warn!("remove socket {:?} fail, error {}", args.socket, e);
    }
    Ok(())
}
