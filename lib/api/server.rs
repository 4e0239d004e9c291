use super::message::{read_message, write_message, FileStatus, Request, Response, Status};
use crate::context::Context;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};

/// Run one request against the backend, blocking work belongs on the blocking pool
pub fn handle(ctx: &Context, req: Request) -> Response {
    let r = match req {
        Request::Load { path } => ctx.resolve(&path).and_then(|p| ctx.backend().load(&p)).map(|_| Response::Done),
        Request::Unload { path } => ctx
            .resolve(&path)
            .and_then(|p| ctx.backend().unload(&p))
            .map(|_| Response::Done),
        Request::Status => Ok(Response::Status(status(ctx))),
    };
    r.unwrap_or_else(|e| {
        log::warn!("control request fail, error {}", e);
        Response::from(&e)
    })
}

fn status(ctx: &Context) -> Status {
    let b = ctx.backend();
    let mut files: Vec<FileStatus> = b
        .iter()
        .map(|(path, f)| FileStatus {
            path,
            stat: f.stat(),
        })
        .collect();
    files.sort_by(|x, y| x.path.cmp(&y.path));
    Status {
        backend: b.name().to_string(),
        capacity: b.capacity(),
        used: b.used(),
        files,
    }
}

pub fn bind(socket: &Path) -> Result<UnixListener> {
    if socket.exists() {
        // left over from an unclean exit
        std::fs::remove_file(socket)?;
    }
    Ok(UnixListener::bind(socket)?)
}

pub async fn serve(ctx: Arc<Context>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(ctx, stream).await {
                        log::warn!("control client error {}", e);
                    }
                });
            }
            Err(e) => {
                log::error!("control accept error {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_client(ctx: Arc<Context>, mut stream: UnixStream) -> Result<()> {
    while let Some(req) = read_message::<_, Request>(&mut stream).await? {
        log::info!("control request {:?}", req);
        let c = ctx.clone();
        let rsp = match tokio::task::spawn_blocking(move || handle(&c, req)).await {
            Ok(rsp) => rsp,
            Err(e) => {
                log::error!("control worker fail, error {}", e);
                Response::Error {
                    errno: libc::EIO,
                    reason: e.to_string(),
                }
            }
        };
        write_message(&mut stream, &rsp).await?;
    }
    Ok(())
}
