//! Worker-side entry: reads control messages on stdin, drives one transfer
//! through the engine, writes tagged replies on stdout.

use std::io;

use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio_util::codec::{FramedRead, LinesCodec};

use s3_multipart::{download_file, upload_file, DownloadRequest, UploadRequest};

use crate::job::TransferKind;
use crate::worker::protocol::{StartData, WorkerCommand, WorkerReply};

async fn write_reply(out: &mut Stdout, reply: &WorkerReply) -> io::Result<()> {
    let mut line = serde_json::to_vec(reply).map_err(io::Error::other)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

/// Runs one job to its terminal event, then returns. The orchestrator
/// terminates and reaps this process afterwards regardless.
pub async fn serve() -> io::Result<()> {
    let stdin = tokio::io::stdin();
    let mut commands = FramedRead::new(stdin, LinesCodec::new());
    let mut stdout = tokio::io::stdout();

    // The first message must be start; anything else ends the worker.
    let start: StartData = loop {
        let Some(line) = commands.next().await else {
            return Ok(());
        };
        let line = line.map_err(io::Error::other)?;
        match serde_json::from_str::<WorkerCommand>(&line) {
            Ok(WorkerCommand::Start { data }) => break *data,
            Ok(WorkerCommand::Stop) => return Ok(()),
            Err(err) => {
                log::warn!("ignoring unreadable command: {}", err);
            }
        }
    };

    let job_id = start.job.id.clone();
    if start.options.debug {
        log::info!(
            "job {}: {:?} {}/{} <-> {}",
            job_id,
            start.job.kind,
            start.params.bucket,
            start.params.key,
            start.params.local_path.display()
        );
    }
    write_reply(&mut stdout, &WorkerReply::ready(&job_id)).await?;

    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(err) => {
            let reply = WorkerReply {
                job: job_id,
                key: "error".into(),
                data: None,
                error: Some(serde_json::json!({
                    "message": format!("failed to create HTTP client: {}", err),
                })),
            };
            write_reply(&mut stdout, &reply).await?;
            return Ok(());
        }
    };

    let mut handle = match start.job.kind {
        TransferKind::Upload => upload_file(
            client,
            start.options.s3,
            start.options.tunables,
            UploadRequest {
                bucket: start.params.bucket,
                key: start.params.key,
                file: start.params.local_path,
                upload_id: start.params.upload_id,
                parts: start.params.parts,
            },
        ),
        TransferKind::Download => download_file(
            client,
            start.options.s3,
            start.options.tunables,
            DownloadRequest {
                bucket: start.params.bucket,
                key: start.params.key,
                file: start.params.local_path,
                downloaded_parts: start.params.downloaded_parts,
            },
        ),
    };

    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let terminal = event.is_terminal();
                write_reply(&mut stdout, &WorkerReply::from_event(&job_id, &event)).await?;
                if terminal {
                    break;
                }
            }
            command = commands.next(), if stdin_open => match command {
                Some(Ok(line)) => match serde_json::from_str::<WorkerCommand>(&line) {
                    Ok(WorkerCommand::Stop) => {
                        log::info!("job {} stop requested", job_id);
                        handle.stop();
                    }
                    Ok(WorkerCommand::Start { .. }) => {
                        log::warn!("job {} already started, ignoring second start", job_id);
                    }
                    Err(err) => {
                        log::warn!("ignoring unreadable command: {}", err);
                    }
                },
                Some(Err(err)) => {
                    log::warn!("stdin stream error: {}", err);
                    stdin_open = false;
                }
                None => {
                    // The orchestrator is gone; halt and drain the terminal
                    // event so the transfer winds down cleanly.
                    handle.stop();
                    stdin_open = false;
                }
            }
        }
    }

    stdout.flush().await?;
    Ok(())
}
