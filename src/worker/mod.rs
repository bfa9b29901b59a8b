//! Worker process bridge: one OS process per active job, a line-oriented
//! JSON channel on its stdio, cancellation by termination. A hang, crash or
//! runaway allocation in one transfer cannot touch the orchestrator or the
//! other jobs.

pub mod protocol;
mod run;

pub use self::run::serve;

use std::io;
use std::path::Path;
use std::process::Stdio;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};

use self::protocol::{StartData, WorkerCommand, WorkerReply};

/// Generous per-line cap; progress messages are tiny, this only guards
/// against a corrupted stream.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Events the bridge forwards to the manager loop.
#[derive(Debug)]
pub enum BridgeEvent {
    Reply(WorkerReply),
    /// The process is gone and reaped.
    Exited { job: String, code: Option<i32> },
}

/// Owns one spawned worker process.
pub struct WorkerBridge {
    job_id: String,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerBridge {
    /// Spawns the worker and hands it the start message over stdin. Replies
    /// stream into `tx`; a final [`BridgeEvent::Exited`] always follows,
    /// after the child has been reaped.
    pub async fn spawn(
        program: &Path,
        start: &StartData,
        tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> io::Result<WorkerBridge> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout unavailable"))?;

        let command = WorkerCommand::Start {
            data: Box::new(start.clone()),
        };
        let mut line = serde_json::to_vec(&command).map_err(io::Error::other)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;

        let job_id = start.job.id.clone();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let monitor_job = job_id.clone();
        tokio::spawn(async move {
            // stdin stays open for the child's lifetime; dropping it early
            // would read as an orchestrator exit on the worker side.
            let _stdin = stdin;
            let mut lines = FramedRead::new(
                stdout,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            );
            let mut killed = false;
            loop {
                tokio::select! {
                    _ = &mut kill_rx, if !killed => {
                        killed = true;
                        if let Err(err) = child.start_kill() {
                            log::debug!("worker {} already gone: {}", monitor_job, err);
                        }
                    }
                    item = lines.next() => match item {
                        Some(Ok(line)) => match serde_json::from_str::<WorkerReply>(&line) {
                            Ok(reply) => {
                                let _ = tx.send(BridgeEvent::Reply(reply));
                            }
                            Err(err) => {
                                log::warn!(
                                    "worker {} sent an unreadable message: {}",
                                    monitor_job, err
                                );
                            }
                        },
                        Some(Err(err)) => {
                            log::warn!("worker {} stream error: {}", monitor_job, err);
                            break;
                        }
                        None => break,
                    }
                }
            }
            // Reap unconditionally.
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    log::warn!("failed to reap worker {}: {}", monitor_job, err);
                    None
                }
            };
            let _ = tx.send(BridgeEvent::Exited {
                job: monitor_job,
                code,
            });
        });

        Ok(WorkerBridge {
            job_id,
            kill_tx: Some(kill_tx),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Stop is termination: there is no graceful cancellation below the
    /// process boundary. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(kill) = self.kill_tx.take() {
            log::debug!("terminating worker for job {}", self.job_id);
            let _ = kill.send(());
        }
    }
}
