//! Optional request log.
//!
//! Enabled with `--request-log <FILE>`. When enabled, a logger task is launched and
//! the controller forwards it every [`RequestMetric`] it receives, which is written
//! to the file as one line of JSON through Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html):
//!
//! ```json
//! {"elapsed":1021,"name":"/schedules (heavy rail)","url":"http://localhost/schedules?filter%5Broute%5D=Red","response_time":14,"status_code":200,"success":true,"error":"","user":0}
//! ```

use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::metrics::RequestMetric;
use crate::SwarmError;

/// Optional unbounded sender to the logger task; `None` tells the task to flush and exit.
pub(crate) type RequestLogTx = Option<flume::Sender<Option<RequestMetric>>>;

/// Optional handle of the logger task.
pub(crate) type RequestLogJoinHandle = Option<tokio::task::JoinHandle<Result<(), SwarmError>>>;

/// Open the request log and launch the logger task, if a log file is configured.
pub(crate) async fn setup_request_log(
    request_log: &Option<PathBuf>,
) -> Result<(RequestLogJoinHandle, RequestLogTx), SwarmError> {
    let path = match request_log {
        Some(path) => path.clone(),
        None => return Ok((None, None)),
    };
    let file = File::create(&path).await?;
    info!("writing requests to: {}", path.display());

    let (tx, rx) = flume::unbounded();
    let handle = tokio::spawn(logger_main(file, rx));
    Ok((Some(handle), Some(tx)))
}

async fn logger_main(
    file: File,
    receiver: flume::Receiver<Option<RequestMetric>>,
) -> Result<(), SwarmError> {
    let mut writer = BufWriter::with_capacity(64 * 1024, file);

    while let Ok(message) = receiver.recv_async().await {
        let request = match message {
            Some(request) => request,
            None => break,
        };
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to serialize request metric: {}", e);
                continue;
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    writer.flush().await?;
    debug!("request log flushed");
    Ok(())
}
