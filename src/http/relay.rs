//! Backpressured forwarding of git output to HTTP clients.
//!
//! Producers (a `git upload-pack` child, or an upstream HTTP response) are
//! pumped into a bounded channel that backs the response body.  When the
//! channel is full the pump stops reading, so a slow client slows the
//! producer instead of growing memory.  When the client goes away the
//! channel closes, and a child process is killed.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::ServeConfig;
use crate::credentials::redact_text;
use crate::http::pktline;

/// stderr kept per child for error reporting.
const STDERR_CAP: usize = 64 * 1024;

type Chunk = Result<Bytes, io::Error>;

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub chunk_size: usize,
    pub channel_capacity: usize,
    /// Kill the producer and abort the stream at this instant.
    pub deadline: Option<Instant>,
    /// How long a child gets to exit on its own after its output ended.
    pub process_wait_timeout: Duration,
}

impl RelayConfig {
    pub fn from_serve(config: &ServeConfig, deadline: Option<Instant>) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
            deadline,
            process_wait_timeout: Duration::from_secs(config.process_wait_timeout),
        }
    }
}

/// What happened to one relayed response.
#[derive(Debug, Clone, Default)]
pub struct RelayOutcome {
    pub bytes_sent: u64,
    pub client_disconnected: bool,
    pub timed_out: bool,
    /// The producer finished cleanly.
    pub success: bool,
    pub exit_code: Option<i32>,
    /// An `ERR` packet was sent in place of output.
    pub error_reported: bool,
    pub stderr: String,
}

enum PumpEnd {
    Eof,
    Disconnected,
    TimedOut,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Child processes
// ---------------------------------------------------------------------------

/// Request data fed to a child's stdin.
pub enum ChildInput {
    /// Already in memory (decompressed, or inspected before spawning).
    Buffered(Bytes),
    /// Copied from the client chunk by chunk as the child reads it.
    Streamed(Body),
}

impl From<Bytes> for ChildInput {
    fn from(bytes: Bytes) -> Self {
        ChildInput::Buffered(bytes)
    }
}

async fn feed_stdin(mut stdin: ChildStdin, input: ChildInput) -> io::Result<u64> {
    match input {
        ChildInput::Buffered(bytes) => {
            stdin.write_all(&bytes).await?;
            Ok(bytes.len() as u64)
        }
        ChildInput::Streamed(body) => {
            let mut data = body.into_data_stream();
            let mut written = 0u64;
            while let Some(chunk) = data.next().await {
                let chunk = chunk.map_err(io::Error::other)?;
                stdin.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            Ok(written)
        }
    }
}

/// Stream the stdout of `child` (running `service`) to the returned body
/// while feeding it `input`.
///
/// The handle resolves once the child has exited (or was killed) and the
/// body has been completed.
pub fn relay_child(
    mut child: Child,
    service: &'static str,
    input: impl Into<ChildInput>,
    config: RelayConfig,
) -> (Body, JoinHandle<RelayOutcome>) {
    let input = input.into();
    let (tx, rx) = mpsc::channel::<Chunk>(config.channel_capacity);
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let handle = tokio::spawn(async move {
        let writer = tokio::spawn(async move {
            let Some(stdin) = stdin else { return };
            match feed_stdin(stdin, input).await {
                Ok(written) => debug!(service, written, "request fed to git"),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    warn!(service, "git closed stdin before reading the whole request")
                }
                Err(e) => warn!(service, error = %e, "failed to write request to git"),
            }
        });
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let mut outcome = RelayOutcome::default();
        let end = match stdout {
            Some(stdout) => {
                bounded(config.deadline, pump_reader(stdout, &tx, config.chunk_size, &mut outcome))
                    .await
            }
            None => PumpEnd::Failed("child stdout not captured".into()),
        };

        let killed = matches!(end, PumpEnd::Disconnected | PumpEnd::TimedOut);
        if killed {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "git already exited");
            }
        }
        let status = reap(&mut child, config.process_wait_timeout).await;
        writer.abort();
        // Grandchildren may keep stderr open after git itself is gone.
        let mut stderr_task = stderr_task;
        outcome.stderr = match tokio::time::timeout(config.process_wait_timeout, &mut stderr_task).await {
            Ok(text) => text.unwrap_or_default(),
            Err(_) => {
                stderr_task.abort();
                String::new()
            }
        };

        match end {
            PumpEnd::Disconnected => {
                debug!(bytes_sent = outcome.bytes_sent, "client went away; git killed");
                outcome.client_disconnected = true;
                return outcome;
            }
            PumpEnd::TimedOut => {
                warn!(bytes_sent = outcome.bytes_sent, "request deadline passed; git killed");
                outcome.timed_out = true;
                let _ = tx
                    .send(Err(io::Error::new(io::ErrorKind::TimedOut, "request deadline exceeded")))
                    .await;
                return outcome;
            }
            PumpEnd::Failed(reason) => {
                warn!(%reason, "failed reading git output");
                let _ = tx.send(Err(io::Error::other(reason))).await;
                return outcome;
            }
            PumpEnd::Eof => {}
        }

        outcome.exit_code = status.and_then(|s| s.code());
        outcome.success = status.is_some_and(|s| s.success());
        if !outcome.success {
            warn!(
                service,
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr.trim(),
                "git service failed"
            );
            if outcome.bytes_sent == 0 {
                let message = match outcome.stderr.trim() {
                    "" => format!("{service} failed"),
                    text => text.to_string(),
                };
                outcome.error_reported = tx
                    .send(Ok(Bytes::from(pktline::error_packet(&message))))
                    .await
                    .is_ok();
            }
        }
        outcome
    });

    (Body::from_stream(ReceiverStream::new(rx)), handle)
}

/// Result of running a child into a file.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub bytes: u64,
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Run `child` (running `service`) to completion, feeding it `input` and copying
/// its stdout into `sink`.  Nothing is sent to a client.
pub async fn capture_child(
    mut child: Child,
    service: &'static str,
    input: impl Into<ChildInput>,
    mut sink: tokio::fs::File,
    config: RelayConfig,
) -> io::Result<Captured> {
    let input = input.into();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr_task = tokio::spawn(drain_stderr(child.stderr.take()));
    let writer = tokio::spawn(async move {
        let Some(stdin) = stdin else { return };
        if let Err(e) = feed_stdin(stdin, input).await {
            debug!(service, error = %e, "git stopped reading its request");
        }
    });

    let copy = async {
        match stdout {
            Some(mut stdout) => tokio::io::copy(&mut stdout, &mut sink).await,
            None => Err(io::Error::other("child stdout not captured")),
        }
    };
    let copied = match config.deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, copy).await.ok(),
        None => Some(copy.await),
    };

    let timed_out = copied.is_none();
    if timed_out {
        warn!(service, "deadline passed while capturing git output; git killed");
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "git already exited");
        }
    }
    let status = reap(&mut child, config.process_wait_timeout).await;
    writer.abort();
    let mut stderr_task = stderr_task;
    let stderr = match tokio::time::timeout(config.process_wait_timeout, &mut stderr_task).await {
        Ok(text) => text.unwrap_or_default(),
        Err(_) => {
            stderr_task.abort();
            String::new()
        }
    };
    sink.flush().await?;

    let (bytes, copy_failed) = match copied {
        Some(Ok(bytes)) => (bytes, false),
        Some(Err(e)) => {
            warn!(service, error = %e, "failed to capture git output");
            (0, true)
        }
        None => (0, false),
    };
    Ok(Captured {
        bytes,
        success: !timed_out && !copy_failed && status.is_some_and(|s| s.success()),
        timed_out,
        exit_code: status.and_then(|s| s.code()),
        stderr,
    })
}

async fn pump_reader<R>(
    mut reader: R,
    tx: &mpsc::Sender<Chunk>,
    chunk_size: usize,
    outcome: &mut RelayOutcome,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut chunk = BytesMut::zeroed(chunk_size);
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            _ = tx.closed() => return PumpEnd::Disconnected,
        };
        let n = match read {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => n,
            Err(e) => return PumpEnd::Failed(e.to_string()),
        };
        chunk.truncate(n);
        if tx.send(Ok(chunk.freeze())).await.is_err() {
            return PumpEnd::Disconnected;
        }
        outcome.bytes_sent += n as u64;
    }
}

async fn bounded<F>(deadline: Option<Instant>, pump: F) -> PumpEnd
where
    F: std::future::Future<Output = PumpEnd>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, pump)
            .await
            .unwrap_or(PumpEnd::TimedOut),
        None => pump.await,
    }
}

/// Wait for `child` to exit, killing it after `grace`.
async fn reap(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait on git");
            None
        }
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "git did not exit in time; killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill git");
            }
            None
        }
    }
}

async fn drain_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_CAP.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    redact_text(&String::from_utf8_lossy(&kept))
}

// ---------------------------------------------------------------------------
// Byte streams
// ---------------------------------------------------------------------------

/// Forward an upstream byte stream (e.g. a proxied push response) through the
/// same bounded channel.
pub fn relay_stream<S, E>(stream: S, config: RelayConfig) -> (Body, JoinHandle<RelayOutcome>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Chunk>(config.channel_capacity);

    let handle = tokio::spawn(async move {
        let mut outcome = RelayOutcome::default();
        let end = bounded(config.deadline, pump_stream(stream, &tx, config.chunk_size, &mut outcome)).await;
        match end {
            PumpEnd::Eof => outcome.success = true,
            PumpEnd::Disconnected => outcome.client_disconnected = true,
            PumpEnd::TimedOut => {
                outcome.timed_out = true;
                let _ = tx
                    .send(Err(io::Error::new(io::ErrorKind::TimedOut, "request deadline exceeded")))
                    .await;
            }
            PumpEnd::Failed(reason) => {
                warn!(%reason, "upstream stream failed");
                let _ = tx.send(Err(io::Error::other(reason))).await;
            }
        }
        outcome
    });

    (Body::from_stream(ReceiverStream::new(rx)), handle)
}

async fn pump_stream<S, E>(
    mut stream: S,
    tx: &mpsc::Sender<Chunk>,
    chunk_size: usize,
    outcome: &mut RelayOutcome,
) -> PumpEnd
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = tx.closed() => return PumpEnd::Disconnected,
        };
        let mut bytes = match next {
            None => return PumpEnd::Eof,
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return PumpEnd::Failed(e.to_string()),
        };
        while !bytes.is_empty() {
            let chunk = bytes.split_to(bytes.len().min(chunk_size));
            let n = chunk.len() as u64;
            if tx.send(Ok(chunk)).await.is_err() {
                return PumpEnd::Disconnected;
            }
            outcome.bytes_sent += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    const UPLOAD_PACK: &str = "git-upload-pack";

    fn config(chunk_size: usize, capacity: usize) -> RelayConfig {
        RelayConfig {
            chunk_size,
            channel_capacity: capacity,
            deadline: None,
            process_wait_timeout: Duration::from_secs(2),
        }
    }

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    async fn collect(body: Body) -> Vec<u8> {
        axum::body::to_bytes(body, usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn streams_output_and_feeds_input() {
        let (body, handle) = relay_child(sh("cat; echo done"), UPLOAD_PACK, Bytes::from("hello\n"), config(4096, 4));

        assert_eq!(collect(body).await, b"hello\ndone\n");
        let outcome = handle.await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.bytes_sent, 11);
        assert!(!outcome.client_disconnected);
    }

    #[tokio::test]
    async fn chunks_never_exceed_chunk_size() {
        let (body, handle) = relay_child(sh("head -c 100000 /dev/zero"), UPLOAD_PACK, Bytes::new(), config(1000, 2));

        let mut stream = body.into_data_stream();
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= 1000);
            total += chunk.len();
        }
        assert_eq!(total, 100_000);
        assert_eq!(handle.await.unwrap().bytes_sent, 100_000);
    }

    #[tokio::test]
    async fn failure_before_output_becomes_err_packet() {
        let (body, handle) =
            relay_child(sh("echo 'not our ref' >&2; exit 3"), UPLOAD_PACK, Bytes::new(), config(4096, 4));

        assert_eq!(collect(body).await, pktline::error_packet("not our ref"));
        let outcome = handle.await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error_reported);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn failure_after_output_is_not_reported_inline() {
        let (body, handle) =
            relay_child(sh("echo partial; echo boom >&2; exit 1"), UPLOAD_PACK, Bytes::new(), config(4096, 4));

        assert_eq!(collect(body).await, b"partial\n");
        let outcome = handle.await.unwrap();
        assert!(!outcome.error_reported);
        assert_eq!(outcome.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn client_disconnect_kills_the_child() {
        let child = sh("yes");
        let pid = child.id().unwrap();
        let (body, handle) = relay_child(child, UPLOAD_PACK, Bytes::new(), config(1024, 2));

        let mut stream = body.into_data_stream();
        stream.next().await.unwrap().unwrap();
        drop(stream);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay did not finish after disconnect")
            .unwrap();
        assert!(outcome.client_disconnected);
        assert_eq!(outcome.exit_code, None);
        assert!(!crate::coordination::node::process_alive(pid));
    }

    #[tokio::test]
    async fn deadline_aborts_the_stream() {
        let mut cfg = config(1024, 2);
        cfg.deadline = Some(Instant::now() + Duration::from_millis(200));
        let (body, handle) = relay_child(sh("sleep 30"), UPLOAD_PACK, Bytes::new(), cfg);

        assert!(axum::body::to_bytes(body, usize::MAX).await.is_err());
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn early_stdin_close_is_not_fatal() {
        let input = Bytes::from(vec![b'x'; 4 * 1024 * 1024]);
        let (body, handle) = relay_child(sh("echo ok"), UPLOAD_PACK, input, config(4096, 4));

        assert_eq!(collect(body).await, b"ok\n");
        assert!(handle.await.unwrap().success);
    }

    #[tokio::test]
    async fn silent_failure_names_the_service() {
        let (body, handle) = relay_child(sh("exit 1"), "git-receive-pack", Bytes::new(), config(4096, 4));

        assert_eq!(collect(body).await, pktline::error_packet("git-receive-pack failed"));
        assert!(handle.await.unwrap().error_reported);
    }

    #[tokio::test]
    async fn streamed_input_reaches_the_child() {
        let chunks: Vec<Result<Bytes, io::Error>> =
            (0..64).map(|i| Ok(Bytes::from(vec![i as u8; 64 * 1024]))).collect();
        let input = ChildInput::Streamed(Body::from_stream(futures::stream::iter(chunks)));
        let (body, handle) = relay_child(sh("wc -c | tr -d ' '"), "git-receive-pack", input, config(4096, 2));

        assert_eq!(collect(body).await, format!("{}\n", 64 * 64 * 1024).into_bytes());
        assert!(handle.await.unwrap().success);
    }

    #[tokio::test]
    async fn capture_writes_output_to_the_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out");
        let sink = tokio::fs::File::create(&path).await.unwrap();

        let captured = capture_child(sh("cat; echo 0000"), UPLOAD_PACK, Bytes::from("pack:"), sink, config(4096, 2))
            .await
            .unwrap();

        assert!(captured.success);
        assert_eq!(captured.bytes, 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"pack:0000\n");
    }

    #[tokio::test]
    async fn capture_reports_failure_and_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = tokio::fs::File::create(tmp.path().join("out")).await.unwrap();

        let captured = capture_child(sh("echo 'not our ref' >&2; exit 128"), UPLOAD_PACK, Bytes::new(), sink, config(4096, 2))
            .await
            .unwrap();

        assert!(!captured.success);
        assert_eq!(captured.exit_code, Some(128));
        assert_eq!(captured.stderr.trim(), "not our ref");
    }

    #[tokio::test]
    async fn byte_stream_is_rechunked() {
        let parts: Vec<Result<Bytes, io::Error>> =
            vec![Ok(Bytes::from(vec![1u8; 2500])), Ok(Bytes::from_static(b"tail"))];
        let (body, handle) = relay_stream(futures::stream::iter(parts), config(1000, 2));

        let mut stream = body.into_data_stream();
        let mut sizes = Vec::new();
        while let Some(chunk) = stream.next().await {
            sizes.push(chunk.unwrap().len());
        }
        assert_eq!(sizes, vec![1000, 1000, 500, 4]);
        let outcome = handle.await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.bytes_sent, 2504);
    }

    #[tokio::test]
    async fn byte_stream_error_aborts_body() {
        let parts: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("connection reset")),
        ];
        let (body, handle) = relay_stream(futures::stream::iter(parts), config(1000, 2));

        assert!(axum::body::to_bytes(body, usize::MAX).await.is_err());
        assert!(!handle.await.unwrap().success);
    }
}
