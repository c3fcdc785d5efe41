//! Concurrent dispatch of one operation over a host set.
//!
//! Every host runs in its own task with a private output buffer. Buffers are
//! written to the caller's sink in host order as soon as every earlier host
//! has finished, so the combined output never interleaves.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::host::{Host, HostSet};
use crate::transport::{Operation, OutputSink, RemoteShell};

/// Outcome of an operation on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// Finished successfully.
    Succeeded,
    /// Failed with the given message.
    Failed(String),
    /// Stopped because another host failed.
    Cancelled,
}

/// Result for one host of a dispatch.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Host address.
    pub host: String,
    /// How the operation ended.
    pub status: CommandStatus,
    /// Bytes of output the host produced.
    pub output_len: usize,
}

/// Per-host results of a dispatch, in host order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One entry per host.
    pub results: Vec<CommandResult>,
}

impl BatchReport {
    /// Hosts that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|s| *s == CommandStatus::Succeeded)
    }

    /// Hosts that failed on their own.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, CommandStatus::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&CommandStatus) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.status)).count()
    }
}

/// Runs operations on many hosts at once.
pub struct RemoteCommandDispatcher {
    shell: Arc<dyn RemoteShell>,
}

impl RemoteCommandDispatcher {
    /// Create a dispatcher over `shell`.
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    /// Run `operation` on every host of `hosts`, writing output to `sink`.
    ///
    /// A single host streams straight into `sink`. With several hosts the
    /// first failure cancels the hosts still running; everything already
    /// produced is still written in host order before the failure is
    /// returned.
    ///
    /// # Errors
    ///
    /// - The host's own error when only one host was involved or none succeeded.
    /// - [`RemoteError::PartialBatchFailure`] when some hosts succeeded.
    /// - [`RemoteError::Cancelled`] when `cancel` fires.
    pub async fn run<W>(
        &self,
        hosts: &HostSet,
        operation: &Operation,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> RemoteResult<BatchReport>
    where
        W: AsyncWrite + Send + Unpin + ?Sized,
    {
        info!(
            operation = operation.name(),
            hosts = hosts.len(),
            "dispatching remote operation"
        );

        let report = match hosts.len() {
            0 => BatchReport::default(),
            1 => self.run_single(hosts, operation, sink, cancel).await?,
            _ => self.run_batch(hosts, operation, sink, cancel).await?,
        };

        info!(
            operation = operation.name(),
            succeeded = report.succeeded(),
            "remote operation finished"
        );
        Ok(report)
    }

    async fn run_single<W>(
        &self,
        hosts: &HostSet,
        operation: &Operation,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> RemoteResult<BatchReport>
    where
        W: AsyncWrite + Send + Unpin + ?Sized,
    {
        let Some(host) = hosts.get(0) else {
            return Ok(BatchReport::default());
        };
        let mut counter = CountingWriter::new(sink);
        run_on_host(self.shell.as_ref(), host, operation, &mut counter, cancel).await?;

        Ok(BatchReport {
            results: vec![CommandResult {
                host: host.address.clone(),
                status: CommandStatus::Succeeded,
                output_len: counter.written,
            }],
        })
    }

    async fn run_batch<W>(
        &self,
        hosts: &HostSet,
        operation: &Operation,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> RemoteResult<BatchReport>
    where
        W: AsyncWrite + Send + Unpin + ?Sized,
    {
        let hosts_token = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (index, host) in hosts.iter().enumerate() {
            let shell = Arc::clone(&self.shell);
            let host = host.clone();
            let operation = operation.for_host_in_batch(&host);
            let token = hosts_token.clone();

            tasks.spawn(async move {
                let mut buffer = Vec::new();
                let result =
                    run_on_host(shell.as_ref(), &host, &operation, &mut buffer, &token).await;
                (index, buffer, result)
            });
        }

        let mut finished: Vec<Option<(Vec<u8>, RemoteResult<()>)>> =
            hosts.iter().map(|_| None).collect();
        let mut flushed = 0;
        let mut failing = false;

        loop {
            let joined = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!(flushed, "dispatch cancelled, aborting remaining hosts");
                    tasks.abort_all();
                    return Err(RemoteError::Cancelled);
                }

                joined = tasks.join_next() => joined,
            };

            match joined {
                Some(Ok((index, buffer, result))) => {
                    if let Err(e) = &result {
                        if !failing && !matches!(e, RemoteError::Cancelled) {
                            warn!(
                                host = e.host().unwrap_or_default(),
                                error = %e,
                                "host failed, cancelling the rest"
                            );
                            failing = true;
                            hosts_token.cancel();
                        }
                    }
                    if let Some(slot) = finished.get_mut(index) {
                        *slot = Some((buffer, result));
                    }
                }
                Some(Err(join_err)) => {
                    if !join_err.is_cancelled() {
                        warn!(error = %join_err, "dispatch task panicked");
                        failing = true;
                        hosts_token.cancel();
                    }
                }
                None => break,
            }

            flushed = flush_ready(hosts, &finished, flushed, sink).await?;
        }

        // Only a panicked host leaves a gap; write whatever follows it.
        for (index, slot) in finished.iter().enumerate().skip(flushed) {
            if let Some((buffer, _)) = slot {
                let address = hosts.get(index).map_or("", |h| h.address.as_str());
                sink.write_all(buffer)
                    .await
                    .map_err(|e| RemoteError::io(address, e))?;
            }
        }
        sink.flush().await.map_err(|e| RemoteError::io("local", e))?;

        collect(hosts, finished)
    }
}

/// Write every finished buffer from `from` up to the first unfinished host.
async fn flush_ready<W>(
    hosts: &HostSet,
    finished: &[Option<(Vec<u8>, RemoteResult<()>)>],
    from: usize,
    sink: &mut W,
) -> RemoteResult<usize>
where
    W: AsyncWrite + Send + Unpin + ?Sized,
{
    let mut next = from;
    while let Some(Some((buffer, _))) = finished.get(next) {
        let address = hosts.get(next).map_or("", |h| h.address.as_str());
        sink.write_all(buffer)
            .await
            .map_err(|e| RemoteError::io(address, e))?;
        next += 1;
    }
    if next > from {
        sink.flush().await.map_err(|e| RemoteError::io("local", e))?;
    }
    Ok(next)
}

/// Turn per-host outcomes into a report, or the batch's failure.
fn collect(
    hosts: &HostSet,
    finished: Vec<Option<(Vec<u8>, RemoteResult<()>)>>,
) -> RemoteResult<BatchReport> {
    let mut results = Vec::with_capacity(finished.len());
    let mut first_failure = None;

    for (host, outcome) in hosts.iter().zip(finished) {
        let (output_len, result) = match outcome {
            Some((buffer, result)) => (buffer.len(), result),
            None => (
                0,
                Err(RemoteError::transport(&host.address, "dispatch task panicked")),
            ),
        };
        let status = match result {
            Ok(()) => CommandStatus::Succeeded,
            Err(RemoteError::Cancelled) => CommandStatus::Cancelled,
            Err(e) => {
                let status = CommandStatus::Failed(e.to_string());
                first_failure.get_or_insert(e);
                status
            }
        };
        results.push(CommandResult {
            host: host.address.clone(),
            status,
            output_len,
        });
    }

    let report = BatchReport { results };
    let Some(first) = first_failure else {
        return Ok(report);
    };

    let succeeded = report.succeeded();
    if succeeded == 0 {
        return Err(first);
    }
    Err(RemoteError::PartialBatchFailure {
        failed: report.failed(),
        succeeded,
        first: Box::new(first),
    })
}

/// Open a session, run the operation and always close the session.
async fn run_on_host(
    shell: &dyn RemoteShell,
    host: &Host,
    operation: &Operation,
    output: OutputSink<'_>,
    cancel: &CancellationToken,
) -> RemoteResult<()> {
    let mut session = tokio::select! {
        session = shell.connect(host) => session?,
        () = cancel.cancelled() => return Err(RemoteError::Cancelled),
    };
    debug!(host = %host, operation = operation.name(), "session open");

    let result = operation.run(session.as_mut(), output, cancel).await;

    if let Err(e) = session.close().await {
        warn!(host = %host, error = %e, "failed to close session");
    }
    result
}

/// Forwards writes to the inner sink and counts the bytes.
struct CountingWriter<'a, W: ?Sized> {
    inner: &'a mut W,
    written: usize,
}

impl<'a, W: ?Sized> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: AsyncWrite + Unpin + ?Sized> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut *self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.written += n;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
