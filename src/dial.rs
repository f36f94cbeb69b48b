//! The dial capability and the single-attempt probe built on it.
use crate::types::{DialFailure, ErrorClass, ScanResult, ScanTask};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    Connected(Duration),
    Failed {
        failure: DialFailure,
        elapsed: Duration,
    },
}

/// Opaque connect capability. Implementations must release whatever they
/// acquired before returning, on every path.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> DialOutcome;
}

/// Plain TCP connect via tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> DialOutcome {
        let start = Instant::now();
        let attempt = async {
            // A name that does not resolve is unreachable.
            let addrs: Vec<SocketAddr> = lookup_host((host, port))
                .await
                .map_err(|e| DialFailure {
                    class: ErrorClass::Unreachable,
                    message: format!("failed to resolve {host}: {e}"),
                })?
                .collect();
            if addrs.is_empty() {
                return Err(DialFailure {
                    class: ErrorClass::Unreachable,
                    message: format!("no addresses for {host}"),
                });
            }
            let stream = TcpStream::connect(&addrs[..])
                .await
                .map_err(|e| DialFailure {
                    class: classify_io_error(&e),
                    message: e.to_string(),
                })?;
            // Closing is just dropping the stream.
            drop(stream);
            Ok::<(), DialFailure>(())
        };
        match time::timeout(timeout, attempt).await {
            Ok(Ok(())) => DialOutcome::Connected(start.elapsed()),
            Ok(Err(failure)) => DialOutcome::Failed {
                failure,
                elapsed: start.elapsed(),
            },
            Err(_) => DialOutcome::Failed {
                failure: DialFailure {
                    class: ErrorClass::Timeout,
                    message: format!("connect timed out after {timeout:?}"),
                },
                elapsed: start.elapsed(),
            },
        }
    }
}

/// Map an OS connect error onto the coarse classes filters work with.
pub fn classify_io_error(e: &io::Error) -> ErrorClass {
    if is_descriptor_exhaustion(e) {
        return ErrorClass::ResourceExhausted;
    }
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => ErrorClass::Refused,
        io::ErrorKind::TimedOut => ErrorClass::Timeout,
        io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::NetworkDown => ErrorClass::Unreachable,
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::OutOfMemory => {
            ErrorClass::ResourceExhausted
        }
        _ => ErrorClass::Other,
    }
}

#[cfg(unix)]
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    // EMFILE (per process) and ENFILE (system wide) share these values on
    // Linux and the BSDs.
    matches!(e.raw_os_error(), Some(23) | Some(24))
        || e.to_string().to_ascii_lowercase().contains("too many open files")
}

#[cfg(windows)]
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    // WSAEMFILE / WSAENOBUFS
    matches!(e.raw_os_error(), Some(10024) | Some(10055))
}

#[cfg(not(any(unix, windows)))]
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    e.to_string().to_ascii_lowercase().contains("too many open files")
}

/// Probe one task exactly once. Never retries.
pub async fn probe<D: Dialer + ?Sized>(dialer: &D, task: ScanTask, timeout: Duration) -> ScanResult {
    match dialer.dial(&task.host, task.port, timeout).await {
        DialOutcome::Connected(elapsed) => {
            debug!(task = %task, ?elapsed, "open");
            ScanResult::open(task, elapsed)
        }
        DialOutcome::Failed { failure, elapsed } => {
            debug!(task = %task, class = %failure.class, error = %failure.message, "closed");
            ScanResult::failed(task, failure, elapsed)
        }
    }
}

/// Probe that gives up once cancellation has fired and `grace` has passed
/// without the dial completing. Returns `None` when abandoned.
pub async fn probe_until_cancelled<D: Dialer + ?Sized>(
    dialer: &D,
    task: ScanTask,
    timeout: Duration,
    cancel: &CancellationToken,
    grace: Duration,
) -> Option<ScanResult> {
    let port = task.port;
    tokio::select! {
        biased;
        res = probe(dialer, task, timeout) => Some(res),
        _ = async {
            cancel.cancelled().await;
            time::sleep(grace).await;
        } => {
            debug!(port, "probe abandoned after cancellation");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn classifies_common_errors() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_io_error(&refused), ErrorClass::Refused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify_io_error(&timed_out), ErrorClass::Timeout);
        let other = io::Error::other("weird");
        assert_eq!(classify_io_error(&other), ErrorClass::Other);
    }

    #[cfg(unix)]
    #[test]
    fn classifies_descriptor_exhaustion() {
        let emfile = io::Error::from_raw_os_error(24);
        assert_eq!(classify_io_error(&emfile), ErrorClass::ResourceExhausted);
    }

    #[tokio::test]
    async fn open_port_is_reported_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let res = probe(&TcpDialer, ScanTask::new("127.0.0.1", port), Duration::from_secs(2)).await;
        assert!(res.open);
        assert!(res.error.is_none());
    }

    #[tokio::test]
    async fn closed_port_is_reported_refused() {
        // Bind then drop to obtain a port with nothing listening.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let res = probe(&TcpDialer, ScanTask::new("127.0.0.1", port), Duration::from_secs(2)).await;
        assert!(!res.open);
        assert_eq!(res.error_class(), Some(ErrorClass::Refused));
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        // `.invalid` never resolves; a resolver that cannot be reached at all
        // may run into the attempt timeout instead.
        let outcome = TcpDialer
            .dial("portflow-test.invalid", 80, Duration::from_secs(5))
            .await;
        match outcome {
            DialOutcome::Failed { failure, .. } => assert!(
                matches!(failure.class, ErrorClass::Unreachable | ErrorClass::Timeout),
                "{failure:?}"
            ),
            DialOutcome::Connected(_) => panic!("an .invalid name must not connect"),
        }
    }

    #[test]
    fn classification_ignores_message_text() {
        let e = io::Error::other("failed to lookup address information");
        assert_eq!(classify_io_error(&e), ErrorClass::Other);
    }

    struct Hang;

    #[async_trait]
    impl Dialer for Hang {
        async fn dial(&self, _host: &str, _port: u16, _timeout: Duration) -> DialOutcome {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancelled_probe_is_abandoned_after_grace() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = probe_until_cancelled(
            &Hang,
            ScanTask::new("h", 1),
            Duration::from_secs(60),
            &cancel,
            Duration::from_millis(10),
        )
        .await;
        assert!(res.is_none());
    }
}
