use ::http::header::USER_AGENT;
use ::http::{Request, Uri};
use bytes::Bytes;
use http_body_util::Empty;
use tracing::info;

use super::{ProbeError, ProbeReport};
use crate::transport::{Clock, Dial, SystemClock, TcpDialer, TimedResponse, TimedTransport, TransportError};

const PROBE_USER_AGENT: &str = concat!("http-latency-probe/", env!("CARGO_PKG_VERSION"));

/// Issues single GET requests against a fixed target.
pub struct HttpProber<D = TcpDialer, C = SystemClock> {
    target: Uri,
    transport: TimedTransport<D, C>,
}

impl<D: Dial, C: Clock> HttpProber<D, C> {
    pub fn new(target: Uri, transport: TimedTransport<D, C>) -> Self {
        Self { target, transport }
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    pub async fn probe(&self) -> Result<ProbeReport, ProbeError> {
        let target = self.target.to_string();
        let request = Request::get(self.target.clone())
            .header(USER_AGENT, PROBE_USER_AGENT)
            .body(Empty::<Bytes>::new())
            .map_err(|_| {
                ProbeError::new(
                    target.clone(),
                    TransportError::InvalidTarget {
                        target: target.clone(),
                        reason: "could not build request",
                    },
                )
            })?;

        let TimedResponse { response, timings } = self
            .transport
            .round_trip(request)
            .await
            .map_err(|e| ProbeError::new(target.clone(), e))?;

        // Only the head is measured; the body is dropped unread so a slow or
        // endless body cannot hold the probe open.
        let status = response.status();
        drop(response);

        info!("Response Time: {:?}", timings.total());
        info!("Connection Time: {:?}", timings.connection());
        info!("Request duration: {:?}", timings.processing());

        Ok(ProbeReport {
            target,
            status,
            timings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DEFAULT_TLS_HANDSHAKE_TIMEOUT, Phase};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn prober_for(uri: &str, connect_timeout: Duration) -> HttpProber {
        let dialer = TcpDialer {
            connect_timeout,
            ..TcpDialer::default()
        };
        let transport = TimedTransport::new(dialer, DEFAULT_TLS_HANDSHAKE_TIMEOUT).unwrap();
        HttpProber::new(uri.parse().unwrap(), transport)
    }

    #[tokio::test]
    async fn test_probe_reports_status_and_durations() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let prober = prober_for(&format!("http://{}/", addr), Duration::from_secs(5));
        let report = prober.probe().await.unwrap();

        assert_eq!(report.status, 204);
        assert!(report.total() >= report.connection());
        assert_eq!(report.processing(), report.total() - report.connection());
    }

    #[tokio::test]
    async fn test_stalled_body_does_not_block_report() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let prober = prober_for(&format!("http://{}/", addr), Duration::from_secs(5));
        let report = tokio::time::timeout(Duration::from_secs(3), prober.probe())
            .await
            .expect("report should not wait for the body")
            .unwrap();

        assert_eq!(report.status, 200);
        assert!(report.total() >= report.connection());
    }

    #[tokio::test]
    async fn test_probe_failure_carries_context() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("http://{}/", addr);
        let prober = prober_for(&url, Duration::from_secs(2));
        let err = prober.probe().await.unwrap_err();

        assert_eq!(err.target, url);
        assert_eq!(err.phase, Phase::Dial);
        assert!(err.to_string().contains("during dial"));
    }
}
