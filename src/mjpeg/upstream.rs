use crate::error::ProxyError;
use crate::mjpeg::parser::MjpegParser;
use crate::mjpeg::proxy::ProxyShared;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Upstream is treated as dead when no frame boundary arrives for this long
pub const STALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Literal served by a DroidCam upstream that is already serving a client
pub const BUSY_MARKER: &str = "DroidCam is Busy";

/// Reconnect delay: 2 s per attempt, capped at 10 s, unbounded attempts
pub fn backoff_delay(attempt: u32) -> Duration {
    let step = attempt.clamp(1, 5) as u64;
    Duration::from_secs((2 * step).min(10))
}

/// Drive the upstream connection for one proxy until cancelled.
///
/// Every exit from `connect_and_stream` is a transient error: the loop
/// reconnects forever with capped backoff. A successful connection resets
/// the attempt counter.
pub(crate) async fn run(shared: Arc<ProxyShared>, cancel: CancellationToken) {
    let client = reqwest::Client::new();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let error = match connect_and_stream(&client, &shared, &cancel, &mut attempt).await {
            Ok(()) => break, // cancelled mid-stream
            Err(e) => e,
        };
        shared.mark_disconnected(&error);

        attempt += 1;
        let delay = backoff_delay(attempt);
        debug!(
            source = %shared.source.id,
            attempt,
            "Reconnecting upstream in {:?}",
            delay
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!(source = %shared.source.id, "Upstream task stopped");
}

async fn connect_and_stream(
    client: &reqwest::Client,
    shared: &Arc<ProxyShared>,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> Result<(), ProxyError> {
    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        r = client.get(&shared.source.url).send() => r?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::UpstreamStatus {
            status: status.as_u16(),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("text/html") {
        // A DroidCam already serving another client answers 200 with an HTML
        // busy page instead of a stream
        let body = response.text().await.unwrap_or_default();
        if body.contains(BUSY_MARKER) {
            return Err(ProxyError::UpstreamBusy);
        }
        return Err(ProxyError::UpstreamContentType { content_type });
    }

    if !content_type.contains("multipart/x-mixed-replace") && !content_type.contains("image/jpeg")
    {
        return Err(ProxyError::UpstreamContentType { content_type });
    }

    *attempt = 0;
    shared.mark_connected();

    let mut parser = MjpegParser::default();
    let mut stream = response.bytes_stream();
    let mut last_boundary = Instant::now();

    loop {
        let Some(remaining) = STALL_TIMEOUT.checked_sub(last_boundary.elapsed()) else {
            return Err(ProxyError::UpstreamStalled {
                timeout: STALL_TIMEOUT,
            });
        };

        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(remaining, stream.next()) => match read {
                Err(_) => {
                    return Err(ProxyError::UpstreamStalled {
                        timeout: STALL_TIMEOUT,
                    })
                }
                Ok(None) => return Err(ProxyError::UpstreamEnded),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(chunk))) => chunk,
            },
        };

        trace!(
            source = %shared.source.id,
            "Upstream chunk: {} bytes",
            chunk.len()
        );

        let mut emitted = 0u32;
        parser.feed(&chunk, |jpeg| {
            shared.handle_frame(jpeg);
            emitted += 1;
        });
        shared
            .parser_overflows
            .store(parser.overflows(), Ordering::Relaxed);

        if emitted > 0 {
            last_boundary = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::mjpeg::MjpegProxy;
    use crate::pool::FrameBufferPool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_schedule() {
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| backoff_delay(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 6, 8, 10, 10, 10, 10]);
    }

    #[test]
    fn test_backoff_never_exceeds_cap() {
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(10));
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
    }

    fn jpeg(tag: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, tag, 0x00, tag, 0xFF, 0xD9]
    }

    fn source(url: String) -> SourceConfig {
        SourceConfig {
            id: "coop".to_string(),
            name: "Coop".to_string(),
            url,
            is_default: true,
            fps: 30,
        }
    }

    /// Minimal MJPEG upstream: serves the given frames over multipart, then
    /// holds the connection open
    async fn spawn_mjpeg_stub(frames: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;

            let head = "HTTP/1.1 200 OK\r\n\
                        Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                        Connection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();

            for frame in frames {
                socket
                    .write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")
                    .await
                    .unwrap();
                socket.write_all(&frame).await.unwrap();
                socket.write_all(b"\r\n").await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        format!("http://{}/video", addr)
    }

    /// Upstream that answers every request with an HTML busy page
    async fn spawn_busy_stub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let body = "<html>DroidCam is Busy</html>";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        format!("http://{}/video", addr)
    }

    #[tokio::test]
    async fn test_stub_frames_round_trip_byte_for_byte() {
        let sent: Vec<Vec<u8>> = (0..10).map(jpeg).collect();
        let url = spawn_mjpeg_stub(sent.clone()).await;

        let cancel = CancellationToken::new();
        let (proxy, _samples) = MjpegProxy::new(
            source(url),
            Arc::new(FrameBufferPool::with_capacity(32, 1024)),
            5,
            16,
            cancel.clone(),
        );
        let mut tap = proxy.frame_events();
        proxy.connect();

        let mut received = Vec::new();
        for _ in 0..10 {
            let frame = tokio::time::timeout(Duration::from_secs(5), tap.recv())
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            received.push(frame.data().to_vec());
        }

        assert_eq!(received, sent);
        assert!(proxy.is_connected());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_viewer_observes_increasing_sequences() {
        let sent: Vec<Vec<u8>> = (0..10).map(jpeg).collect();
        let url = spawn_mjpeg_stub(sent).await;

        let cancel = CancellationToken::new();
        let (proxy, _samples) = MjpegProxy::new(
            source(url),
            Arc::new(FrameBufferPool::with_capacity(32, 1024)),
            5,
            16,
            cancel.clone(),
        );
        let mut conn = proxy.add_viewer();
        proxy.connect();

        let mut sequences = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(500), conn.rx.recv()).await
        {
            sequences.push(frame.sequence());
            if sequences.len() == 10 {
                break;
            }
        }

        assert!(!sequences.is_empty());
        for pair in sequences.windows(2) {
            assert!(pair[0] < pair[1], "reordered: {:?}", sequences);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_busy_upstream_emits_no_frames() {
        let url = spawn_busy_stub().await;

        let cancel = CancellationToken::new();
        let (proxy, _samples) = MjpegProxy::new(
            source(url),
            Arc::new(FrameBufferPool::with_capacity(8, 1024)),
            5,
            16,
            cancel.clone(),
        );
        proxy.connect();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!proxy.is_connected());
        assert_eq!(proxy.stats().frame_count, 0);
        cancel.cancel();
    }
}
