use std::time::{Duration, Instant};

use bdown::{
    download::ChunkDownloader,
    event::{DownloadEvent, EventSender},
    BdownError, ErrorKind, HttpClient,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc::UnboundedReceiver,
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bdown=debug")
        .with_test_writer()
        .try_init();
}

/// Answer one request with `head` followed by `body`, then close the connection.
async fn serve_raw(head: String, body: Vec<u8>) -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&body).await;
        let _ = socket.shutdown().await;
    });
    Ok(format!("http://{address}/stream.m4s"))
}

fn drain(mut rx: UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn downloader() -> ChunkDownloader {
    ChunkDownloader::new(HttpClient::default())
}

#[tokio::test]
async fn test_download_reports_progress() -> anyhow::Result<()> {
    init_test_tracing();
    const SIZE: usize = 10 * 1024 * 1024;

    let server = MockServer::start().await;
    let body: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/v.m4s"))
        .and(header("referer", "https://www.bilibili.com"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let destination = dir.path().join("nested").join("t_video.m4s");
    let (events, rx) = EventSender::channel();
    let path = downloader()
        .download(
            &format!("{}/v.m4s", server.uri()),
            &destination,
            &events,
            &CancellationToken::new(),
        )
        .await?;

    assert_eq!(path, destination);
    assert_eq!(tokio::fs::read(&destination).await?, body);

    let events = drain(rx);
    assert_eq!(
        events.first(),
        Some(&DownloadEvent::Started {
            total_bytes: Some(SIZE as u64),
            label: "t_video.m4s".to_string(),
        })
    );

    let progress: Vec<(u64, Option<u64>)> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Progress {
                bytes_read,
                total_bytes,
                speed_kbps,
            } => {
                assert!(*speed_kbps >= 0.0);
                Some((*bytes_read, *total_bytes))
            }
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    assert!(progress
        .iter()
        .all(|(read, total)| *total == Some(SIZE as u64) && *read <= SIZE as u64));
    assert_eq!(progress.last().unwrap().0, SIZE as u64);

    // nothing follows the terminal event
    assert_eq!(
        events.last(),
        Some(&DownloadEvent::Completed {
            label: "t_video.m4s".to_string(),
            path: destination,
        })
    );
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_download_http_error() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.m4s"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let (events, rx) = EventSender::channel();
    let err = downloader()
        .download(
            &format!("{}/missing.m4s", server.uri()),
            &dir.path().join("missing.m4s"),
            &events,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BdownError::HttpError(status) if status.as_u16() == 404));
    let events = drain(rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        DownloadEvent::Failed { kind: ErrorKind::Transfer, message } if message.contains("404")
    ));
    Ok(())
}

#[tokio::test]
async fn test_download_empty_body() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty.m4s"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let err = downloader()
        .download(
            &format!("{}/empty.m4s", server.uri()),
            &dir.path().join("empty.m4s"),
            &EventSender::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BdownError::EmptyBody));
    assert_eq!(err.kind(), ErrorKind::Transfer);
    Ok(())
}

#[tokio::test]
async fn test_download_custom_referer() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r.m4s"))
        .and(header("referer", "https://example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 100]))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    downloader()
        .with_referer("https://example.com")
        .download(
            &format!("{}/r.m4s", server.uri()),
            &dir.path().join("r.m4s"),
            &EventSender::noop(),
            &CancellationToken::new(),
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_download_cancelled_while_waiting() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.m4s"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        }
    });

    let (events, rx) = EventSender::channel();
    let started = Instant::now();
    let err = downloader()
        .download(
            &format!("{}/slow.m4s", server.uri()),
            &dir.path().join("slow.m4s"),
            &events,
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.is_cancelled());
    assert!(matches!(
        drain(rx).as_slice(),
        [DownloadEvent::Failed {
            kind: ErrorKind::Cancelled,
            ..
        }]
    ));
    Ok(())
}

#[tokio::test]
async fn test_download_unknown_length() -> anyhow::Result<()> {
    init_test_tracing();
    let body: Vec<u8> = (0..50_000).map(|i| (i % 13) as u8).collect();
    let url = serve_raw(
        "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_string(),
        body.clone(),
    )
    .await?;

    let dir = tempfile::tempdir()?;
    let destination = dir.path().join("u_audio.m4s");
    let (events, rx) = EventSender::channel();
    downloader()
        .download(&url, &destination, &events, &CancellationToken::new())
        .await?;
    assert_eq!(tokio::fs::read(&destination).await?, body);

    let events = drain(rx);
    assert_eq!(
        events.first(),
        Some(&DownloadEvent::Started {
            total_bytes: None,
            label: "u_audio.m4s".to_string(),
        })
    );
    let last_progress = events
        .iter()
        .rev()
        .find_map(|e| match e {
            DownloadEvent::Progress {
                bytes_read,
                total_bytes,
                ..
            } => Some((*bytes_read, *total_bytes)),
            _ => None,
        });
    assert_eq!(last_progress, Some((50_000, None)));
    assert!(matches!(events.last(), Some(DownloadEvent::Completed { .. })));
    Ok(())
}

#[tokio::test]
async fn test_download_short_body() -> anyhow::Result<()> {
    init_test_tracing();
    let url = serve_raw(
        "HTTP/1.1 200 OK\r\nContent-Length: 4096\r\nConnection: close\r\n\r\n".to_string(),
        vec![7u8; 1000],
    )
    .await?;

    let dir = tempfile::tempdir()?;
    let (events, rx) = EventSender::channel();
    let err = downloader()
        .download(
            &url,
            &dir.path().join("short.m4s"),
            &events,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transfer);
    let events = drain(rx);
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Failed {
            kind: ErrorKind::Transfer,
            ..
        })
    ));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    Ok(())
}
