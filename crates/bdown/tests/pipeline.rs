use bdown::{
    api::{ApiEndpoints, BiliClient, MediaPart},
    download::ChunkDownloader,
    event::{DownloadEvent, EventSender, PipelineStage},
    pipeline::Pipeline,
    ErrorKind, HttpClient, PipelineError,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bdown=debug")
        .with_test_writer()
        .try_init();
}

fn pipeline(server: &MockServer, dir: &std::path::Path) -> anyhow::Result<Pipeline<BiliClient>> {
    let client = HttpClient::default();
    let resolver = BiliClient::new(client.clone()).with_endpoints(ApiEndpoints::new(&server.uri())?);
    Ok(Pipeline::new(resolver, ChunkDownloader::new(client), dir))
}

#[tokio::test]
async fn test_resolution_failure_starts_no_download() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    let cdn = format!("{}/upos/v80.m4s", server.uri());
    Mock::given(method("GET"))
        .and(path("/x/player/wbi/playurl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "message": "0",
            "data": {"dash": {"video": [{"id": 80, "baseUrl": cdn}], "audio": []}}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/upos/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let part = MediaPart::new("BV1xx411c7mD", 1, "silent", 5);
    let (events, mut rx) = EventSender::channel();
    let err = pipeline(&server, dir.path())?
        .run(&part, &events, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Resolve(_)));
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(err.to_string(), "failed to obtain source URL: empty audio URL");
    assert!(!dir.path().join("silent_video.m4s").exists());

    assert_eq!(
        rx.try_recv()?,
        DownloadEvent::Stage(PipelineStage::Resolving)
    );
    assert_eq!(
        rx.try_recv()?,
        DownloadEvent::Failed {
            kind: ErrorKind::Resolution,
            message: "failed to obtain source URL: empty audio URL".to_string(),
        }
    );
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_video_failure_stops_before_audio() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    let video = format!("{}/upos/v80.m4s", server.uri());
    let audio = format!("{}/upos/a30280.m4s", server.uri());
    Mock::given(method("GET"))
        .and(path("/x/player/wbi/playurl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "message": "0",
            "data": {"dash": {
                "video": [{"id": 80, "baseUrl": video}],
                "audio": [{"id": 30280, "baseUrl": audio}]
            }}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/upos/v80.m4s"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/upos/a30280.m4s"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let part = MediaPart::new("BV1xx411c7mD", 1, "forbidden", 5);
    let err = pipeline(&server, dir.path())?
        .run(&part, &EventSender::noop(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert_eq!(
        err.to_string(),
        "video download failed: HTTP error: 403 Forbidden"
    );
    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_start() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pipeline(&server, dir.path())?
        .run(
            &MediaPart::new("BV1xx411c7mD", 1, "never", 5),
            &EventSender::noop(),
            &cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    Ok(())
}
