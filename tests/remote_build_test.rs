mod common;

use async_trait::async_trait;
use common::{
    start_agent, start_agent_with, test_config, AgentOptions, Fixture, RecordingSink, Reply,
};
use rbuild::protocol::{unescape_segment, DOWNLOAD_PREFIX, STATUS_PREFIX, UPLOAD_PATH};
use rbuild::{ArtifactRecord, ArtifactSink, BuildError, RemoteBuild};
use std::sync::atomic::Ordering;
use std::time::Duration;

const JOB_ID: &str = "job-42";

fn download_name(path: &str) -> String {
    let prefix = format!("{}/{}/", DOWNLOAD_PREFIX, JOB_ID);
    unescape_segment(path.strip_prefix(&prefix).unwrap()).unwrap()
}

#[tokio::test]
async fn test_full_build_downloads_every_artifact() {
    let fixture = Fixture::new();
    let unicode_name = "Mÿ App 1.0.AppImage";
    let manifest = format!(
        r#"{{"files":[{{"file":"latest.yml","isWriteUpdateInfo":true}},{{"file":"app.exe","target":"nsis","arch":"x64"}},{{"file":"{}"}}]}}"#,
        unicode_name
    );

    let (session, log) = start_agent(move |req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else if req.path.starts_with(STATUS_PREFIX) {
            Reply::events(&[
                r#"{"state":"added"}"#,
                r#"{"state":"started"}"#,
                manifest.as_str(),
            ])
        } else {
            let name = download_name(&req.path);
            Reply::json(200, &format!("content of {}", name))
        }
    })
    .await;

    let sink = RecordingSink::default();
    let outcome = RemoteBuild::new(test_config())
        .run_on_session(session, &fixture.request(), &fixture.project_info(), &sink)
        .await
        .unwrap();

    assert_eq!(outcome.job_id, JOB_ID);
    assert_eq!(outcome.artifacts, 3);

    let requests = log.requests();
    let upload = requests.iter().find(|r| r.path == UPLOAD_PATH).unwrap();
    assert_eq!(upload.method, http::Method::POST);
    assert_eq!(
        upload.headers.get("content-type").unwrap(),
        "application/octet-stream"
    );
    assert_eq!(upload.headers.get("x-build-platform").unwrap(), "linux");
    assert_eq!(upload.headers.get("x-build-target").unwrap(), "AppImage");
    // `cat` stands in for zstd, so the body is the raw tar stream
    assert!(upload.body.len() > 512);
    assert_eq!(&upload.body[257..262], b"ustar");

    let status = log.paths_with_prefix(STATUS_PREFIX);
    assert_eq!(status, vec![format!("{}/{}", STATUS_PREFIX, JOB_ID)]);

    let mut downloaded: Vec<String> = log
        .paths_with_prefix(DOWNLOAD_PREFIX)
        .iter()
        .map(|p| download_name(p))
        .collect();
    downloaded.sort();
    let mut expected = vec![
        "app.exe".to_string(),
        "latest.yml".to_string(),
        unicode_name.to_string(),
    ];
    expected.sort();
    assert_eq!(downloaded, expected);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    let latest = records
        .iter()
        .find(|r| r.file.ends_with("latest.yml"))
        .unwrap();
    assert!(latest.is_write_update_info);
    assert_eq!(latest.data.as_deref(), Some(&b"content of latest.yml"[..]));
    let exe = records.iter().find(|r| r.file.ends_with("app.exe")).unwrap();
    assert!(exe.data.is_none());
    assert_eq!(exe.target.as_deref(), Some("nsis"));
    assert_eq!(exe.arch.as_deref(), Some("x64"));

    let on_disk = std::fs::read_to_string(fixture.output.join(unicode_name)).unwrap();
    assert_eq!(on_disk, format!("content of {}", unicode_name));
    assert_eq!(
        std::fs::read(fixture.output.join("app.exe")).unwrap(),
        b"content of app.exe"
    );

    assert!(
        log.eventually(|l| l.connection_closed.load(Ordering::SeqCst))
            .await
    );
}

#[tokio::test]
async fn test_validation_rejection_carries_payload() {
    let fixture = Fixture::new();
    let (session, log) = start_agent(|_| Reply::json(400, r#"{"message":"bad config"}"#)).await;

    let err = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    match err {
        BuildError::Validation(payload) => assert_eq!(payload, r#"{"message":"bad config"}"#),
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(log.paths_with_prefix(STATUS_PREFIX).is_empty());
}

#[tokio::test]
async fn test_resources_equal_to_project_fails_before_upload() {
    let fixture = Fixture::new();
    let mut request = fixture.request();
    request.build_resources_dir = fixture.project.clone();

    let (session, log) = start_agent(|_| Reply::json(200, r#"{"id":"x"}"#)).await;
    let err = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &request,
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Configuration(_)));
    assert!(log.requests().is_empty());
    assert!(
        log.eventually(|l| l.connection_closed.load(Ordering::SeqCst))
            .await
    );
}

#[tokio::test]
async fn test_error_event_fails_job_without_downloads() {
    let fixture = Fixture::new();
    let (session, log) = start_agent(|req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else if req.path.starts_with(STATUS_PREFIX) {
            Reply::events(&[r#"{"state":"started"}"#, r#"{"error":"no signing identity"}"#])
        } else {
            Reply::json(200, "unexpected")
        }
    })
    .await;

    let sink = RecordingSink::default();
    let err = RemoteBuild::new(test_config())
        .run_on_session(session, &fixture.request(), &fixture.project_info(), &sink)
        .await
        .unwrap_err();

    match err {
        BuildError::JobFailed(message) => assert_eq!(message, "no signing identity"),
        other => panic!("expected job failure, got {:?}", other),
    }
    assert!(log.paths_with_prefix(DOWNLOAD_PREFIX).is_empty());
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_download_not_found() {
    let fixture = Fixture::new();
    let (session, _log) = start_agent(|req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else if req.path.starts_with(STATUS_PREFIX) {
            Reply::events(&[r#"{"files":[{"file":"missing.zip"}]}"#])
        } else {
            Reply::json(404, "")
        }
    })
    .await;

    let err = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    match err {
        BuildError::HttpStatus { status, path } => {
            assert_eq!(status, 404);
            assert!(path.ends_with("missing.zip"));
        }
        other => panic!("expected HTTP status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upload_server_error() {
    let fixture = Fixture::new();
    let (session, _log) = start_agent(|_| Reply::json(503, "busy")).await;

    let err = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::HttpStatus { status: 503, .. }));
}

#[tokio::test]
async fn test_upload_response_without_id() {
    let fixture = Fixture::new();
    let (session, log) = start_agent(|_| Reply::json(200, "{}")).await;

    let err = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Protocol(ref msg) if msg == "missing id"));
    assert!(log.paths_with_prefix(STATUS_PREFIX).is_empty());
}

#[tokio::test]
async fn test_manifest_stops_reading_status_stream() {
    let fixture = Fixture::new();
    let (session, log) = start_agent(|req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else if req.path.starts_with(STATUS_PREFIX) {
            // The agent keeps the stream open after the manifest
            Reply::events(&[r#"{"state":"added"}"#, r#"{"files":[{"file":"a.zip"}]}"#])
        } else {
            Reply::json(200, "zip bytes")
        }
    })
    .await;

    let outcome = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.artifacts, 1);
    assert_eq!(log.paths_with_prefix(DOWNLOAD_PREFIX).len(), 1);
    assert!(
        log.eventually(|l| l.abandoned_streams.load(Ordering::SeqCst) == 1)
            .await
    );
}

#[tokio::test]
async fn test_empty_manifest_completes() {
    let fixture = Fixture::new();
    let (session, log) = start_agent(|req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else {
            Reply::events(&[r#"{"files":[]}"#])
        }
    })
    .await;

    let outcome = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.artifacts, 0);
    assert!(log.paths_with_prefix(DOWNLOAD_PREFIX).is_empty());
}

#[tokio::test]
async fn test_status_stream_ending_early() {
    let fixture = Fixture::new();
    let (session, _log) = start_agent(|req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else {
            Reply::EventsThenEnd(vec!["{\"state\":\"added\"}\n".to_string()])
        }
    })
    .await;

    let err = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Protocol(_)));
}

#[tokio::test]
async fn test_compressor_failure_aborts_upload() {
    let fixture = Fixture::new();
    let (session, log) = start_agent(|_| Reply::json(200, r#"{"id":"job-42"}"#)).await;

    let mut config = test_config();
    config.compressor = Some(
        rbuild::archive::ProcessStage::new("sh")
            .arg("-c")
            .arg("cat >/dev/null; exit 2"),
    );

    let err = RemoteBuild::new(config)
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, BuildError::Upload(ref msg) if msg.starts_with("sh exited")),
        "unexpected error: {:?}",
        err
    );
    assert!(log.paths_with_prefix(STATUS_PREFIX).is_empty());
}

struct RefusingSink;

#[async_trait]
impl ArtifactSink for RefusingSink {
    async fn artifact_created(&self, record: ArtifactRecord) -> rbuild::Result<()> {
        Err(BuildError::Configuration(format!(
            "cannot register {}",
            record.file.display()
        )))
    }
}

#[tokio::test]
async fn test_sink_failure_fails_job() {
    let fixture = Fixture::new();
    let (session, _log) = start_agent(|req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else if req.path.starts_with(STATUS_PREFIX) {
            Reply::events(&[r#"{"files":[{"file":"a.zip"}]}"#])
        } else {
            Reply::json(200, "zip bytes")
        }
    })
    .await;

    let err = RemoteBuild::new(test_config())
        .run_on_session(session, &fixture.request(), &fixture.project_info(), &RefusingSink)
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Configuration(ref msg) if msg.contains("a.zip")));
}

#[tokio::test]
async fn test_upload_response_before_body_is_consumed() {
    let fixture = Fixture::new().with_asset("assets.bin", 4 * 1024 * 1024);
    let options = AgentOptions {
        early_upload_headers: true,
    };
    let (session, log) = start_agent_with(options, |req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else {
            Reply::events(&[r#"{"files":[]}"#])
        }
    })
    .await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        RemoteBuild::new(test_config()).run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        ),
    )
    .await
    .expect("upload stalled after early response headers")
    .unwrap();

    assert_eq!(outcome.job_id, JOB_ID);
    let requests = log.requests();
    let upload = requests.iter().find(|r| r.path == UPLOAD_PATH).unwrap();
    assert!(upload.body.len() > 4 * 1024 * 1024);
}

#[tokio::test]
async fn test_empty_upload_response_is_missing_id() {
    let fixture = Fixture::new();
    let (session, _log) = start_agent(|_| Reply::Full(200, bytes::Bytes::new())).await;

    let err = RemoteBuild::new(test_config())
        .run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Protocol(ref msg) if msg == "missing id"));
}

#[tokio::test]
async fn test_connection_lost_while_watching_events() {
    let fixture = Fixture::new();
    let (session, log) = start_agent(|req| {
        if req.path == UPLOAD_PATH {
            Reply::json(200, r#"{"id":"job-42"}"#)
        } else {
            Reply::Disconnect
        }
    })
    .await;

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        RemoteBuild::new(test_config()).run_on_session(
            session,
            &fixture.request(),
            &fixture.project_info(),
            &RecordingSink::default(),
        ),
    )
    .await
    .expect("job hung after the connection dropped")
    .unwrap_err();

    assert!(matches!(err, BuildError::Transport(_)), "got {:?}", err);
    assert!(log.paths_with_prefix(DOWNLOAD_PREFIX).is_empty());
    assert!(
        log.eventually(|l| l.connection_closed.load(Ordering::SeqCst))
            .await
    );
}
