//! End-to-end flows through the full stack: manager -> worker process ->
//! transfer engine -> mocked storage endpoint.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use s3ferry::{
    JobEvent, JobEventKind, JobOrigin, JobStatus, RemoteEntry, S3Config, TransferConfig,
    TransferEvent, TransferManager,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn worker_program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_s3ferry-worker"))
}

fn mock_s3(server: &MockServer) -> S3Config {
    S3Config {
        endpoint: server.address().to_string(),
        region: "us-east-1".into(),
        access_key_id: "ak".into(),
        secret_access_key: "sk".into(),
        secure: false,
    }
}

fn test_config(journal_dir: &std::path::Path) -> TransferConfig {
    TransferConfig {
        journal_dir: journal_dir.to_path_buf(),
        worker_program: Some(worker_program()),
        ..TransferConfig::default()
    }
}

/// Consumes events until the job reaches a terminal transfer event.
async fn wait_for_terminal(events: &mut UnboundedReceiver<JobEvent>) -> TransferEvent {
    loop {
        let event = events.recv().await.expect("event stream stays open");
        if let JobEventKind::Transfer(transfer) = event.kind {
            if transfer.is_terminal() {
                return transfer;
            }
        }
    }
}

#[tokio::test]
async fn upload_runs_in_a_worker_process_to_completion() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/media/notes.txt"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"x\""))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("notes.txt");
        tokio::fs::write(&file, vec![7u8; 3 * 1024])
            .await
            .expect("fixture");

        let (manager, mut events) = TransferManager::start(test_config(dir.path()), mock_s3(&server));
        manager.add_uploads(vec![file], "media", "", JobOrigin::default());

        let terminal = wait_for_terminal(&mut events).await;
        assert!(
            matches!(terminal, TransferEvent::FileUploaded),
            "expected fileUploaded, got {:?}",
            terminal
        );

        let jobs = manager.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Finished);

        // Finished jobs drop out of the journal.
        let journal = tokio::fs::read_to_string(dir.path().join("upprog_default.json"))
            .await
            .expect("journal written");
        let records: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&journal).expect("journal parses");
        assert!(records.is_empty());

        manager.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn changed_fingerprint_discards_cached_progress_on_resume() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let server = MockServer::start().await;
        // Only the fresh single PUT is mocked. If the stale uploadId or part
        // map survived reconciliation, the worker would list parts or create
        // a multipart upload and fail against the mock.
        Mock::given(method("PUT"))
            .and(path("/media/stale.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"y\""))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("stale.bin");
        tokio::fs::write(&file, vec![1u8; 3 * 1024])
            .await
            .expect("fixture");

        // Journal from a previous run whose fingerprint no longer matches.
        let journal = serde_json::json!({
            "job-stale": {
                "from": { "path": file },
                "to": { "bucket": "media", "key": "stale.bin" },
                "size": 999_999,
                "mtime": 1,
                "prog": { "loaded": 2048, "total": 999_999 },
                "status": "waiting",
                "uploadId": "mp-zombie",
                "parts": [ { "PartNumber": 1, "ETag": "\"e1\"" } ]
            }
        });
        tokio::fs::write(
            dir.path().join("upprog_default.json"),
            serde_json::to_vec(&journal).expect("encode"),
        )
        .await
        .expect("seed journal");

        let (manager, mut events) = TransferManager::start(test_config(dir.path()), mock_s3(&server));

        let terminal = wait_for_terminal(&mut events).await;
        assert!(
            matches!(terminal, TransferEvent::FileUploaded),
            "expected fileUploaded, got {:?}",
            terminal
        );

        let jobs = manager.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "job-stale");
        assert_eq!(jobs[0].status, JobStatus::Finished);
        assert!(jobs[0].upload_id.is_none(), "stale uploadId discarded");

        manager.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn download_lands_at_the_destination_after_verification() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let server = MockServer::start().await;
        let content: Vec<u8> = (0..3_000).map(|i| (i % 200) as u8).collect();
        Mock::given(method("HEAD"))
            .and(path("/media/hello.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; content.len()])
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/media/hello.bin"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(content.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("incoming");

        let (manager, mut events) = TransferManager::start(test_config(dir.path()), mock_s3(&server));
        manager.add_downloads(
            "media",
            vec![RemoteEntry {
                key: "hello.bin".into(),
                size: content.len() as u64,
                mtime: 1445412480,
            }],
            &dest,
            JobOrigin::default(),
        );

        let terminal = wait_for_terminal(&mut events).await;
        assert!(
            matches!(terminal, TransferEvent::FileDownloaded),
            "expected fileDownloaded, got {:?}",
            terminal
        );

        let jobs = manager.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Finished);

        let written = tokio::fs::read(dest.join("hello.bin")).await.expect("file");
        assert_eq!(written, content);

        manager.shutdown().await;
    })
    .await
    .expect("test timed out");
}
