use tplkit::cache::CONTENT_FILE;
use tplkit::core::ResolutionError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::TestProject;

/// Overwrite every stored content file under the cache directory.
fn corrupt_cache(project: &TestProject) -> usize {
    walkdir::WalkDir::new(project.cache_path())
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() == CONTENT_FILE)
        .map(|entry| std::fs::write(entry.path(), "name: tampered\n").unwrap())
        .count()
}

#[tokio::test]
async fn test_unchanged_reference_fetched_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/starter/main/template.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("name: starter\n"))
        .expect(1)
        .mount(&server)
        .await;

    let project = TestProject::new().unwrap();
    let manager = project.manager(&project.config(&server.uri()));

    let first = manager.resolve_one("acme/starter", None).await.unwrap();
    let second = manager.resolve_one("acme/starter", None).await.unwrap();
    assert_eq!(first.checksum(), second.checksum());
    assert!(first.checksum().starts_with("sha256:"));
    assert_eq!(second.content(), "name: starter\n");
}

#[tokio::test]
async fn test_corrupted_cache_entry_is_refetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/starter/main/template.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("name: starter\n"))
        .expect(2)
        .mount(&server)
        .await;

    let project = TestProject::new().unwrap();
    let manager = project.manager(&project.config(&server.uri()));

    let first = manager.resolve_one("acme/starter", None).await.unwrap();
    assert_eq!(corrupt_cache(&project), 1);

    let second = manager.resolve_one("acme/starter", None).await.unwrap();
    assert_eq!(second.content(), "name: starter\n");
    assert_eq!(first.checksum(), second.checksum());
}

#[tokio::test]
async fn test_payload_limit_aborts_without_caching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/bloated/main/template.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(64 * 1024)))
        .mount(&server)
        .await;

    let project = TestProject::new().unwrap();
    let mut config = project.config(&server.uri());
    config.security.max_download_size = 4096;
    let manager = project.manager(&config);

    let error = manager.resolve_one("acme/bloated", None).await.unwrap_err();
    assert!(matches!(error, ResolutionError::PayloadTooLarge { .. }), "{error}");
    assert!(error.to_string().contains("4096"));

    let info = manager.cache().unwrap().get_info().await.unwrap();
    assert_eq!(info.entries, 0);
    assert_eq!(corrupt_cache(&project), 0);
}

#[tokio::test]
async fn test_resolve_many_isolates_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/ok/main/template.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("name: ok\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/gone/main/template.yaml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let project = TestProject::new().unwrap();
    let manager = project.manager(&project.config(&server.uri()));

    let results = manager.resolve_many(&["acme/gone", "acme/ok", "!!"], None).await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_err());
    assert_eq!(results[1].as_ref().unwrap().content(), "name: ok\n");
    assert!(matches!(results[2], Err(ResolutionError::Unclassifiable { .. })));
}
