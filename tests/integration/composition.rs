use std::time::Duration;
use tplkit::compose::{CompositionContext, CompositionEngine, ConflictStrategy};
use tplkit::core::CompositionError;
use tplkit::descriptor::DescriptorParser;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::TestProject;

async fn compose_file(
    project: &TestProject,
    engine: &CompositionEngine,
    dir: &str,
    ctx: &CompositionContext,
) -> Result<tplkit::compose::ComposedTemplate, CompositionError> {
    let location = project.project_path().join(dir).join("template.yaml");
    let parsed = DescriptorParser::new().parse_file(&location).await.unwrap();
    assert!(parsed.is_valid, "{:?}", parsed.errors);
    engine.compose_at(&parsed.descriptor, &location, ctx).await
}

fn local_engine(project: &TestProject) -> CompositionEngine {
    let config = project.config("http://127.0.0.1:9");
    CompositionEngine::new(project.manager(&config))
}

#[tokio::test]
async fn test_child_variable_overrides_parent_default() {
    tplkit::test_utils::init_test_logging(None);
    let project = TestProject::new().unwrap();
    project.write_template(
        "base",
        "name: base\nvariables:\n  port:\n    type: number\n    default: 3000\n  host:\n    type: string\n    default: localhost\n",
    );
    project.write_template(
        "service",
        "name: service\nextends: ../base\nvariables:\n  port:\n    type: number\n    default: 8080\n",
    );

    let engine = local_engine(&project);
    let ctx = CompositionContext::new(project.project_path());
    let composed = compose_file(&project, &engine, "service", &ctx).await.unwrap();

    let variables = &composed.descriptor.variables;
    assert_eq!(variables["port"].default, Some(serde_json::json!(8080)));
    assert_eq!(variables["host"].default, Some(serde_json::json!("localhost")));
    assert_eq!(composed.descriptor.name, "service");
    assert!(composed.descriptor.extends.is_none());
}

#[tokio::test]
async fn test_extend_and_replace_tag_strategies() {
    let project = TestProject::new().unwrap();
    project.write_template("web", "name: web\ntags: [web]\n");
    project.write_template("api", "name: api\ntags: [api]\n");
    project.write_template(
        "extend",
        "name: extend\nincludes:\n  - url: ../web\n    strategy: extend\n  - url: ../api\n    strategy: extend\n",
    );
    project.write_template(
        "replace",
        "name: replace\nincludes:\n  - url: ../web\n    strategy: replace\n  - url: ../api\n    strategy: replace\n",
    );

    let engine = local_engine(&project);
    let ctx = CompositionContext::new(project.project_path());

    let extended = compose_file(&project, &engine, "extend", &ctx).await.unwrap();
    assert_eq!(extended.descriptor.tags, vec!["web".to_string(), "api".to_string()]);

    let replaced = compose_file(&project, &engine, "replace", &ctx).await.unwrap();
    assert_eq!(replaced.descriptor.tags, vec!["api".to_string()]);
}

#[tokio::test]
async fn test_include_order_preserved_despite_latency() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/slow/main/template.yaml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("name: slow\ntags: [slow]\n")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/fast/main/template.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("name: fast\ntags: [fast]\n"))
        .mount(&server)
        .await;

    let project = TestProject::new().unwrap();
    project.write_template(
        "root",
        "name: root\nincludes:\n  - url: acme/slow\n  - url: acme/fast\n  - url: ./never\n    condition: \"enabled == true\"\n",
    );

    let engine = CompositionEngine::new(project.manager(&project.config(&server.uri())));
    let ctx = CompositionContext::new(project.project_path())
        .with_strategy(ConflictStrategy::Extend);
    let composed = compose_file(&project, &engine, "root", &ctx).await.unwrap();

    let urls: Vec<&str> = composed.resolved_includes.iter().map(|i| i.url.as_str()).collect();
    assert_eq!(urls, ["acme/slow", "acme/fast", "./never"]);
    assert!(!composed.resolved_includes[2].included);
    assert!(composed.resolved_includes[2].reason.is_some());
    assert_eq!(composed.descriptor.tags, vec!["slow".to_string(), "fast".to_string()]);
    assert_eq!(composed.included().count(), 2);
}

#[tokio::test]
async fn test_circular_extends_is_fatal() {
    let project = TestProject::new().unwrap();
    project.write_template("a", "name: a\nextends: ../b\n");
    project.write_template("b", "name: b\nextends: ../a\n");

    let engine = local_engine(&project);
    let ctx = CompositionContext::new(project.project_path());
    let error = compose_file(&project, &engine, "a", &ctx).await.unwrap_err();
    assert!(
        matches!(error, CompositionError::CircularComposition { .. }),
        "unexpected error: {error}"
    );
}

#[tokio::test]
async fn test_fail_strategy_aborts_on_collision() {
    let project = TestProject::new().unwrap();
    project.write_template("one", "name: one\nvariables:\n  mode:\n    type: string\n    default: dev\n");
    project.write_template(
        "root",
        "name: root\nvariables:\n  mode:\n    type: string\n    default: prod\nincludes:\n  - url: ../one\n    strategy: fail\n",
    );

    let engine = local_engine(&project);
    let ctx = CompositionContext::new(project.project_path());
    let error = compose_file(&project, &engine, "root", &ctx).await.unwrap_err();
    assert!(error.to_string().contains("mode"), "{error}");
}
