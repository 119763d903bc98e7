use tplkit::compose::{CompositionContext, CompositionEngine};
use tplkit::descriptor::{DependencyType, DescriptorParser};
use tplkit::resolver::{DependencyResolver, ResolveOptions, normalize_dependencies};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::TestProject;

#[tokio::test]
async fn test_mixed_dependency_forms_normalize() {
    let project = TestProject::new().unwrap();
    let location = project.write_template(
        "app",
        "name: app\ndependencies:\n  - lodash\n  - name: left-pad\n    type: local\n    url: ./vendor/left-pad\n",
    );
    let parsed = DescriptorParser::new().parse_file(&location).await.unwrap();
    assert!(parsed.is_valid, "{:?}", parsed.errors);

    let dependencies = normalize_dependencies(&parsed.descriptor.dependencies);
    assert_eq!(dependencies.len(), 2);
    assert_eq!(dependencies[0].name, "lodash");
    assert_eq!(dependencies[0].dep_type, DependencyType::RegistryPackage);
    assert_eq!(dependencies[1].name, "left-pad");
    assert_eq!(dependencies[1].dep_type, DependencyType::Local);
    assert_eq!(dependencies[1].url.as_deref(), Some("./vendor/left-pad"));
}

#[tokio::test]
async fn test_graph_mixes_resolved_missing_and_conflicts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/ci/main/template.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("name: ci\n"))
        .expect(1)
        .mount(&server)
        .await;

    let project = TestProject::new().unwrap();
    project
        .write_file("node_modules/lodash/package.json", r#"{"name":"lodash","version":"4.17.21"}"#)
        .unwrap();
    project.write_file("vendor/left-pad/index.js", "module.exports = 1;\n").unwrap();
    let location = project.write_template(
        ".",
        r"
name: app
dependencies:
  - lodash@^4.17.0
  - lodash@^3.0.0
  - name: left-pad
    type: local
    url: ./vendor/left-pad
  - name: ci
    type: repository
    url: acme/ci
  - name: missing-pkg
    optional: true
",
    );
    let parsed = DescriptorParser::new().parse_file(&location).await.unwrap();

    let resolver = DependencyResolver::new(project.manager(&project.config(&server.uri())));
    let mut options = ResolveOptions::new(project.project_path());
    options.include_optional = true;
    let graph = resolver.resolve(&parsed.descriptor.dependencies, &options).await;

    assert_eq!(graph.conflicts.len(), 1);
    assert_eq!(graph.conflicts[0].name, "lodash");

    let resolved: Vec<&str> = graph.resolved.iter().map(|r| r.dependency.name.as_str()).collect();
    assert!(resolved.contains(&"left-pad"));
    assert!(resolved.contains(&"ci"));
    let ci = graph.resolved.iter().find(|r| r.dependency.name == "ci").unwrap();
    assert_eq!(ci.version.as_deref(), Some("main"));

    // ^4.17.0 resolves, ^3.0.0 does not; the optional package is missing
    assert_eq!(graph.resolved.iter().filter(|r| r.dependency.name == "lodash").count(), 1);
    assert!(graph.missing.iter().any(|m| m.name == "lodash" && m.reason.contains("does not satisfy")));
    assert!(graph.missing.iter().any(|m| m.name == "missing-pkg" && m.optional));
    assert!(!graph.all_required_failed());
}

#[tokio::test]
async fn test_included_local_dependency_conflicts_with_root_package() {
    let project = TestProject::new().unwrap();
    project.write_file("vendor/shared/index.js", "module.exports = 1;\n").unwrap();
    project.write_template(
        "shared-local",
        "name: shared-local\ndependencies:\n  - name: shared\n    type: local\n    url: ./vendor/shared\n",
    );
    let location = project.write_template(
        ".",
        "name: app\ndependencies:\n  - shared@^1.0.0\nincludes:\n  - url: ./shared-local\n",
    );
    let parsed = DescriptorParser::new().parse_file(&location).await.unwrap();
    assert!(parsed.is_valid, "{:?}", parsed.errors);

    let manager = project.manager(&project.config("http://127.0.0.1:9"));
    let engine = CompositionEngine::new(manager.clone());
    let ctx = CompositionContext::new(project.project_path());
    let composed = engine.compose_at(&parsed.descriptor, &location, &ctx).await.unwrap();
    assert_eq!(composed.descriptor.dependencies.len(), 2);

    let graph = DependencyResolver::new(manager)
        .resolve(&composed.descriptor.dependencies, &ResolveOptions::new(project.project_path()))
        .await;
    assert_eq!(graph.conflicts.len(), 1);
    assert_eq!(graph.conflicts[0].name, "shared");
    assert_eq!(graph.conflicts[0].entries.len(), 2);
}
