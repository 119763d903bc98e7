use tplkit::descriptor::DescriptorParser;

use crate::common::TestProject;

const APP: &str = r#"
name: app
version: 1.2.0
tags: [web]
variables:
  projectName:
    type: string
    required: true
    pattern: "^[a-z][a-z0-9-]*$"
  port:
    type: number
    default: 3000
steps:
  - name: scaffold
    template: templates/app
  - name: install
    command: npm install
    dependsOn: [scaffold]
    when: "port > 1024"
dependencies:
  - react@^18.0.0
"#;

#[tokio::test]
async fn test_parsing_is_deterministic() {
    let project = TestProject::new().unwrap();
    let path = project.write_template("app", APP);
    let parser = DescriptorParser::new();

    let first = parser.parse_file(&path).await.unwrap();
    let second = parser.parse_file(&path).await.unwrap();
    assert!(first.is_valid, "{:?}", first.errors);
    assert_eq!(first, second);

    let from_dir = parser.parse_file(path.parent().unwrap()).await.unwrap();
    assert_eq!(first.descriptor, from_dir.descriptor);
}

#[tokio::test]
async fn test_step_cycle_reported_once() {
    let project = TestProject::new().unwrap();
    let path = project.write_template(
        "cyclic",
        r"
name: cyclic
steps:
  - name: build
    command: make
    dependsOn: [test]
  - name: test
    command: make test
    dependsOn: [build]
",
    );

    let parsed = DescriptorParser::new().parse_file(&path).await.unwrap();
    assert!(!parsed.is_valid);
    let cycles = parsed.errors.iter().filter(|e| e.message.contains("circular")).count();
    assert_eq!(cycles, 1, "{:?}", parsed.errors);
}

#[tokio::test]
async fn test_missing_descriptor_is_not_found() {
    let project = TestProject::new().unwrap();
    let error =
        DescriptorParser::new().parse_file(&project.project_path().join("nope")).await.unwrap_err();
    assert!(error.to_string().contains("not found"));
}
