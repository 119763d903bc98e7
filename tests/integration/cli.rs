use assert_cmd::Command;
use predicates::prelude::*;

use crate::common::TestProject;

#[test]
fn test_cli_prints_composed_report() {
    let project = TestProject::new().unwrap();
    project.write_template("base", "name: base\ntags: [base]\n");
    project.write_template("lint", "name: lint\ntags: [lint]\n");
    project.write_template(
        ".",
        "name: app\nextends: ./base\nincludes:\n  - url: ./lint\n    condition: \"lint == true\"\ndependencies:\n  - name: shared\n    type: local\n    url: ./base\n",
    );

    let output = project.run_tplkit(&["template.yaml", "--var", "lint=true"]).unwrap();
    output.assert_success();
    let report = output.json();

    assert_eq!(report["template"]["descriptor"]["name"], "app");
    let tags = report["template"]["descriptor"]["tags"].as_array().unwrap();
    assert!(tags.iter().any(|t| t == "lint"));
    assert_eq!(report["template"]["resolvedIncludes"][0]["included"], true);
    assert_eq!(report["dependencies"]["resolved"][0]["dependency"]["name"], "shared");
}

#[test]
fn test_cli_no_deps_and_skipped_include() {
    let project = TestProject::new().unwrap();
    project.write_template("lint", "name: lint\n");
    project.write_template(
        ".",
        "name: app\nincludes:\n  - url: ./lint\n    condition: \"lint == true\"\n",
    );

    let output = project.run_tplkit(&["template.yaml", "--no-deps"]).unwrap();
    output.assert_success();
    let report = output.json();
    assert!(report.get("dependencies").is_none());
    assert_eq!(report["template"]["resolvedIncludes"][0]["included"], false);
}

#[test]
fn test_cli_missing_descriptor_fails() {
    let project = TestProject::new().unwrap();
    Command::cargo_bin("tplkit")
        .unwrap()
        .current_dir(project.project_path())
        .env("TPLKIT_CACHE_DIR", project.cache_path())
        .env("TPLKIT_CONFIG_PATH", project.project_path().join("none.toml"))
        .env("NO_COLOR", "1")
        .arg("does-not-exist")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_cli_rejects_invalid_descriptor() {
    let project = TestProject::new().unwrap();
    project.write_template(".", "name: app\nvariables:\n  port:\n    type: nmber\n");

    Command::cargo_bin("tplkit")
        .unwrap()
        .current_dir(project.project_path())
        .env("TPLKIT_CACHE_DIR", project.cache_path())
        .env("TPLKIT_CONFIG_PATH", project.project_path().join("none.toml"))
        .env("NO_COLOR", "1")
        .arg(".")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed validation"));
}

#[test]
fn test_cli_rejects_malformed_var() {
    Command::cargo_bin("tplkit")
        .unwrap()
        .args(["template.yaml", "--var", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}
