//! Command-line behaviour of the `mirakle` binary. Nothing here reaches a
//! remote host: the tests stay on `plan`, `config` and local passthrough.

mod common;

use common::{TestProject, assert_contains, assert_path_absent, init_test_logging, run};

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_includes_description() {
    init_test_logging();
    crate::test_log!("TEST START: test_help_includes_description");

    let output = run(std::process::Command::new(env!("CARGO_BIN_EXE_mirakle")).arg("--help"));

    assert!(output.status.success(), "mirakle --help failed");
    let text = stdout(&output);
    assert_contains(&text, "run your build on a remote machine");
    assert_contains(&text, "plan");
    assert_contains(&text, "config");

    crate::test_log!("TEST PASS: test_help_includes_description");
}

#[test]
fn test_plan_lists_tasks_in_order() {
    init_test_logging();
    crate::test_log!("TEST START: test_plan_lists_tasks_in_order");

    let project = TestProject::with_config("host = \"box\"\n");
    let output = run(project.mirakle().args(["plan", "build"]));

    assert!(output.status.success(), "plan failed: {}", stderr(&output));
    let text = stdout(&output);
    assert_contains(&text, "Host: box");
    let upload = text.find("1. uploadToRemote").expect("upload missing");
    let execute = text.find("2. executeOnRemote").expect("execute missing");
    let download = text.find("3. downloadFromRemote").expect("download missing");
    let root = text.find("4. mirakle").expect("root missing");
    assert!(upload < execute && execute < download && download < root);
    assert_path_absent(&project.root.join("mirakle_build_file_stub"));

    crate::test_log!("TEST PASS: test_plan_lists_tasks_in_order");
}

#[test]
fn test_plan_json_with_fallback_and_parallel_download() {
    init_test_logging();
    let project = TestProject::with_config(
        "host = \"box\"\nfallback = true\ndownload_in_parallel = true\n",
    );
    let output = run(project.mirakle().args(["plan", "--json", "build"]));

    assert!(output.status.success(), "plan failed: {}", stderr(&output));
    let plan: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(plan["mode"], "remote");
    assert_eq!(plan["host"], "box");
    let names: Vec<&str> = plan["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|node| node["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "uploadToRemote",
            "fallback",
            "downloadInParallel",
            "executeOnRemote",
            "downloadFromRemote",
            "mirakle"
        ]
    );
    assert_eq!(plan["nodes"][2]["background"], true);
}

#[test]
fn test_plan_for_opted_out_invocation_is_local() {
    init_test_logging();
    let project = TestProject::new();
    let output = run(project.mirakle().args(["plan", "--", "build", "-x", "mirakle"]));

    assert!(output.status.success(), "plan failed: {}", stderr(&output));
    let text = stdout(&output);
    assert_contains(&text, "Not offloaded (excluded with -x mirakle)");
    assert_contains(&text, "gradlew build");
}

#[test]
fn test_config_json_reports_source() {
    init_test_logging();
    let project = TestProject::with_config("host = \"box\"\nremote_folder = \"builds\"\n");
    let output = run(project.mirakle().args(["config", "--json"]));

    assert!(output.status.success(), "config failed: {}", stderr(&output));
    let resolved: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(resolved["source"]["kind"], "native");
    assert_eq!(resolved["config"]["host"], "box");
    assert_eq!(resolved["config"]["remote_folder"], "builds");
}

#[test]
fn test_environment_host_is_applied() {
    init_test_logging();
    let project = TestProject::with_config("host = \"box\"\n");
    let output = run(project.mirakle().env("MIRAKLE_HOST", "env-box").arg("config"));

    assert!(output.status.success(), "config failed: {}", stderr(&output));
    assert_contains(&stdout(&output), "Host:              env-box");
}

#[test]
fn test_missing_host_exits_with_config_error() {
    init_test_logging();
    let project = TestProject::new();
    let output = run(project.mirakle().arg("config"));

    assert_eq!(output.status.code(), Some(1));
    assert_contains(&stderr(&output), "Mirakle host is not defined.");
}

#[test]
fn test_continuous_build_is_rejected() {
    init_test_logging();
    let project = TestProject::with_config("host = \"box\"\n");
    let output = run(project.mirakle().args(["run", "--", "build", "--continuous"]));

    assert_eq!(output.status.code(), Some(1));
    assert_contains(&stderr(&output), "--continuous is not supported yet");
}

#[cfg(unix)]
#[test]
fn test_opt_out_runs_local_build_with_its_exit_code() {
    init_test_logging();
    let project = TestProject::new();
    project.with_entrypoint(3);

    let output = run(project.mirakle().args(["--", "assemble", "-x", "mirakle"]));

    assert_eq!(output.status.code(), Some(3));
    assert_contains(&stdout(&output), "local assemble");
    assert!(!stdout(&output).contains("mirakle"));
}
