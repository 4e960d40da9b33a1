use std::fs;
use std::process::{Command, Output};

use tempfile::tempdir;

fn fieldstat(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fieldstat"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("run fieldstat cli")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn datasets_lists_the_bundled_trials() {
    let output = fieldstat(&["datasets"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("builtin:plant_growth"));
    assert!(text.contains("builtin:sorghum_rcbd"));
}

#[test]
fn fit_prints_tables_and_letters() {
    let output = fieldstat(&["fit", "builtin:plant_growth", "--formula", "weight ~ group"]);
    assert!(output.status.success(), "CLI exited with status {:?}", output.status);
    let text = stdout(&output);
    assert!(text.contains("Analysis of Variance Table"));
    assert!(text.contains("Compact letter display:"));
    assert!(text.contains("trt2"));
}

#[test]
fn summary_prints_group_statistics() {
    let output = fieldstat(&[
        "summary",
        "builtin:sorghum_rcbd",
        "--response",
        "yield",
        "--by",
        "genotype",
        "--no-plot",
    ]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Summary of yield by genotype:"));
}

#[test]
fn malformed_formula_fails_with_exit_code_one() {
    let output = fieldstat(&["fit", "builtin:plant_growth", "--formula", "weight group"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

#[test]
fn run_reads_a_toml_configuration() {
    let tmp = tempdir().expect("temporary directory");
    let config_path = tmp.path().join("sorghum.toml");
    let report_path = tmp.path().join("report.toml");
    let config = format!(
        "[data]\npath = \"builtin:sorghum_rcbd\"\n\n[model]\nformula = \"yield ~ genotype + (1 | block)\"\n\n[posthoc]\nadjust = \"holm\"\n\n[output]\nreport = {:?}\n",
        report_path.to_str().expect("path str")
    );
    fs::write(&config_path, config).expect("write config");

    let output = fieldstat(&["run", "--config", config_path.to_str().expect("path str")]);
    assert!(output.status.success(), "CLI exited with status {:?}", output.status);
    assert!(stdout(&output).contains("Compact letter display:"));
    assert!(report_path.exists(), "report.toml missing");
}

#[test]
fn compare_tests_the_larger_model() {
    let output = fieldstat(&[
        "compare",
        "builtin:sorghum_rcbd",
        "--small",
        "yield ~ block",
        "--big",
        "yield ~ genotype + block",
    ]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Model 1: yield ~ block"));
    assert!(text.contains("Model 2: yield ~ genotype + block"));
}
