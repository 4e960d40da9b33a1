use std::fs;

use approx::assert_abs_diff_eq;
use fieldstat::anova::AnovaType;
use fieldstat::config::AnalysisConfig;
use fieldstat::report::AnalysisReport;
use fieldstat::workflow::{render_report, run_analysis};
use tempfile::tempdir;

// Four nitrogen rates in three blocks; one plot was lost.
const NITROGEN_TRIAL: &str = "plot\tblock\tnitrogen\tyield
1\t1\tN0\t3.1
2\t1\tN60\t4.0
3\t1\tN120\t4.9
4\t1\tN180\t5.0
5\t2\tN0\t2.7
6\t2\tN60\t3.8
7\t2\tN120\tNA
8\t2\tN180\t4.6
9\t3\tN0\t3.4
10\t3\tN60\t4.3
11\t3\tN120\t5.1
12\t3\tN180\t5.3
";

fn write_config(dir: &std::path::Path, body: &str) -> String {
    let data_path = dir.join("nitrogen.tsv");
    fs::write(&data_path, NITROGEN_TRIAL).unwrap();
    let config_path = dir.join("analysis.toml");
    let text = format!(
        "[data]\npath = {:?}\nseparator = \"\\t\"\nfactors = [\"block\"]\n\n{body}",
        data_path.to_str().unwrap()
    );
    fs::write(&config_path, text).unwrap();
    config_path.to_str().unwrap().to_string()
}

#[test]
fn configured_linear_analysis_writes_every_output() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("report.toml");
    let diagnostics_path = dir.path().join("residuals.csv");
    let body = format!(
        "[model]\nformula = \"yield ~ nitrogen + block\"\n\n[posthoc]\nemmeans = [\"nitrogen\"]\nadjust = \"tukey\"\n\n[output]\nplots = true\ndiagnostics = {:?}\nreport = {:?}\n",
        diagnostics_path.to_str().unwrap(),
        report_path.to_str().unwrap()
    );
    let config = AnalysisConfig::load(&write_config(dir.path(), &body)).unwrap();
    let report = run_analysis(&config).unwrap();

    assert_eq!(report.n_obs, 11);
    assert_eq!(report.dropped_rows, 1);
    assert_eq!(report.anova.kind, AnovaType::Sequential);
    assert_eq!(report.fit.df_residual, Some(5.0));
    let nitrogen = report.anova.row("nitrogen").unwrap();
    assert_abs_diff_eq!(nitrogen.df, 3.0);
    assert!(nitrogen.p_value.unwrap() < 0.01);

    // Levels keep their natural order.
    let levels: Vec<&str> = report.posthoc[0]
        .emmeans
        .rows
        .iter()
        .map(|r| r.levels[0].as_str())
        .collect();
    assert_eq!(levels, vec!["N0", "N60", "N120", "N180"]);
    assert_eq!(report.posthoc[0].pairwise.rows.len(), 6);
    let letters = &report.posthoc[0].letters;
    assert!(letters.group_of("N0").unwrap() != letters.group_of("N180").unwrap());

    assert_eq!(report.plots.len(), 2);
    assert!(report.plots[0].text.contains("yield by nitrogen"));
    assert!(report.plots[0].text.contains("N180"));

    let diagnostics = fs::read_to_string(&diagnostics_path).unwrap();
    assert_eq!(diagnostics.lines().count(), 12);

    let saved = AnalysisReport::load(report_path.to_str().unwrap()).unwrap();
    assert_eq!(saved.coefficients, report.coefficients);
    assert_eq!(saved.anova, report.anova);
    assert_eq!(saved.plots, report.plots);

    let text = render_report(&report);
    assert!(text.contains("(1 rows with missing values removed)"));
    assert!(text.contains("Summary of yield by nitrogen:"));
    assert!(text.contains("Compact letter display:"));
}

#[test]
fn configured_mixed_analysis_uses_satterthwaite_tests() {
    let dir = tempdir().unwrap();
    let body = "[model]\nformula = \"yield ~ nitrogen + (1 | block)\"\n\n[posthoc]\nalpha = 0.01\nalphabet = \"numbers\"\ndescending = true\n";
    let config = AnalysisConfig::load(&write_config(dir.path(), body)).unwrap();
    let report = run_analysis(&config).unwrap();

    assert!(report.mixed);
    assert_eq!(report.anova.kind, AnovaType::Marginal);
    assert!(report.anova.row("nitrogen").unwrap().den_df.is_some());
    assert_eq!(report.variance_components[0].group, "block");
    assert_eq!(report.variance_components[0].n_levels, 3);
    let letters = &report.posthoc[0].letters;
    assert_eq!(letters.alpha, 0.01);
    assert!(letters.rows[0].group.starts_with('1'));
    assert!(letters.rows[0].emmean >= letters.rows[1].emmean);
}

#[test]
fn configuration_errors_name_the_problem() {
    let dir = tempdir().unwrap();
    let body = "[model]\nformula = \"yield ~ nitrogen\"\nconfidence_level = 95\n";
    let err = AnalysisConfig::load(&write_config(dir.path(), body)).unwrap_err();
    assert!(err.to_string().contains("confidence_level"));

    let body = "[model]\nformula = \"yield ~ fertilizer\"\n";
    let config = AnalysisConfig::load(&write_config(dir.path(), body)).unwrap();
    let err = run_analysis(&config).unwrap_err();
    assert!(err.to_string().contains("fertilizer"));
}
