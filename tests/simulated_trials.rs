use approx::{assert_abs_diff_eq, assert_relative_eq};
use fieldstat::anova::{AnovaType, anova};
use fieldstat::cld::{CldOptions, compact_letter_display};
use fieldstat::comparisons::{Adjustment, pairwise};
use fieldstat::data::{FieldData, LoadOptions, load_csv_str};
use fieldstat::diagnostics::{DEFAULT_OUTLIER_THRESHOLD, residual_diagnostics};
use fieldstat::emmeans::{EmmSpec, estimated_marginal_means};
use fieldstat::formula::Formula;
use fieldstat::model::{FitOptions, FittedModel, ModelFit, fit_model};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const GENOTYPE_MEANS: [f64; 6] = [10.0, 10.0, 12.0, 12.0, 14.0, 8.0];
const BLOCKS: usize = 4;

/// A randomized complete block trial with block effects of sd 1 and plot
/// errors of sd 0.3, written out as CSV and read back.
fn simulate_rcbd(seed: u64) -> FieldData {
    let mut rng = StdRng::seed_from_u64(seed);
    let block_effect = Normal::new(0.0, 1.0).unwrap();
    let plot_error = Normal::new(0.0, 0.3).unwrap();
    let blocks: Vec<f64> = (0..BLOCKS).map(|_| block_effect.sample(&mut rng)).collect();

    let mut csv = String::from("yield,genotype,block\n");
    for (b, effect) in blocks.iter().enumerate() {
        for (g, mean) in GENOTYPE_MEANS.iter().enumerate() {
            let value = mean + effect + plot_error.sample(&mut rng);
            csv.push_str(&format!("{value:.4},G{},{}\n", g + 1, b + 1));
        }
    }
    let options = LoadOptions {
        factors: vec!["block".to_string()],
        ..LoadOptions::default()
    };
    load_csv_str(&csv, &options).unwrap()
}

fn fit(formula: &str, data: &FieldData) -> ModelFit {
    fit_model(&Formula::parse(formula).unwrap(), data, &FitOptions::default()).unwrap()
}

#[test]
fn random_blocks_reproduce_the_fixed_block_genotype_test() {
    let data = simulate_rcbd(7);
    let fixed = fit("yield ~ genotype + block", &data);
    let mixed = fit("yield ~ genotype + (1 | block)", &data);

    let fixed_table = anova(&fixed, AnovaType::Sequential).unwrap();
    let mixed_table = anova(&mixed, AnovaType::Marginal).unwrap();
    let fixed_row = fixed_table.row("genotype").unwrap();
    let mixed_row = mixed_table.row("genotype").unwrap();

    assert_abs_diff_eq!(mixed_row.df, 5.0);
    assert_relative_eq!(
        mixed_row.f_value.unwrap(),
        fixed_row.f_value.unwrap(),
        max_relative = 1e-3
    );
    assert_abs_diff_eq!(mixed_row.den_df.unwrap(), 15.0, epsilon = 0.1);

    // In a balanced trial the residual variance equals the error mean square.
    let residual_ms = fixed_table.row("Residuals").unwrap().mean_sq;
    let lmm = mixed.as_mixed().unwrap();
    assert_relative_eq!(lmm.residual_variance, residual_ms, max_relative = 1e-3);
    assert!(!lmm.singular);
    assert!(lmm.component("block").unwrap().variance > lmm.residual_variance);
}

#[test]
fn genotype_means_are_block_adjusted_and_separated() {
    let data = simulate_rcbd(11);
    let mixed = fit("yield ~ genotype + (1 | block)", &data);
    let emm = estimated_marginal_means(&mixed, &EmmSpec::single("genotype"), 0.95).unwrap();
    assert_eq!(emm.rows.len(), 6);
    for (row, truth) in emm.rows.iter().zip(GENOTYPE_MEANS) {
        // Block effects shift every genotype alike, so compare differences.
        let shift = emm.rows[0].emmean - GENOTYPE_MEANS[0];
        assert_abs_diff_eq!(row.emmean - shift, truth, epsilon = 0.8);
        assert!(row.lower < row.emmean && row.emmean < row.upper);
    }

    let comparisons = pairwise(&mixed, &emm, Adjustment::Tukey, 0.95);
    assert_eq!(comparisons.rows.len(), 15);
    let letters = compact_letter_display(&emm, &comparisons, 0.05, CldOptions::default());
    let shares = |a: &str, b: &str| {
        let first = letters.group_of(a).unwrap();
        let second = letters.group_of(b).unwrap();
        first.chars().any(|c| second.contains(c))
    };
    assert!(shares("G1", "G2"));
    assert!(shares("G3", "G4"));
    assert!(!shares("G1", "G3"));
    assert!(!shares("G5", "G3"));
    assert!(!shares("G6", "G1"));
    // Lowest mean first, labelled 'a'.
    assert_eq!(letters.rows[0].level, "G6");
    assert_eq!(letters.rows[0].group, "a");
}

#[test]
fn maximum_likelihood_fits_take_satterthwaite_df_from_their_own_deviance() {
    let data = simulate_rcbd(7);
    let formula = Formula::parse("yield ~ genotype + (1 | block)").unwrap();
    let reml = fit_model(&formula, &data, &FitOptions::default()).unwrap();
    let ml_options = FitOptions {
        reml: false,
        ..FitOptions::default()
    };
    let ml = fit_model(&formula, &data, &ml_options).unwrap();
    let difference_df = |fit: &ModelFit| {
        let emm = estimated_marginal_means(fit, &EmmSpec::single("genotype"), 0.95).unwrap();
        pairwise(fit, &emm, Adjustment::None, 0.95).rows[0].df
    };
    // Within-block contrasts get n - b - (g - 1) = 15 df from the restricted
    // deviance; the ML deviance gives n - b = 20, capped at n - p = 18.
    assert_abs_diff_eq!(difference_df(&reml), 15.0, epsilon = 0.1);
    assert_abs_diff_eq!(difference_df(&ml), 18.0, epsilon = 0.1);
}

#[test]
fn tukey_is_never_more_liberal_than_unadjusted_tests() {
    let data = simulate_rcbd(3);
    let mixed = fit("yield ~ genotype + (1 | block)", &data);
    let emm = estimated_marginal_means(&mixed, &EmmSpec::single("genotype"), 0.95).unwrap();
    let raw = pairwise(&mixed, &emm, Adjustment::None, 0.95);
    let tukey = pairwise(&mixed, &emm, Adjustment::Tukey, 0.95);
    let holm = pairwise(&mixed, &emm, Adjustment::Holm, 0.95);
    for ((r, t), h) in raw.rows.iter().zip(&tukey.rows).zip(&holm.rows) {
        assert!(t.p_value >= r.p_value - 1e-10);
        assert!(h.p_value >= r.p_value - 1e-10);
        assert!(t.upper - t.lower >= r.upper - r.lower);
    }
}

#[test]
fn missing_plots_are_dropped_before_fitting() {
    let data = simulate_rcbd(5);
    let mut csv = String::from("yield,genotype,block\n");
    let yields = data.numeric("yield").unwrap();
    let genotypes = data.factor("genotype").unwrap();
    let blocks = data.factor("block").unwrap();
    for row in 0..data.n_rows() {
        // Row 4 is lost and row 10 is a gross recording error.
        let value = match row {
            4 => "NA".to_string(),
            10 => format!("{}", yields[row] + 20.0),
            _ => format!("{}", yields[row]),
        };
        csv.push_str(&format!(
            "{value},{},{}\n",
            genotypes.label(row).unwrap(),
            blocks.label(row).unwrap()
        ));
    }
    let options = LoadOptions {
        factors: vec!["block".to_string()],
        ..LoadOptions::default()
    };
    let with_gap = load_csv_str(&csv, &options).unwrap();
    let mixed = fit("yield ~ genotype + (1 | block)", &with_gap);
    assert_eq!(mixed.n_obs(), 23);
    assert_eq!(mixed.as_mixed().unwrap().dropped_rows, 1);
    let emm = estimated_marginal_means(&mixed, &EmmSpec::single("genotype"), 0.95).unwrap();
    assert_eq!(emm.rows.len(), 6);

    // Observations keep the numbers of their data rows.
    let mixed_rows = residual_diagnostics(&mixed).rows;
    assert_eq!(mixed_rows[3].index, 3);
    assert_eq!(mixed_rows[4].index, 5);
    assert_eq!(mixed_rows.last().unwrap().index, 23);

    let fixed = fit("yield ~ genotype + block", &with_gap);
    let diagnostics = residual_diagnostics(&fixed);
    assert_eq!(diagnostics.flagged(DEFAULT_OUTLIER_THRESHOLD), vec![10]);
}
