// =============================================================================
// Statistical Inference Helpers
// =============================================================================
//
// Thin wrappers around the reference distributions used by the model tables:
//   - p-values for t, F and chi-squared statistics
//   - t quantiles and t-based confidence intervals
//   - significance stars for printed tables
//
// Degrees of freedom may be fractional (Satterthwaite) or infinite.
// =============================================================================

use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, StudentsT};
use statrs::function::erf::{erfc, erfc_inv};
use std::f64::consts::SQRT_2;

/// Degrees of freedom above which the t distribution is replaced by the normal.
const NORMAL_APPROXIMATION_DF: f64 = 1e7;

/// Upper tail of the standard normal distribution.
fn normal_sf(x: f64) -> f64 {
    0.5 * erfc(x / SQRT_2)
}

/// Two-sided p-value of a t statistic.
pub fn pvalue_t(t: f64, df: f64) -> f64 {
    if !t.is_finite() || df.is_nan() || df <= 0.0 {
        return f64::NAN;
    }
    if df > NORMAL_APPROXIMATION_DF {
        return 2.0 * normal_sf(t.abs());
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).min(1.0),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail p-value of an F statistic.
pub fn pvalue_f(f: f64, df1: f64, df2: f64) -> f64 {
    if !f.is_finite() || df1 <= 0.0 || df2.is_nan() || df2 <= 0.0 {
        return f64::NAN;
    }
    if f <= 0.0 {
        return 1.0;
    }
    if df2 > NORMAL_APPROXIMATION_DF {
        return pvalue_chisq(f * df1, df1);
    }
    match FisherSnedecor::new(df1, df2) {
        Ok(dist) => dist.sf(f),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail p-value of a chi-squared statistic.
pub fn pvalue_chisq(x: f64, df: f64) -> f64 {
    if !x.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(x),
        Err(_) => f64::NAN,
    }
}

/// Quantile `p` of the t distribution with `df` degrees of freedom.
pub fn t_quantile(p: f64, df: f64) -> f64 {
    if df.is_nan() || df <= 0.0 || !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if df > NORMAL_APPROXIMATION_DF {
        return normal_quantile(p);
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => dist.inverse_cdf(p),
        Err(_) => f64::NAN,
    }
}

/// Quantile `p` of the standard normal distribution.
pub fn normal_quantile(p: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    -SQRT_2 * erfc_inv(2.0 * p)
}

/// Standard normal distribution function.
pub fn normal_cdf(x: f64) -> f64 {
    normal_sf(-x)
}

/// Two-sided t-based confidence interval at the given confidence level.
pub fn confidence_interval_t(estimate: f64, std_error: f64, df: f64, level: f64) -> (f64, f64) {
    if !estimate.is_finite() || !std_error.is_finite() || std_error < 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let margin = t_quantile(1.0 - (1.0 - level) / 2.0, df) * std_error;
    (estimate - margin, estimate + margin)
}

/// Stars used in coefficient and ANOVA tables.
pub fn significance_stars(p_value: f64) -> &'static str {
    if p_value.is_nan() {
        ""
    } else if p_value < 0.001 {
        "***"
    } else if p_value < 0.01 {
        "**"
    } else if p_value < 0.05 {
        "*"
    } else if p_value < 0.1 {
        "."
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn t_pvalues_match_tables() {
        assert_abs_diff_eq!(pvalue_t(0.0, 10.0), 1.0, epsilon = 1e-12);
        // Two-sided 5% critical value for 10 df.
        assert_abs_diff_eq!(pvalue_t(2.228139, 10.0), 0.05, epsilon = 1e-5);
        assert_abs_diff_eq!(pvalue_t(-2.228139, 10.0), 0.05, epsilon = 1e-5);
        assert!(pvalue_t(f64::NAN, 10.0).is_nan());
        assert!(pvalue_t(1.0, 0.0).is_nan());
    }

    #[test]
    fn f_pvalue_of_plant_growth_anova() {
        assert_abs_diff_eq!(pvalue_f(4.846088, 2.0, 27.0), 0.01591, epsilon = 1e-4);
        assert_eq!(pvalue_f(0.0, 2.0, 27.0), 1.0);
    }

    #[test]
    fn chisq_and_quantiles() {
        assert_abs_diff_eq!(pvalue_chisq(3.841459, 1.0), 0.05, epsilon = 1e-6);
        assert_abs_diff_eq!(t_quantile(0.975, 1e9), 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(t_quantile(0.975, 27.0), 2.051831, epsilon = 1e-5);
        let (lo, hi) = confidence_interval_t(1.0, 0.5, 27.0, 0.95);
        assert_abs_diff_eq!(hi - 1.0, 1.0 - lo, epsilon = 1e-12);
        assert_abs_diff_eq!(hi - 1.0, 0.5 * 2.051831, epsilon = 1e-5);
    }

    #[test]
    fn normal_distribution_from_the_complementary_error_function() {
        assert_abs_diff_eq!(normal_cdf(1.959964), 0.975, epsilon = 1e-7);
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(normal_quantile(0.025), -1.959964, epsilon = 1e-6);
        assert_eq!(normal_quantile(0.0), f64::NEG_INFINITY);
        assert!(normal_quantile(1.5).is_nan());
        assert_abs_diff_eq!(pvalue_t(1.959964, 1e9), 0.05, epsilon = 1e-6);
    }

    #[test]
    fn stars_follow_the_usual_cutoffs() {
        assert_eq!(significance_stars(0.0001), "***");
        assert_eq!(significance_stars(0.005), "**");
        assert_eq!(significance_stars(0.03), "*");
        assert_eq!(significance_stars(0.07), ".");
        assert_eq!(significance_stars(0.5), "");
    }
}
