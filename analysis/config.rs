//! Analysis configuration.
//!
//! A whole analysis is described by one TOML document:
//!
//! ```toml
//! [data]
//! path = "trial.csv"          # or "builtin:sorghum_rcbd"
//! factors = ["block"]
//!
//! [model]
//! formula = "yield ~ genotype + (1 | block)"
//!
//! [posthoc]
//! emmeans = ["genotype"]
//! adjust = "tukey"
//!
//! [output]
//! plots = true
//! ```
//!
//! Everything except `data.path` and `model.formula` has a default.

use crate::anova::AnovaType;
use crate::cld::{Alphabet, CldOptions};
use crate::comparisons::Adjustment;
use crate::data::LoadOptions;
use crate::design::Contrasts;
use crate::diagnostics::DEFAULT_OUTLIER_THRESHOLD;
use crate::emmeans::{EmmSpec, EmmeansError};
use crate::formula::{Formula, FormulaError};
use crate::model::FitOptions;
use crate::plot::PlotOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read the configuration file '{path}': {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse the analysis configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize the analysis configuration: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid model formula in [model]: {0}")]
    Formula(#[from] FormulaError),
    #[error("Invalid means specification in [posthoc]: {0}")]
    Emmeans(#[from] EmmeansError),
    #[error("{name} must lie strictly between 0 and 1, got {value}.")]
    OutOfUnitInterval { name: &'static str, value: f64 },
    #[error("The separator '{0}' is not a single ASCII character.")]
    InvalidSeparator(char),
    #[error("The outlier threshold must be positive, got {0}.")]
    InvalidThreshold(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub posthoc: PosthocConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// A CSV path or `builtin:<name>`.
    pub path: String,
    #[serde(default = "default_separator")]
    pub separator: char,
    /// Numeric columns to treat as factors.
    #[serde(default)]
    pub factors: Vec<String>,
    /// Summarize the response by the first factor of the model before fitting.
    #[serde(default = "default_true")]
    pub explore: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub formula: String,
    #[serde(default = "default_true")]
    pub reml: bool,
    #[serde(default)]
    pub contrasts: Contrasts,
    /// Defaults to sequential for linear and marginal for mixed models.
    #[serde(default)]
    pub anova: Option<AnovaType>,
    #[serde(default = "default_level")]
    pub confidence_level: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PosthocConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Means specifications; empty selects every factor main effect.
    #[serde(default)]
    pub emmeans: Vec<String>,
    #[serde(default)]
    pub adjust: Adjustment,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub alphabet: Alphabet,
    #[serde(default)]
    pub descending: bool,
}

impl Default for PosthocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            emmeans: Vec::new(),
            adjust: Adjustment::default(),
            alpha: default_alpha(),
            alphabet: Alphabet::default(),
            descending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub plots: bool,
    #[serde(default = "default_plot_width")]
    pub plot_width: u16,
    #[serde(default = "default_plot_height")]
    pub plot_height: u16,
    #[serde(default)]
    pub diagnostics: Option<String>,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            plots: false,
            plot_width: default_plot_width(),
            plot_height: default_plot_height(),
            diagnostics: None,
            report: None,
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
        }
    }
}

fn default_separator() -> char {
    ','
}
fn default_true() -> bool {
    true
}
fn default_level() -> f64 {
    0.95
}
fn default_alpha() -> f64 {
    0.05
}
fn default_max_iterations() -> usize {
    FitOptions::default().max_iterations
}
fn default_tolerance() -> f64 {
    FitOptions::default().tolerance
}
fn default_plot_width() -> u16 {
    PlotOptions::default().width
}
fn default_plot_height() -> u16 {
    PlotOptions::default().height
}
fn default_outlier_threshold() -> f64 {
    DEFAULT_OUTLIER_THRESHOLD
}

impl AnalysisConfig {
    /// A configuration with defaults everywhere except the two required keys.
    pub fn new(path: &str, formula: &str) -> Self {
        Self {
            data: DataConfig {
                path: path.to_string(),
                separator: default_separator(),
                factors: Vec::new(),
                explore: true,
            },
            model: ModelConfig {
                formula: formula.to_string(),
                reml: true,
                contrasts: Contrasts::default(),
                anova: None,
                confidence_level: default_level(),
                max_iterations: default_max_iterations(),
                tolerance: default_tolerance(),
            },
            posthoc: PosthocConfig::default(),
            output: OutputConfig::default(),
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AnalysisConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded analysis configuration from {path}");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every value that can be checked before touching the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &'static str, value: f64| {
            if value > 0.0 && value < 1.0 {
                Ok(())
            } else {
                Err(ConfigError::OutOfUnitInterval { name, value })
            }
        };
        unit("model.confidence_level", self.model.confidence_level)?;
        unit("posthoc.alpha", self.posthoc.alpha)?;
        if !self.data.separator.is_ascii() {
            return Err(ConfigError::InvalidSeparator(self.data.separator));
        }
        if !(self.output.outlier_threshold > 0.0) {
            return Err(ConfigError::InvalidThreshold(self.output.outlier_threshold));
        }
        self.formula()?;
        self.emm_specs()?;
        Ok(())
    }

    pub fn formula(&self) -> Result<Formula, ConfigError> {
        Ok(Formula::parse(&self.model.formula)?)
    }

    /// The requested means specifications, empty when none were named.
    pub fn emm_specs(&self) -> Result<Vec<EmmSpec>, ConfigError> {
        self.posthoc
            .emmeans
            .iter()
            .map(|text| EmmSpec::parse(text).map_err(ConfigError::from))
            .collect()
    }

    pub fn load_options(&self) -> LoadOptions {
        let mut buffer = [0u8; 4];
        LoadOptions {
            separator: self.data.separator.encode_utf8(&mut buffer).as_bytes()[0],
            factors: self.data.factors.clone(),
        }
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            contrasts: self.model.contrasts,
            reml: self.model.reml,
            confidence_level: self.model.confidence_level,
            max_iterations: self.model.max_iterations,
            tolerance: self.model.tolerance,
        }
    }

    pub fn cld_options(&self) -> CldOptions {
        CldOptions {
            alphabet: self.posthoc.alphabet,
            descending: self.posthoc.descending,
        }
    }

    pub fn plot_options(&self) -> PlotOptions {
        PlotOptions {
            width: self.output.plot_width,
            height: self.output.plot_height,
        }
    }

    /// The omnibus table to build for a linear (`mixed == false`) or mixed fit.
    pub fn anova_type(&self, mixed: bool) -> AnovaType {
        self.model.anova.unwrap_or(if mixed {
            AnovaType::Marginal
        } else {
            AnovaType::Sequential
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[data]
path = "builtin:plant_growth"

[model]
formula = "weight ~ group"
"#;

    #[test]
    fn minimal_document_takes_defaults() {
        let config = AnalysisConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config, AnalysisConfig::new("builtin:plant_growth", "weight ~ group"));
        assert_eq!(config.posthoc.adjust, Adjustment::Tukey);
        assert_eq!(config.load_options().separator, b',');
        assert_eq!(config.anova_type(false), AnovaType::Sequential);
        assert_eq!(config.anova_type(true), AnovaType::Marginal);
        assert!(config.emm_specs().unwrap().is_empty());
    }

    #[test]
    fn full_document_sets_every_section() {
        let text = r#"
[data]
path = "trial.tsv"
separator = "\t"
factors = ["block"]
explore = false

[model]
formula = "yield ~ genotype + (1 | block)"
reml = false
contrasts = "sum"
anova = "marginal"
confidence_level = 0.9

[posthoc]
emmeans = ["genotype"]
adjust = "bonferroni"
alpha = 0.1
alphabet = "numbers"
descending = true

[output]
plots = true
plot_width = 60
plot_height = 16
diagnostics = "diag.csv"
report = "report.toml"
"#;
        let config = AnalysisConfig::from_toml_str(text).unwrap();
        assert_eq!(config.load_options().separator, b'\t');
        assert_eq!(config.load_options().factors, vec!["block"]);
        let fit = config.fit_options();
        assert!(!fit.reml);
        assert_eq!(fit.contrasts, Contrasts::Sum);
        assert_eq!(config.anova_type(false), AnovaType::Marginal);
        assert_eq!(config.emm_specs().unwrap(), vec![EmmSpec::single("genotype")]);
        assert_eq!(config.posthoc.adjust, Adjustment::Bonferroni);
        assert_eq!(
            config.cld_options(),
            CldOptions {
                alphabet: Alphabet::Numbers,
                descending: true
            }
        );
        assert_eq!(config.plot_options(), PlotOptions { width: 60, height: 16 });
        assert_eq!(config.output.report.as_deref(), Some("report.toml"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_alpha = MINIMAL.replace("[model]", "[posthoc]\nalpha = 1.5\n\n[model]");
        assert!(matches!(
            AnalysisConfig::from_toml_str(&bad_alpha),
            Err(ConfigError::OutOfUnitInterval { name: "posthoc.alpha", .. })
        ));
        let bad_formula = MINIMAL.replace("weight ~ group", "weight group");
        assert!(matches!(
            AnalysisConfig::from_toml_str(&bad_formula),
            Err(ConfigError::Formula(_))
        ));
        let bad_adjust = format!("{MINIMAL}\n[posthoc]\nadjust = \"scheffe\"\n");
        assert!(matches!(
            AnalysisConfig::from_toml_str(&bad_adjust),
            Err(ConfigError::TomlParseError(_))
        ));
        let unknown_key = MINIMAL.replace("[model]", "[model]\nweights = \"w\"");
        assert!(AnalysisConfig::from_toml_str(&unknown_key).is_err());
    }

    #[test]
    fn configuration_survives_a_round_trip() {
        let mut config = AnalysisConfig::new("builtin:sorghum_rcbd", "yield ~ genotype + (1 | block)");
        config.posthoc.emmeans = vec!["genotype".to_string()];
        config.output.report = Some("out.toml".to_string());
        let text = config.to_toml_string().unwrap();
        assert_eq!(AnalysisConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = AnalysisConfig::load("/nonexistent/analysis.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/analysis.toml"));
    }
}
