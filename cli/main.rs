#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::process;

use fieldstat::anova::AnovaType;
use fieldstat::cld::Alphabet;
use fieldstat::comparisons::Adjustment;
use fieldstat::config::AnalysisConfig;
use fieldstat::data::LoadOptions;
use fieldstat::datasets::{BUILTIN_NAMES, BUILTIN_PREFIX, describe, load_source};
use fieldstat::design::Contrasts;
use fieldstat::formula::Formula;
use fieldstat::model::FitOptions;
use fieldstat::plot::PlotOptions;
use fieldstat::report::render_summary_table;
use fieldstat::workflow::{compare_models, explore, render_comparison, render_report, run_analysis};

#[derive(Clone, Copy, ValueEnum)]
pub enum ContrastsCli {
    Treatment,
    Sum,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum AnovaCli {
    Sequential,
    Marginal,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum AdjustmentCli {
    Tukey,
    Bonferroni,
    Holm,
    Sidak,
    None,
}

impl From<ContrastsCli> for Contrasts {
    fn from(value: ContrastsCli) -> Self {
        match value {
            ContrastsCli::Treatment => Contrasts::Treatment,
            ContrastsCli::Sum => Contrasts::Sum,
        }
    }
}

impl From<AnovaCli> for AnovaType {
    fn from(value: AnovaCli) -> Self {
        match value {
            AnovaCli::Sequential => AnovaType::Sequential,
            AnovaCli::Marginal => AnovaType::Marginal,
        }
    }
}

impl From<AdjustmentCli> for Adjustment {
    fn from(value: AdjustmentCli) -> Self {
        match value {
            AdjustmentCli::Tukey => Adjustment::Tukey,
            AdjustmentCli::Bonferroni => Adjustment::Bonferroni,
            AdjustmentCli::Holm => Adjustment::Holm,
            AdjustmentCli::Sidak => Adjustment::Sidak,
            AdjustmentCli::None => Adjustment::None,
        }
    }
}

#[derive(Args)]
pub struct SummaryArgs {
    /// CSV file, or builtin:<name> for a bundled dataset
    pub data: String,

    /// Numeric response column to summarize
    #[arg(long)]
    pub response: String,

    /// Factor whose levels form the groups
    #[arg(long)]
    pub by: String,

    /// Numeric columns to treat as factors
    #[arg(long = "factor", value_name = "COLUMN")]
    pub factors: Vec<String>,

    /// Field separator of the input file
    #[arg(long, default_value_t = ',')]
    pub separator: char,

    /// Skip the strip plot
    #[arg(long)]
    pub no_plot: bool,

    #[arg(long, default_value_t = 72)]
    pub width: u16,

    #[arg(long, default_value_t = 20)]
    pub height: u16,
}

#[derive(Args)]
pub struct FitArgs {
    /// CSV file, or builtin:<name> for a bundled dataset
    pub data: String,

    /// Model formula, e.g. "yield ~ genotype + (1 | block)"
    #[arg(long)]
    pub formula: String,

    /// Numeric columns to treat as factors
    #[arg(long = "factor", value_name = "COLUMN")]
    pub factors: Vec<String>,

    /// Field separator of the input file
    #[arg(long, default_value_t = ',')]
    pub separator: char,

    /// Fit mixed models by maximum likelihood instead of REML
    #[arg(long)]
    pub ml: bool,

    /// Factor coding of the fixed effects
    #[arg(long, value_enum, default_value_t = ContrastsCli::Treatment)]
    pub contrasts: ContrastsCli,

    /// ANOVA table; sequential for linear and marginal for mixed models by default
    #[arg(long, value_enum)]
    pub anova: Option<AnovaCli>,

    /// Means to separate, e.g. "genotype" or "genotype | location"; repeatable
    #[arg(long = "emmeans", value_name = "SPEC")]
    pub emmeans: Vec<String>,

    /// Skip marginal means and mean separation
    #[arg(long)]
    pub no_posthoc: bool,

    /// Multiplicity adjustment of the pairwise comparisons
    #[arg(long, value_enum, default_value_t = AdjustmentCli::Tukey)]
    pub adjust: AdjustmentCli,

    /// Significance level of the letter display
    #[arg(long, default_value_t = 0.05)]
    pub alpha: f64,

    /// Confidence level of all intervals
    #[arg(long, default_value_t = 0.95)]
    pub level: f64,

    /// Label groups with numbers instead of letters
    #[arg(long)]
    pub numbers: bool,

    /// Order the letter display from the largest mean down
    #[arg(long)]
    pub descending: bool,

    /// Print the exploratory strip plot and the residual diagnostic charts
    #[arg(long)]
    pub plots: bool,

    /// Write per-observation residual diagnostics to this CSV file
    #[arg(long, value_name = "PATH")]
    pub diagnostics_out: Option<String>,

    /// Save the full report as TOML
    #[arg(long, value_name = "PATH")]
    pub report_out: Option<String>,
}

#[derive(Args)]
pub struct CompareArgs {
    /// CSV file, or builtin:<name> for a bundled dataset
    pub data: String,

    /// Formula of the smaller model
    #[arg(long)]
    pub small: String,

    /// Formula of the larger model
    #[arg(long)]
    pub big: String,

    /// Numeric columns to treat as factors
    #[arg(long = "factor", value_name = "COLUMN")]
    pub factors: Vec<String>,

    /// Field separator of the input file
    #[arg(long, default_value_t = ',')]
    pub separator: char,
}

#[derive(Parser)]
#[command(
    name = "fieldstat",
    about = "Linear and mixed models for field trials with mean separation",
    long_about = "Fits linear models and random-intercept mixed models to plot-level trial data, \
                 prints coefficient and ANOVA tables, residual diagnostics, estimated marginal \
                 means, pairwise comparisons and compact letter displays."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Summarize a response by the levels of a factor")]
    Summary(SummaryArgs),

    #[command(about = "Fit a model and separate its means")]
    Fit(FitArgs),

    #[command(about = "Run an analysis described by a TOML file")]
    Run {
        /// Analysis configuration (.toml)
        #[arg(long, value_name = "PATH")]
        config: String,
    },

    #[command(about = "Compare two nested models")]
    Compare(CompareArgs),

    #[command(about = "List the bundled datasets")]
    Datasets,
}

fn load_options(separator: char, factors: &[String]) -> Result<LoadOptions, String> {
    if !separator.is_ascii() {
        return Err(format!("The separator '{separator}' is not a single ASCII character."));
    }
    Ok(LoadOptions {
        separator: separator as u8,
        factors: factors.to_vec(),
    })
}

fn run_summary(args: SummaryArgs) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("> Loading {}", args.data);
    let mut factors = args.factors.clone();
    if !factors.contains(&args.by) {
        factors.push(args.by.clone());
    }
    let data = load_source(&args.data, &load_options(args.separator, &factors)?)?;
    let plot = PlotOptions {
        width: args.width,
        height: args.height,
    };
    let (summary, rendered) = explore(
        &data,
        &args.response,
        &args.by,
        (!args.no_plot).then_some(&plot),
    )?;
    print!("{}", render_summary_table(&summary));
    if let Some(rendered) = rendered {
        println!();
        print!("{}", rendered.text);
    }
    Ok(())
}

fn config_from_args(args: FitArgs) -> AnalysisConfig {
    let mut config = AnalysisConfig::new(&args.data, &args.formula);
    config.data.separator = args.separator;
    config.data.factors = args.factors;
    config.model.reml = !args.ml;
    config.model.contrasts = args.contrasts.into();
    config.model.anova = args.anova.map(Into::into);
    config.model.confidence_level = args.level;
    config.posthoc.enabled = !args.no_posthoc;
    config.posthoc.emmeans = args.emmeans;
    config.posthoc.adjust = args.adjust.into();
    config.posthoc.alpha = args.alpha;
    config.posthoc.alphabet = if args.numbers {
        Alphabet::Numbers
    } else {
        Alphabet::Letters
    };
    config.posthoc.descending = args.descending;
    config.output.plots = args.plots;
    config.output.diagnostics = args.diagnostics_out;
    config.output.report = args.report_out;
    config
}

fn run_config(config: &AnalysisConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("> Fitting '{}' to {}", config.model.formula, config.data.path);
    let report = run_analysis(config)?;
    print!("{}", render_report(&report));
    if let Some(path) = &config.output.diagnostics {
        eprintln!("> Diagnostics written to {path}");
    }
    if let Some(path) = &config.output.report {
        eprintln!("> Report written to {path}");
    }
    Ok(())
}

fn run_compare(args: CompareArgs) -> Result<(), Box<dyn std::error::Error>> {
    let data = load_source(&args.data, &load_options(args.separator, &args.factors)?)?;
    let small = Formula::parse(&args.small)?;
    let big = Formula::parse(&args.big)?;
    eprintln!("> Comparing '{small}' with '{big}'");
    let comparison = compare_models(&data, &small, &big, &FitOptions::default())?;
    print!("{}", render_comparison(&comparison));
    Ok(())
}

fn list_datasets() {
    for name in BUILTIN_NAMES {
        println!(
            "{BUILTIN_PREFIX}{name:<16} {}",
            describe(name).unwrap_or_default()
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Summary(args)) => run_summary(args),
        Some(Commands::Fit(args)) => run_config(&config_from_args(args)),
        Some(Commands::Run { config }) => {
            AnalysisConfig::load(&config).map_err(Into::into).and_then(|c| run_config(&c))
        }
        Some(Commands::Compare(args)) => run_compare(args),
        Some(Commands::Datasets) => {
            list_datasets();
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}
