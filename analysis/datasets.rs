//! Built-in datasets for trying the workflow without a file at hand.

use crate::data::{DataError, FieldData, LoadOptions, load_csv_str};

/// Prefix that selects a built-in dataset wherever a data path is accepted.
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Names accepted by [`builtin`].
pub const BUILTIN_NAMES: &[&str] = &["plant_growth", "sorghum_rcbd"];

/// Dried plant weights from a completely randomised experiment comparing a
/// control with two treatments, ten plots each.
const PLANT_GROWTH: &str = "weight,group
4.17,ctrl
5.58,ctrl
5.18,ctrl
6.11,ctrl
4.50,ctrl
4.61,ctrl
5.17,ctrl
4.53,ctrl
5.33,ctrl
5.14,ctrl
4.81,trt1
4.17,trt1
4.41,trt1
3.59,trt1
5.87,trt1
3.83,trt1
6.03,trt1
4.89,trt1
4.32,trt1
4.69,trt1
6.31,trt2
5.12,trt2
5.54,trt2
5.50,trt2
5.37,trt2
5.29,trt2
4.92,trt2
6.15,trt2
5.80,trt2
5.26,trt2
";

/// Grain yield (t/ha) of five sorghum genotypes in a randomised complete
/// block design with four blocks.
const SORGHUM_RCBD: &str = "yield,genotype,block
3.40,G1,1
4.04,G2,1
3.01,G3,1
4.49,G4,1
3.48,G5,1
2.86,G1,2
3.60,G2,2
2.58,G3,2
4.19,G4,2
3.14,G5,2
3.27,G1,3
3.73,G2,3
2.50,G3,3
4.45,G4,3
3.49,G5,3
2.89,G1,4
3.00,G2,4
2.09,G3,4
3.74,G4,4
2.92,G5,4
";

/// Loads a built-in dataset by name.
pub fn builtin(name: &str) -> Result<FieldData, DataError> {
    match name {
        "plant_growth" => load_csv_str(PLANT_GROWTH, &LoadOptions::default()),
        "sorghum_rcbd" => {
            let mut data = load_csv_str(SORGHUM_RCBD, &LoadOptions::default())?;
            data.to_factor("block")?;
            Ok(data)
        }
        other => Err(DataError::UnknownDataset(other.to_string())),
    }
}

/// Short description shown by `fieldstat datasets`.
pub fn describe(name: &str) -> Option<&'static str> {
    match name {
        "plant_growth" => Some("30 plots, dry `weight` by `group` (ctrl, trt1, trt2)"),
        "sorghum_rcbd" => Some("20 plots, `yield` of five `genotype`s in four `block`s"),
        _ => None,
    }
}

/// Resolves a data path that may name a built-in dataset.
pub fn load_source(path: &str, options: &LoadOptions) -> Result<FieldData, DataError> {
    match path.strip_prefix(BUILTIN_PREFIX) {
        Some(name) => {
            let mut data = builtin(name)?;
            for factor in &options.factors {
                data.to_factor(factor)?;
            }
            Ok(data)
        }
        None => crate::data::load_csv(path, options),
    }
}
