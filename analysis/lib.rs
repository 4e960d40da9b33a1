#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod anova;
pub mod cld;
pub mod comparisons;
pub mod config;
pub mod data;
pub mod datasets;
pub mod design;
pub mod diagnostics;
pub mod emmeans;
pub mod formula;
pub mod inference;
pub mod linear;
pub mod mixed;
pub mod model;
pub mod plot;
pub mod report;
pub mod studentized;
pub mod workflow;
