#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Bayesian linear regression over random basis functions.
//!
//! The crate is split the way the computation flows: `optimize` holds the
//! general numeric optimizers (bounded multi-start BFGS and minibatch SGD with
//! their parameter adapters), and `regression` holds the feature maps, the two
//! evidence-maximizing trainers, prediction, metrics and the TSV loader used by
//! the command-line demo.

#[path = "../optimize/mod.rs"]
pub mod optimize;

#[path = "../regression/mod.rs"]
pub mod regression;
