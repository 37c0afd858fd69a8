//! End-to-end scenarios driven through the public API against a synthetic
//! runtime.

mod fixture;
mod scenarios;
