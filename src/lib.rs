//! swe-harvest: issue-to-fix benchmark mining and patch evaluation.
//!
//! [`swe`] turns a repository's closed issues into validated benchmark data
//! points; [`runner`] scores candidate patches against them inside the
//! isolated environments provided by [`execution`].

pub mod cli;
pub mod error;
pub mod execution;
pub mod runner;
pub mod swe;
pub mod utils;

pub use error::{
    AssemblyError, EnvironmentSetupError, FetchError, GoldPatchError, LinkError,
    PatchConflictError, PatchError, TestRunError,
};
