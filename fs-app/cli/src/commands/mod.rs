//! Subcommands of the mfsck CLI

pub mod check;
pub mod format;
pub mod inspect;
