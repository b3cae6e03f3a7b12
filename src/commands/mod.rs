// ABOUTME: Command implementations for the CLI
// ABOUTME: Exports run, validate, enable-tracking, prune-changes, and dead-letter commands

pub mod dead_letters;
pub mod prune;
pub mod run;
pub mod tracking;
pub mod validate;

pub use dead_letters::DeadLetterArgs;
pub use prune::prune_changes;
pub use run::run;
pub use tracking::enable_tracking;
pub use validate::validate;
