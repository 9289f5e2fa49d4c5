//! Reporting boundary: advisory warnings, informational messages and fatal
//! termination.

use core::fmt;

/// Sink for allocator diagnostics.
///
/// `warn` and `message` must return. `fatal` logs and terminates the process.
pub trait Reporter: Send + Sync {
  fn warn(&self, args: fmt::Arguments<'_>);

  fn message(&self, args: fmt::Arguments<'_>);

  fn fatal(&self, args: fmt::Arguments<'_>) -> !;
}

/// Default reporter backed by `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
  fn warn(&self, args: fmt::Arguments<'_>) {
    tracing::warn!(target: "tieralloc", "{}", args);
  }

  fn message(&self, args: fmt::Arguments<'_>) {
    tracing::info!(target: "tieralloc", "{}", args);
  }

  fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "tieralloc", "{}", args);
    // Subscribers may not be installed yet during early setup.
    eprintln!("tieralloc: fatal: {args}");
    std::process::exit(1)
  }
}
