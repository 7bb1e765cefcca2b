//! Per-attempt cancellation tokens.

use tokio_util::sync::CancellationToken;

/// Marker handed to every fetch attempt.
///
/// Each attempt gets a token with a strictly larger generation than any
/// earlier one from the same coordinator. Cancelling is cooperative: results
/// that arrive for a cancelled token are discarded, and transports that can
/// abort early wait on [`CancelToken::cancelled`].
#[derive(Debug, Clone)]
pub struct CancelToken {
  generation: u64,
  inner: CancellationToken,
}

impl CancelToken {
  pub fn new(generation: u64) -> Self {
    Self {
      generation,
      inner: CancellationToken::new(),
    }
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn cancel(&self) {
    self.inner.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.is_cancelled()
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    self.inner.cancelled().await
  }

  /// Two handles refer to the same attempt.
  pub fn same_attempt(&self, other: &CancelToken) -> bool {
    self.generation == other.generation
  }
}
