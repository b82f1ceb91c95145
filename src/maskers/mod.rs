// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Response maskers
//!
//! Maskers rewrite the body of a GET response before it reaches the client.
//! They run as a strict pipeline: each masker receives the output of the one
//! before it.  If any masker fails the whole response is replaced by an error
//! so the unmasked body never leaves the proxy.
//!
//! ```toml
//! [proxy]
//! target_url = "http://backend:9000"
//! maskers = ["email", "credit_card"]
//! ```

mod credit_card;
mod email;

#[cfg(test)]
mod tests;

pub use credit_card::CreditCardMasker;
pub use email::EmailMasker;

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::config::MaskerKind;
use crate::core::ProxyError;
use crate::{debug_fmt, error_fmt};

/// Result of running a body through a [`MaskerChain`].
pub type MaskOutcome = Result<Bytes, ProxyError>;

/// A text transform that redacts sensitive data from a response body.
pub trait Masker: fmt::Debug + Send + Sync {
    /// Stable name reported when this masker fails.
    fn name(&self) -> &str;

    /// Rewrite `body`.  Returning an error aborts the response.
    fn transform(&self, body: Bytes) -> Result<Bytes, ProxyError>;
}

/// Ordered list of maskers.  Built once at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct MaskerChain {
    maskers: Vec<Arc<dyn Masker>>,
}

impl MaskerChain {
    pub fn new(maskers: Vec<Arc<dyn Masker>>) -> Self {
        Self { maskers }
    }

    /// Build a chain of built-in maskers, preserving order.
    pub fn from_kinds(kinds: &[MaskerKind]) -> Self {
        Self::new(kinds.iter().copied().map(MaskerFactory::create).collect())
    }

    /// Append a masker to the end of the chain.
    pub fn push(&mut self, masker: Arc<dyn Masker>) {
        self.maskers.push(masker);
    }

    pub fn len(&self) -> usize {
        self.maskers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maskers.is_empty()
    }

    /// Names of the maskers, in application order.
    pub fn names(&self) -> Vec<&str> {
        self.maskers.iter().map(|m| m.name()).collect()
    }

    /// Feed `body` through every masker in order.
    ///
    /// The first failure is returned as [`ProxyError::Masking`] naming the
    /// masker; later maskers do not run.
    pub fn apply(&self, body: Bytes) -> MaskOutcome {
        let mut body = body;
        for masker in &self.maskers {
            body = masker.transform(body).map_err(|e| {
                error_fmt!("MaskerChain", "Masker {} failed: {}", masker.name(), e);
                ProxyError::Masking {
                    masker: masker.name().to_string(),
                    message: e.to_string(),
                }
            })?;
        }
        debug_fmt!("MaskerChain", "Masked body with {} masker(s), {} bytes out", self.maskers.len(), body.len());
        Ok(body)
    }
}

/// Builds the built-in maskers.
pub struct MaskerFactory;

impl MaskerFactory {
    pub fn create(kind: MaskerKind) -> Arc<dyn Masker> {
        match kind {
            MaskerKind::Email => Arc::new(EmailMasker::new()),
            MaskerKind::CreditCard => Arc::new(CreditCardMasker::new()),
        }
    }
}
