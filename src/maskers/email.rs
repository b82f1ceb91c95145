// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::borrow::Cow;

use super::Masker;
use crate::core::ProxyError;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i-u)[A-Za-z0-9!#$%&'*+/=?^_{|.}~-]+@(?P<domain>(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)",
    )
    .expect("email pattern is valid")
});

/// Replaces the local part of every email address with `****`, keeping the
/// domain.  The mask has a fixed width so the original length is not leaked.
#[derive(Debug, Default)]
pub struct EmailMasker;

impl EmailMasker {
    pub fn new() -> Self {
        Self
    }
}

impl Masker for EmailMasker {
    fn name(&self) -> &str {
        "email_masker"
    }

    fn transform(&self, body: Bytes) -> Result<Bytes, ProxyError> {
        let masked = match EMAIL_PATTERN.replace_all(&body, &b"****@${domain}"[..]) {
            Cow::Borrowed(_) => None,
            Cow::Owned(masked) => Some(Bytes::from(masked)),
        };
        Ok(masked.unwrap_or(body))
    }
}
