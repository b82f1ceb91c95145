// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use std::borrow::Cow;

use super::Masker;
use crate::core::ProxyError;

/// 13 to 16 digits, each optionally followed by spaces or hyphens.
static CARD_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[0-9][ -]*?){13,16}").expect("card pattern is valid"));

/// Masks every digit of card numbers that pass the Luhn check.  Separators
/// are left in place so the layout of the document is preserved.
#[derive(Debug, Default)]
pub struct CreditCardMasker;

impl CreditCardMasker {
    pub fn new() -> Self {
        Self
    }
}

impl Masker for CreditCardMasker {
    fn name(&self) -> &str {
        "credit_card_masker"
    }

    fn transform(&self, body: Bytes) -> Result<Bytes, ProxyError> {
        // Rejected candidates are written back verbatim
        let masked = match CARD_CANDIDATE.replace_all(&body, |caps: &Captures| {
            let candidate = &caps[0];
            if luhn_valid(candidate) {
                mask_digits(candidate)
            } else {
                candidate.to_vec()
            }
        }) {
            Cow::Owned(masked) if masked[..] != body[..] => Some(Bytes::from(masked)),
            _ => None,
        };
        Ok(masked.unwrap_or(body))
    }
}

fn mask_digits(candidate: &[u8]) -> Vec<u8> {
    candidate
        .iter()
        .map(|&b| if b.is_ascii_digit() { b'*' } else { b })
        .collect()
}

/// Luhn checksum over the digits of `candidate`, ignoring separators.
/// Numbers shorter than 13 or longer than 19 digits never pass.
pub(crate) fn luhn_valid(candidate: &[u8]) -> bool {
    let digits: Vec<u32> = candidate
        .iter()
        .filter(|b| b.is_ascii_digit())
        .map(|b| u32::from(b - b'0'))
        .collect();

    if !(13..=19).contains(&digits.len()) {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
