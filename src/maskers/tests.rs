// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use crate::maskers::credit_card::luhn_valid;
use std::sync::atomic::{AtomicUsize, Ordering};

fn mask(masker: &dyn Masker, input: &str) -> String {
    let out = masker.transform(Bytes::copy_from_slice(input.as_bytes())).unwrap();
    String::from_utf8(out.to_vec()).unwrap()
}

#[test]
fn test_email_masker() {
    let cases = [
        (
            "Contact us at test@example.com for assistance.",
            "Contact us at ****@example.com for assistance.",
        ),
        (
            "Send an email to john@example.com or jane@example.com for more information.",
            "Send an email to ****@example.com or ****@example.com for more information.",
        ),
        (
            "For inquiries, email (support@example.com).",
            "For inquiries, email (****@example.com).",
        ),
        (
            "Contact john@example.com or visit our website at www.example.com for more details.",
            "Contact ****@example.com or visit our website at www.example.com for more details.",
        ),
        (
            "This is a sample text without any email addresses.",
            "This is a sample text without any email addresses.",
        ),
        ("", ""),
        ("user@example.com", "****@example.com"),
        ("test@example.com", "****@example.com"),
        (
            "This is not a valid email address: test@",
            "This is not a valid email address: test@",
        ),
        ("Contact 123_asd@gmail.com for assistance.", "Contact ****@gmail.com for assistance."),
        ("Contact user@example.co.uk for support.", "Contact ****@example.co.uk for support."),
        ("Send an email to info@company.xyz for inquiries.", "Send an email to ****@company.xyz for inquiries."),
        ("MIXED.Case+tag@Example.COM", "****@Example.COM"),
        ("{\"owner\":\"ops@corp.io\"}", "{\"owner\":\"****@corp.io\"}"),
    ];

    let masker = EmailMasker::new();
    for (input, expected) in cases {
        assert_eq!(mask(&masker, input), expected, "input: {input:?}");
    }
}

#[test]
fn test_email_domain_needs_a_dot() {
    let masker = EmailMasker::new();
    assert_eq!(mask(&masker, "root@localhost"), "root@localhost");
    assert_eq!(mask(&masker, "a@-bad-.com"), "a@-bad-.com");
}

#[test]
fn test_credit_card_masker() {
    let cases = [
        (" 5105105105105100 ", " **************** "),
        ("4012-8888-8888-1881", "****-****-****-****"),
        ("4012 8888 8888 1881", "**** **** **** ****"),
        ("1234-5678-9012-3454", "1234-5678-9012-3454"),
        ("3215754745", "3215754745"),
        (
            "Some text 3530-1113-3330-0000 and more text",
            "Some text ****-****-****-**** and more text",
        ),
        (
            "3530-1113-3330-0000 4012 8888 8888 18815105105105105100 ",
            "****-****-****-**** **** **** **** ******************** ",
        ),
    ];

    let masker = CreditCardMasker::new();
    for (input, expected) in cases {
        assert_eq!(mask(&masker, input), expected, "input: {input:?}");
    }
}

#[test]
fn test_unchanged_body_is_returned_as_is() {
    let body = Bytes::from_static(b"order 1234-5678-9012-3454 for nobody");
    let out = CreditCardMasker::new().transform(body.clone()).unwrap();
    assert_eq!(out, body);
}

#[test]
fn test_non_utf8_body() {
    let body = Bytes::from_static(b"\xff\xfe a@b.co \xff 4012888888881881");
    let out = MaskerChain::from_kinds(&[MaskerKind::Email, MaskerKind::CreditCard])
        .apply(body)
        .unwrap();
    assert_eq!(&out[..], b"\xff\xfe ****@b.co \xff ****************");
}

#[test]
fn test_luhn() {
    assert!(luhn_valid(b"4012888888881881"));
    assert!(luhn_valid(b"4012-8888-8888-1881"));
    assert!(luhn_valid(b"4222222222222"));
    assert!(!luhn_valid(b"1234567890123454"));
    // Too short even though the checksum holds
    assert!(!luhn_valid(b"0000000000"));
    assert!(!luhn_valid(b"00000000000000000000"));
}

#[derive(Debug)]
struct Suffix(&'static str);

impl Masker for Suffix {
    fn name(&self) -> &str {
        "suffix"
    }

    fn transform(&self, body: Bytes) -> Result<Bytes, ProxyError> {
        let mut out = body.to_vec();
        out.extend_from_slice(self.0.as_bytes());
        Ok(Bytes::from(out))
    }
}

#[derive(Debug, Default)]
struct Failing {
    calls: AtomicUsize,
}

impl Masker for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn transform(&self, _body: Bytes) -> Result<Bytes, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProxyError::Other("pattern engine exploded".to_string()))
    }
}

#[test]
fn test_chain_is_sequential_composition() {
    let input = "mail john@example.com, card 4012 8888 8888 1881";
    let email = EmailMasker::new();
    let card = CreditCardMasker::new();

    let by_hand = mask(&card, &mask(&email, input));
    let chain = MaskerChain::from_kinds(&[MaskerKind::Email, MaskerKind::CreditCard]);
    let chained = chain.apply(Bytes::copy_from_slice(input.as_bytes())).unwrap();

    assert_eq!(chained, by_hand.as_bytes());
    assert_eq!(chain.names(), vec!["email_masker", "credit_card_masker"]);
}

#[test]
fn test_chain_order_matters() {
    let forward: Vec<Arc<dyn Masker>> = vec![Arc::new(Suffix("a")), Arc::new(Suffix("b"))];
    let chain = MaskerChain::new(forward);
    assert_eq!(chain.apply(Bytes::from_static(b"x")).unwrap(), "xab");

    let backward: Vec<Arc<dyn Masker>> = vec![Arc::new(Suffix("b")), Arc::new(Suffix("a"))];
    let reversed = MaskerChain::new(backward);
    assert_eq!(reversed.apply(Bytes::from_static(b"x")).unwrap(), "xba");
}

#[test]
fn test_chain_fails_closed() {
    let failing = Arc::new(Failing::default());
    let after = Arc::new(Failing::default());
    let maskers: Vec<Arc<dyn Masker>> = vec![Arc::new(Suffix("a")), failing.clone(), after.clone()];
    let chain = MaskerChain::new(maskers);

    match chain.apply(Bytes::from_static(b"secret")) {
        Err(ProxyError::Masking { masker, message }) => {
            assert_eq!(masker, "failing");
            assert_eq!(message, "pattern engine exploded");
        }
        other => panic!("expected Masking error, got {other:?}"),
    }
    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    assert_eq!(after.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_empty_chain_is_identity() {
    let chain = MaskerChain::default();
    assert!(chain.is_empty());
    assert_eq!(chain.apply(Bytes::from_static(b"a@b.co")).unwrap(), "a@b.co");
}

#[test]
fn test_factory_names() {
    assert_eq!(MaskerFactory::create(MaskerKind::Email).name(), "email_masker");
    assert_eq!(MaskerFactory::create(MaskerKind::CreditCard).name(), "credit_card_masker");
}
