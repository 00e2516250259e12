//! Fuzz target for ConnectionString::parse
//!
//! The parser should NEVER panic. Every input either fails with a UriError
//! or yields a ConnectionString whose canonical form parses back to the same
//! value.

#![no_main]

use libfuzzer_sys::fuzz_target;
use plcloop_core::ConnectionString;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(parsed) = ConnectionString::parse(input) else {
        return;
    };

    let canonical = parsed.to_string();
    let reparsed = ConnectionString::parse(&canonical)
        .unwrap_or_else(|err| panic!("canonical form {canonical:?} rejected: {err}"));
    assert_eq!(parsed, reparsed, "canonical form {canonical:?} changed meaning");
});
