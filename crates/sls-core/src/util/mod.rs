//! Small naming and time utilities shared across helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Alphabet used for user-facing report identifiers.
///
/// Visually ambiguous characters (0/O, 1/I, 2/Z, 5/S, 8/B, ...) are left
/// out so the identifier can be read over the phone.
pub const FRIENDLY_ALPHABET: &[u8] = b"34679ABEHJKLMNPSTUWXYZ";

/// Escapes a unit name into a file-name-safe string.
///
/// ASCII alphanumerics pass through; every other byte becomes `_xx` with
/// `xx` its lowercase hex value.
#[must_use]
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

/// Inverse of [`escape`].
///
/// Malformed sequences (a `_` not followed by two hex digits) are kept
/// verbatim. Decoded bytes that do not form UTF-8 are replaced.
#[must_use]
pub fn unescape(escaped: &str) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && i + 2 < bytes.len() {
            if let Some(decoded) = decode_hex_pair(bytes[i + 1], bytes[i + 2]) {
                out.push(decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn decode_hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = char::from(hi).to_digit(16)?;
    let lo = char::from(lo).to_digit(16)?;
    u8::try_from(hi * 16 + lo).ok()
}

/// `snake_case` to `CamelCase`.
#[must_use]
pub fn camel_case(snake: &str) -> String {
    snake
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect()
}

/// `CamelCase` to `snake_case`.
#[must_use]
pub fn snake_case(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for (i, c) in camel.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Generates an identifier of the form `XXXX-XXXX` from
/// [`FRIENDLY_ALPHABET`].
#[must_use]
pub fn friendly_id() -> String {
    let mut rng = rand::thread_rng();
    let mut group = || -> String {
        (0..4)
            .map(|_| char::from(FRIENDLY_ALPHABET[rng.gen_range(0..FRIENDLY_ALPHABET.len())]))
            .collect()
    };
    let first = group();
    let second = group();
    format!("{first}-{second}")
}

/// Seconds since the Unix epoch as a float.
#[must_use]
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Nanoseconds since the Unix epoch.
#[must_use]
pub fn epoch_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos())
}

/// Kernel release string (`uname -r`).
#[must_use]
pub fn kernel_release() -> String {
    nix::sys::utsname::uname().map_or_else(
        |_| String::from("unknown"),
        |uts| uts.release().to_string_lossy().into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn escape_unit_names() {
        assert_eq!(escape("foo.service"), "foo_2eservice");
        assert_eq!(escape("a-b@1"), "a_2db_401");
        assert_eq!(escape("under_score"), "under_5fscore");
        assert_eq!(unescape("foo_2eservice"), "foo.service");
    }

    #[test]
    fn unescape_tolerates_malformed_sequences() {
        assert_eq!(unescape("a_"), "a_");
        assert_eq!(unescape("a_2"), "a_2");
        assert_eq!(unescape("a_zz"), "a_zz");
        assert_eq!(unescape("_2e_"), "._");
    }

    #[test]
    fn case_conversions() {
        assert_eq!(camel_case("sysinfo"), "Sysinfo");
        assert_eq!(camel_case("dev_coredump"), "DevCoredump");
        assert_eq!(snake_case("DevCoredump"), "dev_coredump");
        assert_eq!(snake_case("Sysreport"), "sysreport");
    }

    #[test]
    fn friendly_id_shape() {
        for _ in 0..64 {
            let id = friendly_id();
            assert_eq!(id.len(), 9);
            let (a, b) = id.split_once('-').unwrap();
            assert_eq!(a.len(), 4);
            assert_eq!(b.len(), 4);
            assert!(a
                .bytes()
                .chain(b.bytes())
                .all(|c| FRIENDLY_ALPHABET.contains(&c)));
        }
    }

    fn escaped_token() -> impl Strategy<Value = String> {
        prop_oneof![
            "[A-Za-z0-9]",
            prop::sample::select(b"-._@:/ ~".to_vec()).prop_map(|b| format!("_{b:02x}")),
        ]
    }

    proptest! {
        #[test]
        fn escape_inverts_unescape(tokens in prop::collection::vec(escaped_token(), 0..24)) {
            let s: String = tokens.concat();
            prop_assert_eq!(escape(&unescape(&s)), s);
        }

        #[test]
        fn snake_camel_snake(parts in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..5)) {
            let s = parts.join("_");
            prop_assert_eq!(snake_case(&camel_case(&s)), s);
        }

        #[test]
        fn camel_snake_camel(parts in prop::collection::vec("[A-Z][a-z0-9]{0,6}", 1..5)) {
            let c: String = parts.concat();
            prop_assert_eq!(camel_case(&snake_case(&c)), c);
        }
    }
}
