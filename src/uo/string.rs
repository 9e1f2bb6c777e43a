//! NUL-padded fixed-width strings as used in UO login frames

/// Returns the bytes up to the first NUL, or the whole field if there is
/// none.
pub fn extract_cstr(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(n) => &field[..n],
        None => field,
    }
}

/// A username is acceptable if it is non-empty and printable ASCII.
pub fn is_valid_username(s: &[u8]) -> bool {
    !s.is_empty() && s.iter().all(|&b| (0x20..0x7f).contains(&b))
}

/// Extracts the NUL-terminated username from a fixed-width frame field and
/// validates its character set. Printable ASCII is always valid UTF-8, so
/// the conversion cannot fail after validation.
pub fn username_str(field: &[u8]) -> Option<&str> {
    let raw = extract_cstr(field);
    if !is_valid_username(raw) {
        return None;
    }
    std::str::from_utf8(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_stops_at_first_nul() {
        assert_eq!(extract_cstr(b"alice\0\0\0"), b"alice");
        assert_eq!(extract_cstr(b"alice"), b"alice");
        assert_eq!(extract_cstr(b"\0alice"), b"");
        assert_eq!(extract_cstr(b"al\0ice"), b"al");
    }

    #[test]
    fn username_charset() {
        assert!(is_valid_username(b"alice"));
        assert!(is_valid_username(b"A B-c_42!"));
        assert!(!is_valid_username(b""));
        assert!(!is_valid_username(b"al\x01ce"));
        assert!(!is_valid_username(b"al\x7fce"));
        assert!(!is_valid_username("gr\u{fc}n".as_bytes()));
    }

    #[test]
    fn username_from_field() {
        let mut field = [0u8; 30];
        field[..5].copy_from_slice(b"ALICE");
        assert_eq!(username_str(&field), Some("ALICE"));
        assert_eq!(username_str(&[0u8; 30]), None);
    }
}
