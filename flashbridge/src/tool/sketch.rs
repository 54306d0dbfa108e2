//! Sketch source validation.

use crate::error::{Error, Result};

const BOM: char = '\u{FEFF}';

/// Validate and normalize sketch source before it touches the filesystem.
///
/// Strips a leading byte-order mark and leading control characters, rejects
/// empty programs and programs without both `setup()` and `loop()`.
pub fn validate_sketch(code: &str) -> Result<String> {
    let cleaned = code.trim_start_matches(|c: char| c == BOM || c.is_control());

    if cleaned.trim().is_empty() {
        return Err(Error::Validation("program is empty".into()));
    }

    let missing: Vec<&str> = ["setup", "loop"]
        .into_iter()
        .filter(|name| !defines_function(cleaned, name))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "program must define {}",
            missing
                .iter()
                .map(|n| format!("{n}()"))
                .collect::<Vec<_>>()
                .join(" and ")
        )));
    }

    Ok(cleaned.to_string())
}

/// Whether `name` appears as a standalone identifier followed by `(`.
fn defines_function(code: &str, name: &str) -> bool {
    let bytes = code.as_bytes();
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    code.match_indices(name).any(|(start, _)| {
        let end = start + name.len();
        let before_ok = start == 0 || !is_ident(bytes[start - 1]);
        let rest = code[end..].trim_start();
        before_ok && rest.starts_with('(')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINK: &str = "void setup() {\n  pinMode(2, OUTPUT);\n}\n\nvoid loop() {\n  digitalWrite(2, HIGH);\n}\n";

    #[test]
    fn test_valid_sketch_passes_unchanged() {
        assert_eq!(validate_sketch(BLINK).unwrap(), BLINK);
    }

    #[test]
    fn test_strips_bom_and_control_chars() {
        let dirty = format!("\u{FEFF}\u{0}\u{7}{BLINK}");
        assert_eq!(validate_sketch(&dirty).unwrap(), BLINK);
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(validate_sketch(""), Err(Error::Validation(_))));
        assert!(matches!(
            validate_sketch("\u{FEFF}  \n\t"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_missing_entry_points_rejected() {
        let err = validate_sketch("int x = 1;").unwrap_err();
        assert!(err.to_string().contains("setup() and loop()"));

        let err = validate_sketch("void setup() {}").unwrap_err();
        assert!(err.to_string().contains("loop()"));
        assert!(!err.to_string().contains("setup()"));
    }

    #[test]
    fn test_identifier_boundaries() {
        // mysetup() is not setup()
        assert!(validate_sketch("void mysetup() {}\nvoid loop() {}").is_err());
        assert!(validate_sketch("void setup (void) {}\nvoid loop\n() {}").is_ok());
    }
}
