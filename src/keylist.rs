//! Parsing of verified keylist content.
//!
//! A keylist is UTF-8 text with one fingerprint per line. Blank lines and
//! `#` comments are skipped silently; every other line must normalize to a
//! full fingerprint or it is rejected and counted.
//!
//! Only call [`parse_keylist`] on bytes whose signature has already been
//! verified against the endpoint's authority key.

use tracing::debug;

use crate::error::ParseError;
use crate::validation::Fingerprint;

/// A keylist line that did not hold a valid fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    /// 1-based line number.
    pub line: usize,
    pub error: ParseError,
}

/// Fingerprints extracted from a keylist, in first-seen order with
/// duplicates removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keylist {
    pub fingerprints: Vec<Fingerprint>,
    pub rejected: Vec<RejectedLine>,
}

impl Keylist {
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

pub fn parse_keylist(content: &[u8]) -> Keylist {
    let text = String::from_utf8_lossy(content);
    let mut keylist = Keylist::default();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match Fingerprint::parse(line) {
            Ok(fp) => {
                if seen.insert(fp.clone()) {
                    keylist.fingerprints.push(fp);
                } else {
                    debug!(fingerprint = %fp, "skipping duplicate keylist entry");
                }
            }
            Err(error) => {
                debug!(line = idx + 1, %error, "rejecting keylist line");
                keylist.rejected.push(RejectedLine {
                    line: idx + 1,
                    error,
                });
            }
        }
    }

    keylist
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP_A: &str = "6645B0A8C7005E78DB1D7864F99FFE0FEAE999BD";
    const FP_B: &str = "ABAF11C65A2970B130ABE3C479BE3E4300411886";

    #[test]
    fn test_parse_keylist() {
        let content = format!("{FP_A}\n{FP_B}\n");
        let keylist = parse_keylist(content.as_bytes());
        assert_eq!(keylist.len(), 2);
        assert_eq!(keylist.fingerprints[0].as_str(), FP_A);
        assert_eq!(keylist.fingerprints[1].as_str(), FP_B);
        assert!(keylist.rejected.is_empty());
    }

    #[test]
    fn test_blank_lines_and_comments_ignored() {
        let content = format!("# Example Org keylist\n\n{FP_A}\n   \n# {FP_B}\n");
        let keylist = parse_keylist(content.as_bytes());
        assert_eq!(keylist.len(), 1);
        assert!(keylist.rejected.is_empty());
    }

    #[test]
    fn test_cosmetic_noise_normalized() {
        let grouped = "6645 B0A8 C700 5E78 DB1D  7864 F99F FE0F EAE9 99BD";
        let content = format!("  {grouped}\r\n{}\t\n", FP_B.to_lowercase());
        let keylist = parse_keylist(content.as_bytes());
        assert_eq!(keylist.len(), 2);
        assert_eq!(keylist.fingerprints[0].as_str(), FP_A);
        assert_eq!(keylist.fingerprints[1].as_str(), FP_B);
    }

    #[test]
    fn test_duplicates_collapse() {
        let content = format!("{FP_A}\n{FP_B}\n{}\n{FP_A}\n", FP_A.to_lowercase());
        let keylist = parse_keylist(content.as_bytes());
        assert_eq!(keylist.len(), 2);
        assert!(keylist.rejected.is_empty());
    }

    #[test]
    fn test_invalid_lines_counted() {
        let content = format!("{FP_A}\nnot a fingerprint\n786C63F330D7CB92\n{FP_B}\n0x{FP_A}\n");
        let keylist = parse_keylist(content.as_bytes());
        assert_eq!(keylist.len(), 2);
        assert_eq!(keylist.rejected.len(), 3);
        assert_eq!(
            keylist.rejected.iter().map(|r| r.line).collect::<Vec<_>>(),
            vec![2, 3, 5]
        );
    }

    #[test]
    fn test_invalid_utf8_line_rejected() {
        let mut content = Vec::new();
        content.extend_from_slice(FP_A.as_bytes());
        content.extend_from_slice(b"\n\xff\xfe\xfd\n");
        let keylist = parse_keylist(&content);
        assert_eq!(keylist.len(), 1);
        assert_eq!(keylist.rejected.len(), 1);
    }

    #[test]
    fn test_n_valid_m_invalid() {
        let valid = [FP_A, FP_B, "DDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDD"];
        let invalid = ["x", "DEADBEEF", "ZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZZ", "-"];
        let mut lines = Vec::new();
        for (v, i) in valid.iter().zip(invalid.iter()) {
            lines.push(*v);
            lines.push(*i);
        }
        lines.push(invalid[3]);
        let keylist = parse_keylist(lines.join("\n").as_bytes());
        assert_eq!(keylist.len(), valid.len());
        assert_eq!(keylist.rejected.len(), invalid.len());
    }

    #[test]
    fn test_empty_keylist() {
        let keylist = parse_keylist(b"");
        assert!(keylist.is_empty());
        assert!(keylist.rejected.is_empty());
    }
}
