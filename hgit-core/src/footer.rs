//! Metadata footer codec.
//!
//! Source-only metadata rides at the end of a translated commit message:
//!
//! ```text
//! <message>
//!
//! --HG--
//! branch : feature
//! rename : old/name.txt => new/name.txt
//! extra : topic : review%2F42
//! ```
//!
//! Values are percent-encoded where they could collide with the line syntax.
//! A trailing block that fails to parse is treated as part of the message.

use crate::error::{Result, SyncError};
use std::collections::BTreeMap;

/// Line that introduces the footer block
pub const SEPARATOR: &str = "--HG--";

const INTRO: &str = "\n\n--HG--\n";

/// Position of a commit inside an exported octopus chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OctopusMarker {
    /// Synthetic intermediate merge
    Octopus,
    /// Final commit of the chain, carrying the real metadata
    OctopusDone,
}

impl OctopusMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            OctopusMarker::Octopus => "octopus",
            OctopusMarker::OctopusDone => "octopus-done",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "octopus" => Some(OctopusMarker::Octopus),
            "octopus-done" => Some(OctopusMarker::OctopusDone),
            _ => None,
        }
    }
}

/// Decoded footer fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footer {
    pub branch: Option<String>,
    /// `(old, new)` pairs
    pub renames: Vec<(String, String)>,
    pub extras: BTreeMap<String, Vec<u8>>,
    pub merge: Option<OctopusMarker>,
    /// Delta from the stored message to the original description bytes
    pub message_delta: Option<Vec<u8>>,
    /// Delta from the stored identity to the original user bytes
    pub user_delta: Option<Vec<u8>>,
}

impl Footer {
    pub fn is_empty(&self) -> bool {
        self.branch.is_none()
            && self.renames.is_empty()
            && self.extras.is_empty()
            && self.merge.is_none()
            && self.message_delta.is_none()
            && self.user_delta.is_none()
    }

    fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(branch) = &self.branch {
            lines.push(format!("branch : {}", percent_encode(branch.as_bytes())));
        }
        for (old, new) in &self.renames {
            lines.push(format!(
                "rename : {} => {}",
                percent_encode(old.as_bytes()),
                percent_encode(new.as_bytes())
            ));
        }
        for (key, value) in &self.extras {
            lines.push(format!(
                "extra : {} : {}",
                percent_encode(key.as_bytes()),
                percent_encode(value)
            ));
        }
        if let Some(marker) = self.merge {
            lines.push(format!("merge : {}", marker.as_str()));
        }
        if let Some(delta) = &self.message_delta {
            lines.push(format!("message-delta : {}", hex::encode(delta)));
        }
        if let Some(delta) = &self.user_delta {
            lines.push(format!("user-delta : {}", hex::encode(delta)));
        }
        lines
    }

    fn parse_lines(block: &str) -> Result<Self> {
        let mut footer = Footer::default();
        for line in block.lines() {
            let (key, value) = line
                .split_once(" : ")
                .ok_or_else(|| SyncError::malformed(format!("footer line {:?}", line)))?;
            match key {
                "branch" => footer.branch = Some(percent_decode_string(value)?),
                "rename" => {
                    let (old, new) = value
                        .split_once(" => ")
                        .ok_or_else(|| SyncError::malformed(format!("rename {:?}", value)))?;
                    footer
                        .renames
                        .push((percent_decode_string(old)?, percent_decode_string(new)?));
                }
                "extra" => {
                    let (k, v) = value
                        .split_once(" : ")
                        .ok_or_else(|| SyncError::malformed(format!("extra {:?}", value)))?;
                    footer.extras.insert(percent_decode_string(k)?, percent_decode(v)?);
                }
                "merge" => {
                    footer.merge = Some(
                        OctopusMarker::parse(value)
                            .ok_or_else(|| SyncError::malformed(format!("merge marker {:?}", value)))?,
                    );
                }
                "message-delta" => footer.message_delta = Some(hex::decode(value)?),
                "user-delta" => footer.user_delta = Some(hex::decode(value)?),
                other => return Err(SyncError::malformed(format!("unknown footer key {:?}", other))),
            }
        }
        Ok(footer)
    }
}

/// Append `footer` to `message`.
///
/// An empty footer is still written when the message would otherwise be
/// mistaken for one that carries a footer, so that import strips exactly
/// what export added.
pub fn append(message: &str, footer: &Footer) -> String {
    if footer.is_empty() && split(message).1.is_none() {
        return message.to_string();
    }
    let mut out = String::with_capacity(message.len() + 64);
    out.push_str(message);
    out.push_str(INTRO);
    for line in footer.lines() {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Split a stored message into its body and footer (if any).
pub fn split(message: &str) -> (&str, Option<Footer>) {
    match message.rfind(INTRO) {
        Some(pos) => match Footer::parse_lines(&message[pos + INTRO.len()..]) {
            Ok(footer) => (&message[..pos], Some(footer)),
            Err(_) => (message, None),
        },
        None => (message, None),
    }
}

fn is_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-_.~/+@,()[]! ".contains(&b)
}

/// Percent-encode everything outside a conservative safe set
pub fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if is_safe(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

pub fn percent_decode(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .ok_or_else(|| SyncError::malformed(format!("truncated escape in {:?}", s)))?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| SyncError::malformed(format!("bad escape in {:?}", s)))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn percent_decode_string(s: &str) -> Result<String> {
    String::from_utf8(percent_decode(s)?)
        .map_err(|_| SyncError::malformed(format!("footer value {:?} is not UTF-8", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_footer_means_defaults() {
        let (body, footer) = split("plain message\n");
        assert_eq!(body, "plain message\n");
        assert!(footer.is_none());
        assert_eq!(append("plain message\n", &Footer::default()), "plain message\n");
    }

    #[test]
    fn test_full_footer_roundtrip() {
        let mut footer = Footer {
            branch: Some("feature".to_string()),
            renames: vec![("a b.txt".to_string(), "dir/a => b.txt".to_string())],
            merge: Some(OctopusMarker::OctopusDone),
            message_delta: Some(vec![0, 1, 2]),
            ..Default::default()
        };
        footer.extras.insert("topic".to_string(), b"x : y\n\xff".to_vec());

        let stored = append("fix things", &footer);
        assert!(stored.starts_with("fix things\n\n--HG--\nbranch : feature\n"));
        assert!(stored.contains("rename : a b.txt => dir/a %3D%3E b.txt\n"));

        let (body, parsed) = split(&stored);
        assert_eq!(body, "fix things");
        assert_eq!(parsed.unwrap(), footer);
    }

    #[test]
    fn test_message_resembling_footer_is_protected() {
        let tricky = "notes\n\n--HG--\nbranch : fake\n";
        let stored = append(tricky, &Footer::default());
        assert_ne!(stored, tricky);
        let (body, footer) = split(&stored);
        assert_eq!(body, tricky);
        assert_eq!(footer.unwrap(), Footer::default());
    }

    #[test]
    fn test_unparseable_block_stays_in_message() {
        let text = "msg\n\n--HG--\nnot a footer line\n";
        let (body, footer) = split(text);
        assert_eq!(body, text);
        assert!(footer.is_none());
    }

    #[test]
    fn test_percent_codec() {
        assert_eq!(percent_encode(b"a:b%\n"), "a%3Ab%25%0A");
        assert_eq!(percent_decode("a%3Ab%25%0A").unwrap(), b"a:b%\n");
        assert!(percent_decode("%4").is_err());
    }
}
