//! Conversion between source user strings and target identities.
//!
//! Source users are free-form (`Name <email>`, a bare address, a bare name,
//! or `Name <email> extra`). Target identities are a name plus an email in
//! which `<`, `>` and newlines are forbidden.

use crate::footer::{percent_decode, percent_encode};
use std::collections::BTreeMap;

/// Email used for identities that carry no address
pub const NO_EMAIL: &str = "none@none";

const EXT_OPEN: &str = " ext:(";

/// Rewrite table and placeholder applied on export
#[derive(Debug, Clone)]
pub struct IdentityRules {
    pub authors: BTreeMap<String, String>,
    pub placeholder: char,
}

impl Default for IdentityRules {
    fn default() -> Self {
        Self {
            authors: BTreeMap::new(),
            placeholder: '?',
        }
    }
}

impl IdentityRules {
    pub fn new(authors: BTreeMap<String, String>, placeholder: char) -> Self {
        Self { authors, placeholder }
    }

    /// Split a (decoded) source user into a target name and email.
    pub fn to_target(&self, user: &str) -> (String, String) {
        let user = self.authors.get(user).map(String::as_str).unwrap_or(user);

        let (name, email, extra) = match split_user(user) {
            Some(parts) => parts,
            None if user.contains('@') && !user.contains(char::is_whitespace) => {
                (user.to_string(), user.to_string(), String::new())
            }
            None => (user.trim().to_string(), NO_EMAIL.to_string(), String::new()),
        };

        let name = if extra.is_empty() {
            name
        } else {
            format!("{}{}{})", name, EXT_OPEN, percent_encode(extra.as_bytes()))
        };
        (self.sanitize(&name), self.sanitize(&email))
    }

    fn sanitize(&self, field: &str) -> String {
        field
            .chars()
            .map(|c| if matches!(c, '<' | '>' | '\n') { self.placeholder } else { c })
            .collect()
    }
}

/// `Name <email> extra` -> parts; `None` when there is no bracketed address.
fn split_user(user: &str) -> Option<(String, String, String)> {
    let lt = user.find('<')?;
    let gt = user[lt..].find('>')? + lt;
    Some((
        user[..lt].trim().to_string(),
        user[lt + 1..gt].to_string(),
        user[gt + 1..].trim().to_string(),
    ))
}

/// Rebuild a source user string from a target name and email.
pub fn to_source(name: &str, email: &str) -> String {
    let (name, extra) = match name.strip_suffix(')').and_then(|n| n.rfind(EXT_OPEN).map(|i| (n, i))) {
        Some((stripped, idx)) => {
            let encoded = &stripped[idx + EXT_OPEN.len()..];
            match percent_decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(extra) => (&name[..idx], Some(extra)),
                None => (name, None),
            }
        }
        None => (name, None),
    };

    let mut user = if email == NO_EMAIL {
        name.to_string()
    } else if name == email {
        email.to_string()
    } else if name.is_empty() {
        format!("<{}>", email)
    } else {
        format!("{} <{}>", name, email)
    };
    if let Some(extra) = extra {
        user.push(' ');
        user.push_str(&extra);
    }
    user
}
