//! Nested repository metadata.
//!
//! The source system lists subrepositories in `.hgsub` (`path = [kind]source`)
//! and pins them in `.hgsubstate` (`<hash> <path>`). The target system uses
//! gitlink tree entries plus a `.gitmodules` file.

use crate::object::ObjectId;
use std::collections::BTreeMap;
use tracing::warn;

pub const HGSUB: &str = ".hgsub";
pub const HGSUBSTATE: &str = ".hgsubstate";
pub const GITMODULES: &str = ".gitmodules";

/// Kind of a subrepository whose pins become gitlinks
pub const GIT_KIND: &str = "git";

/// One `.hgsub` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubSource {
    /// `hg` when no `[kind]` prefix is given
    pub kind: String,
    pub source: String,
}

impl SubSource {
    pub fn git(source: impl Into<String>) -> Self {
        Self {
            kind: GIT_KIND.to_string(),
            source: source.into(),
        }
    }

    pub fn is_git(&self) -> bool {
        self.kind == GIT_KIND
    }
}

/// Parse `.hgsub`; unreadable content is logged and treated as empty.
pub fn parse_hgsub(data: &[u8]) -> BTreeMap<String, SubSource> {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => {
            warn!("{} is not UTF-8, ignoring it", HGSUB);
            return BTreeMap::new();
        }
    };
    let mut subs = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        let Some((path, source)) = line.split_once('=') else {
            warn!(line, "skipping unparseable {} line", HGSUB);
            continue;
        };
        let source = source.trim();
        let (kind, source) = match source.strip_prefix('[').and_then(|s| s.split_once(']')) {
            Some((kind, rest)) => (kind.to_string(), rest.to_string()),
            None => ("hg".to_string(), source.to_string()),
        };
        subs.insert(path.trim().to_string(), SubSource { kind, source });
    }
    subs
}

pub fn render_hgsub(subs: &BTreeMap<String, SubSource>) -> Vec<u8> {
    let mut out = String::new();
    for (path, sub) in subs {
        if sub.kind == "hg" {
            out.push_str(&format!("{} = {}\n", path, sub.source));
        } else {
            out.push_str(&format!("{} = [{}]{}\n", path, sub.kind, sub.source));
        }
    }
    out.into_bytes()
}

/// Parse `.hgsubstate` into path -> pinned revision
pub fn parse_hgsubstate(data: &[u8]) -> BTreeMap<String, String> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| line.split_once(' '))
        .map(|(hash, path)| (path.to_string(), hash.to_string()))
        .collect()
}

pub fn render_hgsubstate(state: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = String::new();
    for (path, hash) in state {
        out.push_str(&format!("{} {}\n", hash, path));
    }
    out.into_bytes()
}

/// `.gitmodules` text for the git-kind subrepos
pub fn render_gitmodules(subs: &BTreeMap<String, SubSource>) -> Vec<u8> {
    let mut out = String::new();
    for (path, sub) in subs.iter().filter(|(_, s)| s.is_git()) {
        out.push_str(&format!(
            "[submodule \"{}\"]\n\tpath = {}\n\turl = {}\n",
            path, path, sub.source
        ));
    }
    out.into_bytes()
}

/// Parse `.gitmodules` into path -> url; unreadable content is logged and
/// treated as empty.
pub fn parse_gitmodules(data: &[u8]) -> BTreeMap<String, String> {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => {
            warn!("{} is not UTF-8, ignoring it", GITMODULES);
            return BTreeMap::new();
        }
    };
    let mut modules = BTreeMap::new();
    let mut path: Option<String> = None;
    let mut url: Option<String> = None;
    let mut flush = |path: &mut Option<String>, url: &mut Option<String>| {
        if let (Some(p), Some(u)) = (path.take(), url.take()) {
            modules.insert(p, u);
        }
    };
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("[submodule") {
            flush(&mut path, &mut url);
        } else if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "path" => path = Some(value.trim().to_string()),
                "url" => url = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    flush(&mut path, &mut url);
    modules
}

/// Gitlinks for every git-kind subrepo with a valid pinned commit
pub fn export_gitlinks(
    subs: &BTreeMap<String, SubSource>,
    state: &BTreeMap<String, String>,
) -> BTreeMap<String, ObjectId> {
    let mut links = BTreeMap::new();
    for (path, sub) in subs.iter().filter(|(_, s)| s.is_git()) {
        match state.get(path).map(|h| ObjectId::from_hex(h)) {
            Some(Ok(id)) => {
                links.insert(path.clone(), id);
            }
            Some(Err(_)) => warn!(path = %path, "subrepo pin is not a commit id, skipping gitlink"),
            None => {}
        }
    }
    links
}

/// Substate for an imported commit.
///
/// Starts from `base` (the recorded substate), lets every gitlink win over
/// the recorded pin, and drops git-kind entries whose gitlink is gone.
pub fn import_substate(
    subs: &BTreeMap<String, SubSource>,
    base: &BTreeMap<String, String>,
    gitlinks: &BTreeMap<String, ObjectId>,
) -> BTreeMap<String, String> {
    let mut state = BTreeMap::new();
    for (path, sub) in subs {
        if sub.is_git() {
            if let Some(id) = gitlinks.get(path) {
                state.insert(path.clone(), id.to_hex());
            }
        } else if let Some(hash) = base.get(path) {
            state.insert(path.clone(), hash.clone());
        }
    }
    for (path, id) in gitlinks {
        state.entry(path.clone()).or_insert_with(|| id.to_hex());
    }
    state
}
