//! Commit translation in both directions.
//!
//! Export turns a changeset into one target commit (or an octopus chain) and
//! moves every source-only field into the message footer. Import reverses
//! that and rebuilds the manifest from a tree diff against the first parent.

use crate::charset;
use crate::delta;
use crate::error::{Result, SyncError};
use crate::footer::{self, Footer, OctopusMarker};
use crate::identity::{self, IdentityRules};
use crate::object::{Commit, FileMode, ObjectId, Signature};
use crate::octopus;
use crate::source::{Changeset, FileRevision, Manifest, ManifestEntry, NodeId, DEFAULT_BRANCH};
use crate::storage::{SourceStore, TargetStore};
use crate::subrepo::{self, SubSource};
use crate::treediff::{self, TreeChange};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Extra holding a committer that differs from the author
pub const COMMITTER_EXTRA: &str = "committer";
/// Extra holding a timezone that is not a whole number of minutes
pub const HGTZ_EXTRA: &str = "hgtz";
/// Extra naming the charset of the user and description bytes
pub const ENCODING_EXTRA: &str = "encoding";

// Largest offset a "+hhmm" field can carry.
const MAX_OFFSET_MINUTES: i32 = 99 * 60 + 59;

/// Source-side metadata decoded from a target commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMeta {
    pub user: Vec<u8>,
    pub time: i64,
    /// Seconds west of UTC
    pub tz_offset: i32,
    pub description: Vec<u8>,
    /// Includes `branch` unless on the default branch
    pub extras: BTreeMap<String, Vec<u8>>,
    /// `(old, new)` pairs
    pub renames: Vec<(String, String)>,
    pub merge: Option<OctopusMarker>,
}

impl CommitMeta {
    pub fn branch(&self) -> String {
        self.extras
            .get("branch")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }
}

/// Translates commits between the two object models
#[derive(Debug, Clone)]
pub struct CommitTranslator {
    rules: IdentityRules,
    default_branch: String,
}

impl Default for CommitTranslator {
    fn default() -> Self {
        Self::new(IdentityRules::default(), DEFAULT_BRANCH)
    }
}

impl CommitTranslator {
    pub fn new(rules: IdentityRules, default_branch: impl Into<String>) -> Self {
        Self {
            rules,
            default_branch: default_branch.into(),
        }
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Copy sources recorded on the files a changeset touched
    pub fn renames<S: SourceStore>(
        &self,
        source: &S,
        changeset: &Changeset,
        manifest: &Manifest,
    ) -> Result<Vec<(String, String)>> {
        let mut renames = Vec::new();
        for path in &changeset.files {
            let Some(entry) = manifest.get(path) else { continue };
            let file = source.get_file(&entry.node)?.ok_or_else(|| {
                SyncError::consistency(format!("file revision {} of {} missing", entry.node, path))
            })?;
            if let Some((old, _)) = file.copy {
                renames.push((old, path.clone()));
            }
        }
        Ok(renames)
    }

    /// Build the target commit(s) for `changeset`.
    ///
    /// `parents` are the already translated parents in source order. The
    /// last commit returned is the one that maps to the changeset.
    pub fn export_commit<S: SourceStore>(
        &self,
        source: &S,
        changeset: &Changeset,
        manifest: &Manifest,
        tree: ObjectId,
        parents: &[ObjectId],
    ) -> Result<Vec<Commit>> {
        let mut footer = Footer::default();
        let branch = changeset.branch();
        if branch != self.default_branch {
            footer.branch = Some(branch);
        }

        let mut extras = changeset.extras.clone();
        extras.remove("branch");
        let declared = extras
            .get(ENCODING_EXTRA)
            .map(|e| String::from_utf8_lossy(e).into_owned());

        let (user_text, _) = charset::decode(&changeset.user, declared.as_deref());
        let (name, email) = self.rules.to_target(&user_text);
        let rebuilt = identity::to_source(&name, &email);
        if rebuilt.as_bytes() != changeset.user.as_slice() {
            footer.user_delta = Some(delta::diff(rebuilt.as_bytes(), &changeset.user));
        }

        let mut offset_minutes = -(changeset.tz_offset / 60);
        if changeset.tz_offset % 60 != 0 || offset_minutes.abs() > MAX_OFFSET_MINUTES {
            if offset_minutes.abs() > MAX_OFFSET_MINUTES {
                offset_minutes = 0;
            }
            extras.insert(HGTZ_EXTRA.to_string(), changeset.tz_offset.to_string().into_bytes());
        }
        let author = Signature::new(name, email, changeset.time, offset_minutes);

        let committer = match extras.get(COMMITTER_EXTRA).and_then(|raw| parse_committer(raw)) {
            Some(sig) if sig != author => {
                extras.remove(COMMITTER_EXTRA);
                sig
            }
            _ => author.clone(),
        };

        footer.extras = extras;
        footer.renames = self.renames(source, changeset, manifest)?;

        let (text, _) = charset::decode(&changeset.description, declared.as_deref());
        if text.as_bytes() != changeset.description.as_slice() {
            footer.message_delta = Some(delta::diff(text.as_bytes(), &changeset.description));
        }
        if parents.len() > 2 {
            footer.merge = Some(OctopusMarker::OctopusDone);
        }

        let template = Commit {
            tree,
            parents: parents.to_vec(),
            author,
            committer,
            encoding: None,
            message: footer::append(&text, &footer).into_bytes(),
        };
        octopus::build_chain(&template, &text)
    }

    /// Decode the source-side metadata carried by a target commit
    pub fn decode_metadata(&self, commit: &Commit) -> Result<CommitMeta> {
        let (text, _) = charset::decode(&commit.message, commit.encoding.as_deref());
        let (body, footer) = footer::split(&text);
        let footer = footer.unwrap_or_default();

        let description = match &footer.message_delta {
            Some(d) => delta::apply(body.as_bytes(), d)?,
            None => body.as_bytes().to_vec(),
        };
        let rebuilt = identity::to_source(&commit.author.name, &commit.author.email);
        let user = match &footer.user_delta {
            Some(d) => delta::apply(rebuilt.as_bytes(), d)?,
            None => rebuilt.into_bytes(),
        };

        let mut extras = footer.extras;
        let tz_offset = extras
            .remove(HGTZ_EXTRA)
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(-commit.author.offset_minutes * 60);
        if commit.committer != commit.author {
            extras.insert(COMMITTER_EXTRA.to_string(), commit.committer.format().into_bytes());
        }
        let branch = footer.branch.unwrap_or_else(|| self.default_branch.clone());
        if branch != DEFAULT_BRANCH {
            extras.insert("branch".to_string(), branch.into_bytes());
        }

        Ok(CommitMeta {
            user,
            time: commit.author.time,
            tz_offset,
            description,
            extras,
            renames: footer.renames,
            merge: footer.merge,
        })
    }

    /// Write the changeset for a target commit into the source store.
    ///
    /// `parent_commits` are the commit's real (flattened) parents and
    /// `parent_nodes` their source counterparts, in the same order.
    pub fn import_commit<S: SourceStore, T: TargetStore>(
        &self,
        source: &mut S,
        target: &T,
        commit: &Commit,
        parent_commits: &[ObjectId],
        parent_nodes: &[NodeId],
    ) -> Result<NodeId> {
        let meta = self.decode_metadata(commit)?;
        let p1_manifest = source.manifest_of(&parent_nodes.first().copied().unwrap_or(NodeId::NULL))?;
        let p2_manifest = source.manifest_of(&parent_nodes.get(1).copied().unwrap_or(NodeId::NULL))?;
        let p1_tree = match parent_commits.first() {
            Some(id) => Some(target.commit(id)?.tree),
            None => None,
        };

        let mut changes = treediff::diff(target, p1_tree, commit.tree)?;
        let converged = match (p1_tree, parent_commits.get(1)) {
            (Some(p1_tree), Some(p2)) => {
                let p2_tree = target.commit(p2)?.tree;
                self.converged_files(target, &changes, &p1_manifest, &p2_manifest, p1_tree, p2_tree)?
            }
            _ => Vec::new(),
        };
        let converged_set: HashSet<String> = converged.iter().map(|c| c.path.clone()).collect();
        changes.extend(converged);

        let renames: HashMap<&str, &str> = meta
            .renames
            .iter()
            .map(|(old, new)| (new.as_str(), old.as_str()))
            .collect();
        let tree_has_hgsub = treediff::lookup(target, commit.tree, subrepo::HGSUB)?.is_some();

        let mut manifest = p1_manifest.clone();
        let mut files = BTreeSet::new();
        let mut gitlinks_touched = false;

        for change in &changes {
            let path = change.path.as_str();
            let old_is_link = matches!(change.old, Some((FileMode::Gitlink, _)));
            let new_is_link = matches!(change.new, Some((FileMode::Gitlink, _)));
            if old_is_link || new_is_link {
                gitlinks_touched = true;
                if new_is_link {
                    if manifest.remove(path).is_some() {
                        files.insert(path.to_string());
                    }
                    continue;
                }
            }
            if path == subrepo::GITMODULES && tree_has_hgsub {
                // generated from .hgsub on export
                continue;
            }

            let Some((mode, id)) = change.new else {
                if manifest.remove(path).is_some() {
                    files.insert(path.to_string());
                }
                continue;
            };
            let flags = mode.to_flags();
            let is_converged = converged_set.contains(path);

            if !is_converged && change.old.map(|(_, old_id)| old_id) == Some(id) {
                if let Some(entry) = p1_manifest.get(path) {
                    manifest.insert(path, ManifestEntry::new(entry.node, flags));
                    files.insert(path.to_string());
                    continue;
                }
            }

            let data = target
                .get_blob(&id)?
                .ok_or_else(|| SyncError::consistency(format!("blob {} for {} missing", id, path)))?
                .data;
            let fp1 = p1_manifest.get(path).map(|e| e.node).unwrap_or(NodeId::NULL);
            let mut fp2 = p2_manifest.get(path).map(|e| e.node).unwrap_or(NodeId::NULL);
            if fp2 == fp1 {
                fp2 = NodeId::NULL;
            }

            let copy = match renames.get(path) {
                Some(old) => match p1_manifest.get(old).or_else(|| p2_manifest.get(old)) {
                    Some(entry) => Some((old.to_string(), entry.node)),
                    None => {
                        warn!(path, copy_source = %old, "copy source not found in parents, dropping rename");
                        None
                    }
                },
                None => None,
            };
            let mut revision = match copy {
                Some(_) => FileRevision::new(data, (NodeId::NULL, fp1)),
                None => FileRevision::new(data, (fp1, fp2)),
            };
            revision.copy = copy;
            let node = source.put_file(&revision)?;
            manifest.insert(path, ManifestEntry::new(node, flags));
            files.insert(path.to_string());
        }

        if gitlinks_touched {
            self.import_subrepos(source, target, commit.tree, tree_has_hgsub, &mut manifest, &mut files)?;
        }

        let changeset = Changeset {
            manifest: source.put_manifest(&manifest)?,
            parents: parent_nodes.to_vec(),
            user: meta.user,
            time: meta.time,
            tz_offset: meta.tz_offset,
            files: files.into_iter().collect(),
            description: meta.description,
            extras: meta.extras,
        };
        let node = source.put_changeset(&changeset)?;
        debug!(commit = %commit.id(), node = %node, files = changeset.files.len(), "imported commit");
        Ok(node)
    }

    /// Files unchanged against p1 whose content matches in both parents but
    /// whose source revisions differ.
    fn converged_files<T: TargetStore>(
        &self,
        target: &T,
        changes: &[TreeChange],
        p1_manifest: &Manifest,
        p2_manifest: &Manifest,
        p1_tree: ObjectId,
        p2_tree: ObjectId,
    ) -> Result<Vec<TreeChange>> {
        let changed: HashSet<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        let mut candidates = Vec::new();
        for (path, entry) in &p1_manifest.entries {
            if changed.contains(path.as_str()) {
                continue;
            }
            match p2_manifest.get(path) {
                Some(other) if other.node != entry.node => candidates.push(path),
                _ => {}
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let p1_files = treediff::flatten(target, p1_tree)?;
        let p2_files = treediff::flatten(target, p2_tree)?;
        let mut converged = Vec::new();
        for path in candidates {
            match (p1_files.get(path), p2_files.get(path)) {
                (Some(a), Some(b)) if a.1 == b.1 => converged.push(TreeChange {
                    path: path.clone(),
                    old: Some(*a),
                    new: Some(*a),
                }),
                (Some(_), Some(_)) => {}
                _ => warn!(path = %path, "converged file not found in parent trees, skipping"),
            }
        }
        Ok(converged)
    }

    /// Merge gitlinks into `.hgsubstate` (and synthesize `.hgsub` for trees
    /// that never had one).
    fn import_subrepos<S: SourceStore, T: TargetStore>(
        &self,
        source: &mut S,
        target: &T,
        tree: ObjectId,
        tree_has_hgsub: bool,
        manifest: &mut Manifest,
        files: &mut BTreeSet<String>,
    ) -> Result<()> {
        let leaves = treediff::flatten(target, tree)?;
        let gitlinks: BTreeMap<String, ObjectId> = leaves
            .iter()
            .filter(|(_, (mode, _))| *mode == FileMode::Gitlink)
            .map(|(path, (_, id))| (path.clone(), *id))
            .collect();

        let subs = if tree_has_hgsub {
            subrepo::parse_hgsub(&read_manifest_file(source, manifest, subrepo::HGSUB)?.unwrap_or_default())
        } else {
            let modules = match leaves.get(subrepo::GITMODULES) {
                Some((_, id)) => target
                    .get_blob(id)?
                    .map(|b| subrepo::parse_gitmodules(&b.data))
                    .unwrap_or_default(),
                None => BTreeMap::new(),
            };
            gitlinks
                .keys()
                .map(|path| {
                    let url = modules.get(path).cloned().unwrap_or_else(|| path.clone());
                    (path.clone(), SubSource::git(url))
                })
                .collect()
        };

        let current = read_manifest_file(source, manifest, subrepo::HGSUBSTATE)?;
        let base = subrepo::parse_hgsubstate(current.as_deref().unwrap_or_default());
        let state = subrepo::import_substate(&subs, &base, &gitlinks);
        if state != base || current.is_none() != state.is_empty() {
            let data = (!state.is_empty()).then(|| subrepo::render_hgsubstate(&state));
            write_manifest_file(source, manifest, files, subrepo::HGSUBSTATE, data)?;
        }

        if !tree_has_hgsub {
            let data = (!subs.is_empty()).then(|| subrepo::render_hgsub(&subs));
            if read_manifest_file(source, manifest, subrepo::HGSUB)? != data {
                write_manifest_file(source, manifest, files, subrepo::HGSUB, data)?;
            }
        }
        Ok(())
    }
}

fn parse_committer(raw: &[u8]) -> Option<Signature> {
    let text = std::str::from_utf8(raw).ok()?;
    let sig = Signature::parse(text).ok()?;
    (sig.format() == text).then_some(sig)
}

fn read_manifest_file<S: SourceStore>(source: &S, manifest: &Manifest, path: &str) -> Result<Option<Vec<u8>>> {
    match manifest.get(path) {
        Some(entry) => Ok(source.get_file(&entry.node)?.map(|f| f.data)),
        None => Ok(None),
    }
}

fn write_manifest_file<S: SourceStore>(
    source: &mut S,
    manifest: &mut Manifest,
    files: &mut BTreeSet<String>,
    path: &str,
    data: Option<Vec<u8>>,
) -> Result<()> {
    match data {
        Some(data) => {
            let parent = manifest.get(path).map(|e| e.node).unwrap_or(NodeId::NULL);
            let node = source.put_file(&FileRevision::new(data, (parent, NodeId::NULL)))?;
            manifest.insert(path, ManifestEntry::new(node, ""));
        }
        None => {
            manifest.remove(path);
        }
    }
    files.insert(path.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::export_full;
    use crate::object::Object;
    use crate::storage::{MemorySourceStore, MemoryTargetStore};

    struct Fixture {
        source: MemorySourceStore,
        target: MemoryTargetStore,
        translator: CommitTranslator,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: MemorySourceStore::new(),
                target: MemoryTargetStore::new(),
                translator: CommitTranslator::default(),
            }
        }

        fn commit(&mut self, files: &[(&str, &[u8])], user: &[u8], description: &[u8]) -> (Changeset, Manifest) {
            let mut manifest = Manifest::new();
            for (path, data) in files {
                let node = self
                    .source
                    .put_file(&FileRevision::new(data.to_vec(), (NodeId::NULL, NodeId::NULL)))
                    .unwrap();
                manifest.insert(*path, ManifestEntry::new(node, ""));
            }
            let changeset = Changeset {
                manifest: self.source.put_manifest(&manifest).unwrap(),
                parents: vec![],
                user: user.to_vec(),
                time: 1_700_000_000,
                tz_offset: -3600,
                files: files.iter().map(|(p, _)| p.to_string()).collect(),
                description: description.to_vec(),
                extras: BTreeMap::new(),
            };
            (changeset, manifest)
        }

        fn export(&mut self, changeset: &Changeset, manifest: &Manifest) -> Commit {
            let tree = export_full(&self.source, &mut self.target, manifest).unwrap();
            let chain = self
                .translator
                .export_commit(&self.source, changeset, manifest, tree, &[])
                .unwrap();
            let head = chain.last().unwrap().clone();
            self.target.put(&Object::Commit(head.clone())).unwrap();
            head
        }
    }

    #[test]
    fn test_plain_commit_has_no_footer() {
        let mut fx = Fixture::new();
        let (cs, m) = fx.commit(&[("a", b"1")], b"Jane <jane@example.com>", b"initial");
        let commit = fx.export(&cs, &m);
        assert_eq!(commit.message, b"initial");
        assert_eq!(commit.author.offset_minutes, 60);
        assert_eq!(commit.committer, commit.author);
    }

    #[test]
    fn test_metadata_survives_roundtrip() {
        let mut fx = Fixture::new();
        let (mut cs, m) = fx.commit(&[("a", b"1")], b"J\xf6rg <j@x>", b"caf\xe9 \x85 notes");
        cs.extras.insert("branch".to_string(), b"stable".to_vec());
        cs.extras.insert("topic".to_string(), b"x : y".to_vec());
        cs.extras.insert(
            COMMITTER_EXTRA.to_string(),
            Signature::new("Bot", "bot@x", 5, 0).format().into_bytes(),
        );
        cs.tz_offset = 19; // not a whole minute
        let commit = fx.export(&cs, &m);

        assert!(std::str::from_utf8(&commit.message).is_ok());
        assert_eq!(commit.committer.name, "Bot");
        let meta = fx.translator.decode_metadata(&commit).unwrap();
        assert_eq!(meta.user, cs.user);
        assert_eq!(meta.description, cs.description);
        assert_eq!(meta.tz_offset, 19);
        assert_eq!(meta.extras, cs.extras);
        assert_eq!(meta.branch(), "stable");
    }

    #[test]
    fn test_import_reproduces_changeset() {
        let mut fx = Fixture::new();
        let (mut cs, m) = fx.commit(&[("a", b"1"), ("dir/b", b"2")], b"Jane <jane@example.com>", b"root");
        cs.files.sort();
        let node = fx.source.put_changeset(&cs).unwrap();
        let commit = fx.export(&cs, &m);

        let mut fresh = MemorySourceStore::new();
        let imported = fx
            .translator
            .import_commit(&mut fresh, &fx.target, &commit, &[], &[])
            .unwrap();
        assert_eq!(imported, node);
    }

    #[test]
    fn test_sanitized_identity_is_restored_on_import() {
        let mut fx = Fixture::new();
        let (cs, m) = fx.commit(&[("a", b"1")], b"weird <name> <w@x>", b"msg");
        let commit = fx.export(&cs, &m);
        assert!(!commit.author.name.contains('<'));
        let meta = fx.translator.decode_metadata(&commit).unwrap();
        assert_eq!(meta.user, cs.user);
    }
}
