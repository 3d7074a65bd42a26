//! Target-system object model
//!
//! Content-addressable commit/tree/blob/tag objects. An object's id is the
//! SHA-1 of `"<kind> <len>\0"` followed by its serialized body, so two trees
//! with identical entries always hash to the same id.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Unique identifier for any target object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// The all-zero id, used for "no object" in ref updates
    pub const NULL: ObjectId = ObjectId([0u8; 20]);

    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Compute the id of an object body of the given kind
    pub fn for_object(kind: ObjectKind, body: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", kind.as_str(), body.len()).as_bytes());
        hasher.update(body);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Build from a 20-byte slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(ObjectKind::Commit),
            "tree" => Some(ObjectKind::Tree),
            "blob" => Some(ObjectKind::Blob),
            "tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    /// Type code used in pack entries
    pub const fn pack_code(&self) -> u8 {
        match self {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
            ObjectKind::Tag => 4,
        }
    }

    pub fn from_pack_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

/// Mode of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileMode {
    Regular,
    Executable,
    Symlink,
    /// Nested repository link; the entry id is a foreign commit hash.
    Gitlink,
    Tree,
}

impl FileMode {
    pub const fn octal(&self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
            FileMode::Symlink => "120000",
            FileMode::Gitlink => "160000",
            FileMode::Tree => "40000",
        }
    }

    pub fn from_octal(s: &str) -> Option<Self> {
        match s {
            "100644" | "100664" | "100640" => Some(FileMode::Regular),
            "100755" => Some(FileMode::Executable),
            "120000" => Some(FileMode::Symlink),
            "160000" => Some(FileMode::Gitlink),
            "40000" | "040000" => Some(FileMode::Tree),
            _ => None,
        }
    }

    /// Source-system manifest flags for a file mode
    pub fn to_flags(&self) -> &'static str {
        match self {
            FileMode::Executable => "x",
            FileMode::Symlink => "l",
            _ => "",
        }
    }

    /// File mode for source-system manifest flags
    pub fn from_flags(flags: &str) -> Self {
        if flags.contains('l') {
            FileMode::Symlink
        } else if flags.contains('x') {
            FileMode::Executable
        } else {
            FileMode::Regular
        }
    }
}

/// File content object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(ObjectKind::Blob, &self.data)
    }
}

/// Directory tree entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: FileMode,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, mode: FileMode, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            mode,
            id,
        }
    }

    /// Key used for canonical entry ordering (directories compare as `name/`)
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode == FileMode::Tree {
            key.push(b'/');
        }
        key
    }
}

/// Directory object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    /// Entries keyed by name
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an entry
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    /// Get an entry
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in canonical order
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        let mut sorted: Vec<&TreeEntry> = self.entries.values().collect();
        sorted.sort_by_key(|e| e.sort_key());
        sorted.into_iter()
    }

    /// Serialize as `<mode> <name>\0<20 raw bytes>` records
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in self.iter() {
            out.extend_from_slice(entry.mode.octal().as_bytes());
            out.push(b' ');
            out.extend_from_slice(entry.name.as_bytes());
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut tree = Tree::new();
        let mut pos = 0;
        while pos < data.len() {
            let space = data[pos..]
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| SyncError::malformed("tree entry missing mode separator"))?;
            let mode_str = std::str::from_utf8(&data[pos..pos + space])
                .map_err(|_| SyncError::malformed("tree entry mode is not ASCII"))?;
            let mode = FileMode::from_octal(mode_str)
                .ok_or_else(|| SyncError::malformed(format!("invalid tree mode {}", mode_str)))?;
            pos += space + 1;

            let nul = data[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| SyncError::malformed("tree entry missing NUL"))?;
            let name = String::from_utf8(data[pos..pos + nul].to_vec())
                .map_err(|_| SyncError::malformed("tree entry name is not UTF-8"))?;
            pos += nul + 1;

            let id = data
                .get(pos..pos + 20)
                .and_then(ObjectId::from_slice)
                .ok_or_else(|| SyncError::malformed("truncated tree entry id"))?;
            pos += 20;

            tree.insert(TreeEntry::new(name, mode, id));
        }
        Ok(tree)
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(ObjectKind::Tree, &self.to_bytes())
    }
}

/// Author or committer identity with timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Unix seconds
    pub time: i64,
    /// Offset east of UTC, in minutes
    pub offset_minutes: i32,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, time: i64, offset_minutes: i32) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            time,
            offset_minutes,
        }
    }

    /// Format as `Name <email> 1234567890 +0100`
    pub fn format(&self) -> String {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let abs = self.offset_minutes.abs();
        format!(
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.time,
            sign,
            abs / 60,
            abs % 60
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let lt = line
            .find('<')
            .ok_or_else(|| SyncError::malformed("signature missing '<'"))?;
        let gt = line[lt..]
            .find('>')
            .map(|i| i + lt)
            .ok_or_else(|| SyncError::malformed("signature missing '>'"))?;
        let name = line[..lt].trim_end().to_string();
        let email = line[lt + 1..gt].to_string();

        let mut rest = line[gt + 1..].split_whitespace();
        let time = rest
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(|| SyncError::malformed("signature missing timestamp"))?;
        let tz = rest.next().unwrap_or("+0000");
        let offset_minutes = parse_tz(tz)?;

        Ok(Self {
            name,
            email,
            time,
            offset_minutes,
        })
    }
}

fn parse_tz(tz: &str) -> Result<i32> {
    let bad = || SyncError::malformed(format!("invalid timezone {}", tz));
    if tz.len() != 5 || !tz.is_ascii() {
        return Err(bad());
    }
    let sign = match &tz[..1] {
        "+" => 1,
        "-" => -1,
        _ => return Err(bad()),
    };
    let hours: i32 = tz[1..3].parse().map_err(|_| bad())?;
    let minutes: i32 = tz[3..5].parse().map_err(|_| bad())?;
    Ok(sign * (hours * 60 + minutes))
}

/// Commit object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    /// Value of the `encoding` header, if any
    pub encoding: Option<String>,
    pub message: Vec<u8>,
}

impl Commit {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("tree {}\n", self.tree).as_bytes());
        for parent in &self.parents {
            out.extend_from_slice(format!("parent {}\n", parent).as_bytes());
        }
        out.extend_from_slice(format!("author {}\n", self.author.format()).as_bytes());
        out.extend_from_slice(format!("committer {}\n", self.committer.format()).as_bytes());
        if let Some(encoding) = &self.encoding {
            out.extend_from_slice(format!("encoding {}\n", encoding).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let split = find_subslice(data, b"\n\n")
            .ok_or_else(|| SyncError::malformed("commit missing header terminator"))?;
        let header = std::str::from_utf8(&data[..split])
            .map_err(|_| SyncError::malformed("commit header is not UTF-8"))?;
        let message = data[split + 2..].to_vec();

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut encoding = None;
        for line in header.lines() {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "tree" => tree = Some(ObjectId::from_hex(value)?),
                "parent" => parents.push(ObjectId::from_hex(value)?),
                "author" => author = Some(Signature::parse(value)?),
                "committer" => committer = Some(Signature::parse(value)?),
                "encoding" => encoding = Some(value.to_string()),
                _ => {}
            }
        }

        let author = author.ok_or_else(|| SyncError::malformed("commit missing author"))?;
        Ok(Self {
            tree: tree.ok_or_else(|| SyncError::malformed("commit missing tree"))?,
            parents,
            committer: committer.unwrap_or_else(|| author.clone()),
            author,
            encoding,
            message,
        })
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(ObjectKind::Commit, &self.to_bytes())
    }

    /// Check if this is an initial commit (no parents)
    pub fn is_initial(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Annotated tag object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub object: ObjectId,
    pub kind: ObjectKind,
    pub name: String,
    pub tagger: Option<Signature>,
    pub message: Vec<u8>,
}

impl Tag {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("object {}\n", self.object).as_bytes());
        out.extend_from_slice(format!("type {}\n", self.kind.as_str()).as_bytes());
        out.extend_from_slice(format!("tag {}\n", self.name).as_bytes());
        if let Some(tagger) = &self.tagger {
            out.extend_from_slice(format!("tagger {}\n", tagger.format()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let split = find_subslice(data, b"\n\n").unwrap_or(data.len());
        let header = std::str::from_utf8(&data[..split])
            .map_err(|_| SyncError::malformed("tag header is not UTF-8"))?;
        let message = data.get(split + 2..).map(<[u8]>::to_vec).unwrap_or_default();

        let mut object = None;
        let mut kind = None;
        let mut name = None;
        let mut tagger = None;
        for line in header.lines() {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "object" => object = Some(ObjectId::from_hex(value)?),
                "type" => kind = ObjectKind::parse(value),
                "tag" => name = Some(value.to_string()),
                "tagger" => tagger = Some(Signature::parse(value)?),
                _ => {}
            }
        }

        Ok(Self {
            object: object.ok_or_else(|| SyncError::malformed("tag missing object"))?,
            kind: kind.ok_or_else(|| SyncError::malformed("tag missing type"))?,
            name: name.ok_or_else(|| SyncError::malformed("tag missing name"))?,
            tagger,
            message,
        })
    }
}

/// Generic object that can be any type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Commit(Commit),
    Tree(Tree),
    Blob(Blob),
    Tag(Tag),
}

impl Object {
    /// Get the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(self.kind(), &self.body())
    }

    /// Get the object kind
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Commit(_) => ObjectKind::Commit,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tag(_) => ObjectKind::Tag,
        }
    }

    /// Serialized body (without the kind/length header)
    pub fn body(&self) -> Vec<u8> {
        match self {
            Object::Commit(commit) => commit.to_bytes(),
            Object::Tree(tree) => tree.to_bytes(),
            Object::Blob(blob) => blob.data.clone(),
            Object::Tag(tag) => tag.to_bytes(),
        }
    }

    /// Parse a body of the given kind
    pub fn parse(kind: ObjectKind, body: &[u8]) -> Result<Self> {
        Ok(match kind {
            ObjectKind::Commit => Object::Commit(Commit::from_bytes(body)?),
            ObjectKind::Tree => Object::Tree(Tree::from_bytes(body)?),
            ObjectKind::Blob => Object::Blob(Blob::new(body.to_vec())),
            ObjectKind::Tag => Object::Tag(Tag::from_bytes(body)?),
        })
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
