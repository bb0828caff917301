use memchr::memchr;

use crate::{Error, Result};

/// In-memory directory: `name -> inode id` entries in insertion order,
/// plus the parent and self ids persisted alongside them.
///
/// On disk a directory is `[i32 parent][i32 self][paths-blob][NUL]`. The
/// paths-blob concatenates `<name>/<decimal-id>` entries without
/// separators; the self-entry has the empty name, so the blob always opens
/// with `/<self_id>`. An id's digit run (with an optional `-` prefix) ends
/// exactly where the next name starts, which is why names may not begin
/// with a digit or a dash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    parent: i32,
    inode: i32,
    entries: Vec<(String, i32)>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit() || c == '-')
        && !name.contains(['/', '\0'])
}

/// Splits a leading decimal id off `s`.
fn split_id(s: &str) -> Result<(i32, &str)> {
    let digits = usize::from(s.starts_with('-'));
    let end = s[digits..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(s.len(), |i| digits + i);
    let id = s[..end].parse().map_err(|_| Error::CorruptDirectory)?;
    Ok((id, &s[end..]))
}

impl Directory {
    /// Smallest serialized directory: the two id words plus the shortest
    /// self-entry (`/<one digit>`) and the trailing NUL.
    pub const MIN_SIZE_ON_DISK: usize = 2 * size_of::<i32>() + 3;

    #[must_use]
    pub fn new(self_id: i32, parent_id: i32) -> Self {
        Self {
            parent: parent_id,
            inode: self_id,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn self_id(&self) -> i32 {
        self.inode
    }

    #[must_use]
    pub fn parent_id(&self) -> i32 {
        self.parent
    }

    pub fn set_parent(&mut self, parent_id: i32) {
        self.parent = parent_id;
    }

    /// Appends an entry.
    ///
    /// Names must be non-empty, must not contain `/` or NUL, and must not
    /// begin with a decimal digit or a dash; anything else would make the
    /// blob ambiguous to parse back.
    pub fn add_file(&mut self, name: &str, id: i32) -> Result<()> {
        if !valid_name(name) {
            return Err(Error::InvalidArgument);
        }
        self.entries.push((name.to_owned(), id));
        Ok(())
    }

    #[must_use]
    pub fn has_file(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Id recorded for `name`; the most recently inserted entry wins.
    pub fn file_inode(&self, name: &str) -> Result<i32> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|&(_, id)| id)
            .ok_or(Error::NotFound)
    }

    /// Drops every entry recorded for `name`.
    pub fn remove_file(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    /// Number of entries, the self-entry excluded.
    #[must_use]
    pub fn num_files(&self) -> usize {
        self.entries.len()
    }

    /// Entry names in blob order, the self-entry excluded.
    #[must_use]
    pub fn file_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, i32)> {
        self.entries.iter().map(|(n, id)| (n.as_str(), *id))
    }

    fn paths_blob(&self) -> String {
        let mut blob = format!("/{}", self.inode);
        for (name, id) in &self.entries {
            blob.push_str(name);
            blob.push('/');
            blob.push_str(&id.to_string());
        }
        blob
    }

    /// Serialized form: parent id, self id, paths-blob, NUL.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let blob = self.paths_blob();
        let mut bytes = Vec::with_capacity(2 * size_of::<i32>() + blob.len() + 1);
        bytes.extend_from_slice(&self.parent.to_ne_bytes());
        bytes.extend_from_slice(&self.inode.to_ne_bytes());
        bytes.extend_from_slice(blob.as_bytes());
        bytes.push(0);
        bytes
    }

    /// Bytes [`Directory::serialize`] will produce.
    #[must_use]
    pub fn size_on_disk(&self) -> usize {
        2 * size_of::<i32>() + self.paths_blob().len() + 1
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::MIN_SIZE_ON_DISK {
            return Err(Error::CorruptDirectory);
        }
        let parent = i32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        let inode = i32::from_ne_bytes(bytes[4..8].try_into().unwrap());

        let blob = &bytes[8..];
        let end = memchr(0, blob).ok_or(Error::CorruptDirectory)?;
        let blob = std::str::from_utf8(&blob[..end]).map_err(|_| Error::CorruptDirectory)?;

        // the blob opens with the self-entry
        let rest = blob.strip_prefix('/').ok_or(Error::CorruptDirectory)?;
        let (sentinel, mut rest) = split_id(rest)?;
        if sentinel != inode {
            return Err(Error::CorruptDirectory);
        }

        let mut entries = Vec::new();
        while !rest.is_empty() {
            let slash = memchr(b'/', rest.as_bytes()).ok_or(Error::CorruptDirectory)?;
            let name = &rest[..slash];
            if !valid_name(name) {
                return Err(Error::CorruptDirectory);
            }
            let (id, tail) = split_id(&rest[slash + 1..])?;
            entries.push((name.to_owned(), id));
            rest = tail;
        }
        Ok(Self {
            parent,
            inode,
            entries,
        })
    }
}
