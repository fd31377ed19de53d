//! Module implement tree snapshots and their chk representation.
//!
//! An inventory is the complete snapshot of tree state at a revision:
//! every file, directory and symlink, their ids, names, and content
//! hashes. For storage an inventory becomes two [crate::chk::CHKMap]s,
//!
//! * `id_to_entry`, `(file-id,)` keyed, value the serialised entry.
//! * `parent_id_basename_to_file_id`, `(parent-id, basename)` keyed,
//!   value the file id, for name lookups without loading every entry.
//!
//! The inventory record stored against the revision carries just the
//! revision id, the root id and the two map roots; incremental fetch
//! walks the map differences instead of whole inventories.

use std::collections::BTreeMap;

use crate::{
    chk::{self, CHKMap, SearchKey},
    Key, Result,
};

/// Kind specific data of an inventory entry.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryKind {
    Dir,
    File {
        size: usize,
        sha1: String,
        executable: bool,
    },
    Link {
        target: Vec<u8>,
    },
}

/// One file, directory or symlink in a tree snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct InventoryEntry {
    pub file_id: Vec<u8>,
    /// Basename within the parent directory, empty only for the root.
    pub name: Vec<u8>,
    /// Directory entry this one lives in, empty only for the root.
    pub parent_id: Vec<u8>,
    /// Revision that last changed this entry.
    pub revision: Vec<u8>,
    pub kind: EntryKind,
}

impl InventoryEntry {
    /// Serialise for storage as a chk value, a kind-tagged line
    /// followed by the common and kind-specific fields.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        match &self.kind {
            EntryKind::Dir => out.extend_from_slice(b"dir: "),
            EntryKind::File { .. } => out.extend_from_slice(b"file: "),
            EntryKind::Link { .. } => out.extend_from_slice(b"symlink: "),
        }
        out.extend_from_slice(&self.file_id);
        out.push(b'\n');
        out.extend_from_slice(&self.parent_id);
        out.push(b'\n');
        out.extend_from_slice(&self.name);
        out.push(b'\n');
        out.extend_from_slice(&self.revision);
        match &self.kind {
            EntryKind::Dir => (),
            EntryKind::File {
                size,
                sha1,
                executable,
            } => {
                out.push(b'\n');
                out.extend_from_slice(sha1.as_bytes());
                out.extend_from_slice(format!("\n{}\n", size).as_bytes());
                out.push(if *executable { b'Y' } else { b'N' });
            }
            EntryKind::Link { target } => {
                out.push(b'\n');
                out.extend_from_slice(target);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<InventoryEntry> {
        let mut lines = bytes.split(|b| *b == b'\n');
        let head = match lines.next() {
            Some(head) => head,
            None => return err_at!(FailConvert, msg: "empty inventory entry"),
        };
        let (kind_tag, file_id) = match head.iter().position(|b| *b == b' ') {
            Some(at) if head.get(at.wrapping_sub(1)) == Some(&b':') => {
                (&head[..at - 1], head[at + 1..].to_vec())
            }
            _ => return err_at!(FailConvert, msg: "untagged inventory entry"),
        };
        let mut field = |what: &str| match lines.next() {
            Some(line) => Ok(line.to_vec()),
            None => err_at!(FailConvert, msg: "inventory entry misses {}", what),
        };
        let parent_id = field("parent id")?;
        let name = field("name")?;
        let revision = field("revision")?;

        let kind = match kind_tag {
            b"dir" => EntryKind::Dir,
            b"file" => {
                let sha1 = match String::from_utf8(field("sha1")?) {
                    Ok(sha1) => sha1,
                    Err(_) => return err_at!(FailConvert, msg: "entry sha1 not ascii"),
                };
                let size = {
                    let line = field("size")?;
                    let line = String::from_utf8_lossy(&line).to_string();
                    err_at!(FailConvert, line.parse::<usize>(), "entry size")?
                };
                let executable = match field("executable")?.as_slice() {
                    b"Y" => true,
                    b"N" => false,
                    _ => return err_at!(FailConvert, msg: "entry executable flag"),
                };
                EntryKind::File {
                    size,
                    sha1,
                    executable,
                }
            }
            b"symlink" => EntryKind::Link {
                target: field("target")?,
            },
            _ => return err_at!(FailConvert, msg: "inventory entry kind"),
        };
        Ok(InventoryEntry {
            file_id,
            name,
            parent_id,
            revision,
            kind,
        })
    }
}

/// A complete tree snapshot, keyed by file id.
#[derive(Clone, Debug, PartialEq)]
pub struct Inventory {
    pub revision_id: Vec<u8>,
    pub entries: BTreeMap<Vec<u8>, InventoryEntry>,
}

impl Inventory {
    pub fn new(revision_id: &[u8]) -> Inventory {
        Inventory {
            revision_id: revision_id.to_vec(),
            entries: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, entry: InventoryEntry) -> Result<()> {
        if self.entries.contains_key(&entry.file_id) {
            return err_at!(InconsistentAdd, msg: "file id {:?} twice", entry.file_id);
        }
        if entry.parent_id.is_empty() && !matches!(entry.kind, EntryKind::Dir) {
            return err_at!(InvalidFile, msg: "tree root must be a directory");
        }
        self.entries.insert(entry.file_id.clone(), entry);
        Ok(())
    }

    /// File id of the tree root, the entry without a parent.
    pub fn root_id(&self) -> Option<&[u8]> {
        self.entries
            .values()
            .find(|e| e.parent_id.is_empty())
            .map(|e| e.file_id.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Default leaf budget for inventory maps.
pub const MAXIMUM_SIZE: usize = 4096;

/// The chk form of an [Inventory], two map roots plus identity.
#[derive(Clone, Debug, PartialEq)]
pub struct ChkInventory {
    pub revision_id: Vec<u8>,
    pub root_id: Vec<u8>,
    pub id_to_entry: String,
    pub parent_id_basename_to_file_id: String,
}

impl ChkInventory {
    /// Write `inv` into the chk store, returning the roots.
    pub fn from_inventory(
        store: &mut dyn chk::Store,
        inv: &Inventory,
        maximum_size: usize,
    ) -> Result<ChkInventory> {
        let root_id = match inv.root_id() {
            Some(root_id) => root_id.to_vec(),
            None => return err_at!(InvalidFile, msg: "inventory without a root"),
        };

        let mut id_to_entry = CHKMap::new(map_config(maximum_size, 1));
        for (file_id, entry) in inv.entries.iter() {
            let key: Key = vec![file_id.clone()];
            id_to_entry.map(store, &key, &entry.to_bytes())?;
        }

        let mut parent_map = CHKMap::new(map_config(maximum_size, 2));
        for entry in inv.entries.values() {
            let key: Key = vec![entry.parent_id.clone(), entry.name.clone()];
            parent_map.map(store, &key, &entry.file_id)?;
        }

        Ok(ChkInventory {
            revision_id: inv.revision_id.clone(),
            root_id,
            id_to_entry: id_to_entry.save(store)?,
            parent_id_basename_to_file_id: parent_map.save(store)?,
        })
    }

    /// Materialise the full inventory back from the chk store.
    pub fn to_inventory(&self, store: &mut dyn chk::Store) -> Result<Inventory> {
        let mut map =
            CHKMap::from_root(store, &self.id_to_entry, map_config(MAXIMUM_SIZE, 1))?;
        let mut inv = Inventory::new(&self.revision_id);
        for (_, value) in map.iter_items(store)?.into_iter() {
            inv.add(InventoryEntry::from_bytes(&value)?)?;
        }
        Ok(inv)
    }

    /// Find a file id by (parent directory id, basename) without
    /// loading the whole inventory.
    pub fn lookup_by_name(
        &self,
        store: &mut dyn chk::Store,
        parent_id: &[u8],
        name: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut map = CHKMap::from_root(
            store,
            &self.parent_id_basename_to_file_id,
            map_config(MAXIMUM_SIZE, 2),
        )?;
        map.get(store, &vec![parent_id.to_vec(), name.to_vec()])
    }

    /// Entry-level changes against a basis inventory, `(file-id, this,
    /// basis)` for every entry that differs. Shared subtrees of the
    /// underlying maps are skipped by hash.
    pub fn iter_changes(
        &self,
        store: &mut dyn chk::Store,
        basis: &ChkInventory,
    ) -> Result<Vec<(Vec<u8>, Option<InventoryEntry>, Option<InventoryEntry>)>> {
        let mut this =
            CHKMap::from_root(store, &self.id_to_entry, map_config(MAXIMUM_SIZE, 1))?;
        let mut other =
            CHKMap::from_root(store, &basis.id_to_entry, map_config(MAXIMUM_SIZE, 1))?;
        let mut out = vec![];
        for (key, this_value, other_value) in this.iter_changes(store, &mut other)?.into_iter()
        {
            let this_entry = match this_value {
                Some(bytes) => Some(InventoryEntry::from_bytes(&bytes)?),
                None => None,
            };
            let other_entry = match other_value {
                Some(bytes) => Some(InventoryEntry::from_bytes(&bytes)?),
                None => None,
            };
            out.push((key[0].clone(), this_entry, other_entry));
        }
        Ok(out)
    }

    /// Serialise the inventory record stored against the revision.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(b"chkinventory:\n");
        out.extend_from_slice(b"revision_id: ");
        out.extend_from_slice(&self.revision_id);
        out.extend_from_slice(b"\nroot_id: ");
        out.extend_from_slice(&self.root_id);
        out.extend_from_slice(b"\nparent_id_basename_to_file_id: ");
        out.extend_from_slice(self.parent_id_basename_to_file_id.as_bytes());
        out.extend_from_slice(b"\nid_to_entry: ");
        out.extend_from_slice(self.id_to_entry.as_bytes());
        out.push(b'\n');
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ChkInventory> {
        if !bytes.starts_with(b"chkinventory:\n") {
            return err_at!(FailConvert, msg: "not a chk inventory record");
        }
        let mut revision_id = None;
        let mut root_id = None;
        let mut id_to_entry = None;
        let mut parent_map = None;
        for line in bytes[14..].split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let at = match line.windows(2).position(|w| w == b": ") {
                Some(at) => at,
                None => return err_at!(FailConvert, msg: "bad chk inventory line"),
            };
            let (field, value) = (&line[..at], line[at + 2..].to_vec());
            match field {
                b"revision_id" => revision_id = Some(value),
                b"root_id" => root_id = Some(value),
                b"id_to_entry" => {
                    id_to_entry = Some(err_at!(FailConvert, String::from_utf8(value))?)
                }
                b"parent_id_basename_to_file_id" => {
                    parent_map = Some(err_at!(FailConvert, String::from_utf8(value))?)
                }
                _ => return err_at!(FailConvert, msg: "unknown chk inventory field"),
            }
        }
        match (revision_id, root_id, id_to_entry, parent_map) {
            (Some(revision_id), Some(root_id), Some(id_to_entry), Some(parent_map)) => {
                Ok(ChkInventory {
                    revision_id,
                    root_id,
                    id_to_entry,
                    parent_id_basename_to_file_id: parent_map,
                })
            }
            _ => err_at!(FailConvert, msg: "incomplete chk inventory record"),
        }
    }
}

fn map_config(maximum_size: usize, key_width: usize) -> chk::Config {
    let mut config = chk::Config::new(maximum_size, key_width);
    config.set_search_key(SearchKey::Hash16Way);
    config
}

#[cfg(test)]
#[path = "inventory_test.rs"]
mod inventory_test;
