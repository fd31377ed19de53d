use std::{collections::BTreeMap, ffi};

use crate::{
    btree::{self, node, ChunkWriter, Config, IndexEntry},
    util, Key, Result,
};

// Placeholder written while measuring how many keys fit into an
// internal page. Seven digits cover any page number the real offset
// line can need, so the final serialisation never compresses larger.
const OFFSET_PLACEHOLDER: &[u8] = b"offset=9999999\n";

// One internal page under construction, keys for children 1..n, the
// first child contributes no key line.
struct InternalPlan {
    first_key: Key,
    keys: Vec<Key>,
    n_children: usize,
}

/// In-memory builder for an immutable btree index.
///
/// Entries accumulate sorted in memory; [Builder::to_bytes] emits leaf
/// pages through the chunk writer, then derives internal rows bottom-up
/// from the first key of each page until a single root page remains.
pub struct Builder {
    config: Config,
    entries: BTreeMap<Key, (Vec<u8>, Vec<Vec<Key>>)>,
}

impl Builder {
    pub fn new(config: Config) -> Builder {
        Builder {
            config,
            entries: BTreeMap::new(),
        }
    }

    /// Add an entry. Keys must be unique, adding a key twice is an
    /// inconsistency the caller is expected to have resolved.
    pub fn add_entry(&mut self, key: &Key, value: &[u8], refs: &[Vec<Key>]) -> Result<()> {
        node::validate_key(key, self.config.key_elements)?;
        node::validate_value(value)?;
        if refs.len() != self.config.node_ref_lists {
            return err_at!(
                InvalidFile, msg: "{} of {} reference lists",
                refs.len(), self.config.node_ref_lists
            );
        }
        for ref_list in refs.iter() {
            for rkey in ref_list.iter() {
                node::validate_key(rkey, self.config.key_elements)?;
            }
        }
        if self.entries.contains_key(key) {
            return err_at!(InconsistentAdd, msg: "duplicate key {:?}", key);
        }
        self.entries.insert(key.clone(), (value.to_vec(), refs.to_vec()));
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Look up a key already added, used by writers that shadow an
    /// unfinished index.
    pub fn get(&self, key: &Key) -> Option<IndexEntry> {
        self.entries.get(key).map(|(value, refs)| IndexEntry {
            key: key.clone(),
            value: value.clone(),
            refs: refs.clone(),
        })
    }

    pub fn to_entries(&self) -> Vec<IndexEntry> {
        self.entries
            .iter()
            .map(|(key, (value, refs))| IndexEntry {
                key: key.clone(),
                value: value.clone(),
                refs: refs.clone(),
            })
            .collect()
    }

    /// Serialise the index, header, root row down to the leaf row.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let budget = btree::PAGE_SIZE - btree::RESERVED_HEADER_BYTES;

        // leaf row.
        let mut leaf_pages: Vec<(Key, Vec<u8>)> = vec![];
        if !self.entries.is_empty() {
            let mut writer = ChunkWriter::new(budget, 0);
            writer.write(b"type=leaf\n")?;
            let mut first: Option<Key> = None;
            for (key, (value, refs)) in self.entries.iter() {
                let line = node::leaf_line(key, value, refs, self.config.node_ref_lists);
                if writer.write(&line)? {
                    let done = std::mem::replace(&mut writer, ChunkWriter::new(budget, 0));
                    leaf_pages.push((first.take().unwrap(), done.finish()?.0));
                    writer.write(b"type=leaf\n")?;
                    if writer.write(&line)? {
                        return err_at!(Fatal, msg: "index entry exceeds page size");
                    }
                }
                first.get_or_insert_with(|| key.clone());
            }
            leaf_pages.push((first.unwrap(), writer.finish()?.0));
        }

        // internal rows, bottom up, keyed by the first key of each child
        // page.
        let mut internal_rows: Vec<Vec<InternalPlan>> = vec![];
        let mut child_keys: Vec<Key> = leaf_pages.iter().map(|(k, _)| k.clone()).collect();
        while child_keys.len() > 1 {
            let row = plan_internal_row(&child_keys, budget)?;
            child_keys = row.iter().map(|p| p.first_key.clone()).collect();
            internal_rows.insert(0, row);
        }

        // page numbering, root row first.
        let mut row_lengths: Vec<usize> = internal_rows.iter().map(|r| r.len()).collect();
        if !leaf_pages.is_empty() {
            row_lengths.push(leaf_pages.len());
        }
        let mut row_offsets = vec![0];
        for n in row_lengths.iter() {
            row_offsets.push(row_offsets[row_offsets.len() - 1] + n);
        }

        let header = self.to_header(&row_lengths)?;

        let mut pages: Vec<Vec<u8>> = vec![];
        for (r, row) in internal_rows.iter().enumerate() {
            let mut child = row_offsets[r + 1];
            for plan in row.iter() {
                pages.push(serialise_internal(plan, child, budget)?);
                child += plan.n_children;
            }
        }
        for (_, bytes) in leaf_pages.into_iter() {
            pages.push(bytes);
        }

        // slot zero holds the header then the root page, later pages
        // each get a page-size slot, zero padded.
        let mut out = header;
        for (i, page) in pages.into_iter().enumerate() {
            if i > 0 {
                let aligned = out.len() + btree::PAGE_SIZE - 1;
                out.resize(aligned / btree::PAGE_SIZE * btree::PAGE_SIZE, 0);
            }
            out.extend_from_slice(&page);
        }
        let aligned = out.len() + btree::PAGE_SIZE - 1;
        out.resize(aligned / btree::PAGE_SIZE * btree::PAGE_SIZE, 0);
        Ok(out)
    }

    /// Serialise and write to `loc`, returning the file size.
    pub fn write_to(&self, loc: &ffi::OsStr) -> Result<usize> {
        let data = self.to_bytes()?;
        let mut fd = util::files::create_file_a(loc)?;
        util::files::sync_write(&mut fd, &data)
    }

    fn to_header(&self, row_lengths: &[usize]) -> Result<Vec<u8>> {
        let csv: Vec<String> = row_lengths.iter().map(|n| n.to_string()).collect();
        let mut header = vec![];
        header.extend_from_slice(btree::SIGNATURE);
        header.extend_from_slice(
            format!(
                "node_ref_lists={}\nkey_elements={}\nlen={}\nrow_lengths={}\n",
                self.config.node_ref_lists,
                self.config.key_elements,
                self.entries.len(),
                csv.join(",")
            )
            .as_bytes(),
        );
        if header.len() > btree::RESERVED_HEADER_BYTES {
            return err_at!(Fatal, msg: "index header {} bytes", header.len());
        }
        header.resize(btree::RESERVED_HEADER_BYTES, 0);
        Ok(header)
    }
}

// Fit children into internal pages, measuring with a placeholder
// offset line.
fn plan_internal_row(child_keys: &[Key], budget: usize) -> Result<Vec<InternalPlan>> {
    let mut row: Vec<InternalPlan> = vec![];
    let mut writer = ChunkWriter::new(budget, 0);
    writer.write(b"type=internal\n")?;
    writer.write(OFFSET_PLACEHOLDER)?;

    let mut plan: Option<InternalPlan> = None;
    for child_key in child_keys.iter() {
        let cur = match plan.as_mut() {
            None => {
                plan = Some(InternalPlan {
                    first_key: child_key.clone(),
                    keys: vec![],
                    n_children: 1,
                });
                continue;
            }
            Some(cur) => cur,
        };
        let line = node::internal_line(child_key);
        if writer.write(&line)? {
            row.push(plan.take().unwrap());
            writer = ChunkWriter::new(budget, 0);
            writer.write(b"type=internal\n")?;
            writer.write(OFFSET_PLACEHOLDER)?;
            plan = Some(InternalPlan {
                first_key: child_key.clone(),
                keys: vec![],
                n_children: 1,
            });
        } else {
            cur.keys.push(child_key.clone());
            cur.n_children += 1;
        }
    }
    row.push(plan.unwrap());
    Ok(row)
}

fn serialise_internal(plan: &InternalPlan, first_child: usize, budget: usize) -> Result<Vec<u8>> {
    let mut writer = ChunkWriter::new(budget, 0);
    writer.write(b"type=internal\n")?;
    writer.write(format!("offset={}\n", first_child).as_bytes())?;
    for key in plan.keys.iter() {
        if writer.write(&node::internal_line(key))? {
            return err_at!(Fatal, msg: "internal page overflow");
        }
    }
    Ok(writer.finish()?.0)
}

#[cfg(test)]
#[path = "build_test.rs"]
mod build_test;
