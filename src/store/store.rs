use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    ffi,
    rc::Rc,
};

use crate::{
    chk,
    gcb::{self, Block, Compressor, LazyGroup},
    store::{
        index::{to_value, Position},
        pack::read_range,
        GcIndex, KeyRefs, Ordering, PackStore, Record, Role, StoreConfig,
    },
    util::{self, Lru},
    Key, Result,
};

// record compressed into the current (unsealed) block.
struct PendingRec {
    key: Key,
    parents: Vec<Key>,
    sha1: String,
    start: usize,
    end: usize,
}

/// Where a key was found when probing for presence.
enum Found {
    Pending(String, Vec<Key>),
    Stored(Position),
}

/// Outcome of [GcStore::check].
#[derive(Debug, PartialEq)]
pub struct CheckReport {
    /// Records whose fulltext reconstructed and hashed correctly.
    pub records: usize,
    /// Parents referenced by some record but present nowhere.
    pub ghosts: Vec<Key>,
}

/// One role's versioned-file store: named streams of records keyed by
/// tuples, with an explicit parent graph, fronting the btree indexes
/// and the group-compress blocks of a [PackStore].
pub struct GcStore {
    role: Role,
    packs: Rc<RefCell<PackStore>>,
    config: StoreConfig,
    index: GcIndex,
    // write side, live only inside a write group.
    compressor: Option<Compressor>,
    pending: Vec<PendingRec>,
    flushed: HashMap<Key, Position>,
    keyrefs: KeyRefs,
    // caches.
    block_cache: Lru<(ffi::OsString, u64), Rc<RefCell<Block>>>,
    chk_cache: Lru<String, Vec<u8>>,
    read_only: bool,
}

impl GcStore {
    pub fn open(packs: &Rc<RefCell<PackStore>>, role: Role) -> Result<GcStore> {
        let (config, index) = {
            let packs = packs.borrow();
            (packs.as_config().clone(), packs.open_role_index(role)?)
        };
        let block_cache = Lru::new(config.block_cache_count, 0);
        let chk_cache = Lru::new(config.chk_cache_count, 0);
        Ok(GcStore {
            role,
            packs: Rc::clone(packs),
            config,
            index,
            compressor: None,
            pending: vec![],
            flushed: HashMap::new(),
            keyrefs: KeyRefs::new(),
            block_cache,
            chk_cache,
            read_only: false,
        })
    }

    pub fn to_role(&self) -> Role {
        self.role
    }

    /// Re-resolve the pack snapshot, picking up committed write groups
    /// and dropping any in-flight write-side state (an aborted group's
    /// records simply vanish).
    pub fn refresh(&mut self) -> Result<()> {
        self.index = self.packs.borrow().open_role_index(self.role)?;
        self.compressor = None;
        self.pending.clear();
        self.flushed.clear();
        Ok(())
    }

    /// Add one text as a sequence of lines. Returns the fulltext sha1.
    pub fn add_lines(&mut self, key: &Key, parents: &[Key], lines: &[&[u8]]) -> Result<String> {
        let bytes: Vec<u8> = lines.concat();
        self.add_bytes(key, parents, &bytes, None)
    }

    /// Add one text. An add of a present key with identical content is
    /// a no-op; with different content it raises InconsistentAdd, or
    /// warns and keeps the stored record when the store is configured
    /// non-fatal.
    pub fn add_bytes(
        &mut self,
        key: &Key,
        parents: &[Key],
        bytes: &[u8],
        expected_sha1: Option<&str>,
    ) -> Result<String> {
        if self.read_only {
            return err_at!(Fatal, msg: "store is read-only after corruption");
        }
        self.validate_key(key)?;
        for parent in parents.iter() {
            self.validate_key(parent)?;
            if parent == key {
                return err_at!(InvalidFile, msg: "{:?} lists itself as parent", key);
            }
        }
        if !self.role.has_graph() && !parents.is_empty() {
            return err_at!(InvalidFile, msg: "{:?} carries no graph", self.role);
        }

        let sha1 = match expected_sha1 {
            Some(sha1) => sha1.to_string(),
            None => util::sha1_hex(bytes),
        };
        if let Some(found) = self.find(key)? {
            let (stored_sha1, stored_parents) = match found {
                Found::Pending(sha1, parents) => (sha1, parents),
                Found::Stored(position) => (position.sha1, position.parents),
            };
            if stored_sha1 == sha1 && stored_parents.as_slice() == parents {
                return Ok(sha1);
            }
            if self.config.inconsistency_fatal {
                return err_at!(
                    InconsistentAdd, msg: "{:?} present with sha1 {}", key, stored_sha1
                );
            }
            log::warn!("inconsistent add of {:?}, keeping stored record", key);
            return Ok(stored_sha1);
        }
        if !self.packs.borrow().has_write_group() {
            return err_at!(Fatal, msg: "no write group active");
        }

        let gcb_config = self.config.to_gcb_config();
        let compressor = self.compressor.get_or_insert_with(|| Compressor::new(&gcb_config));
        let (sha1, start, end, _kind) = compressor.compress(key, bytes, Some(&sha1))?;
        self.pending.push(PendingRec {
            key: key.clone(),
            parents: parents.to_vec(),
            sha1: sha1.clone(),
            start,
            end,
        });
        self.keyrefs.add_key(key);
        self.keyrefs.add_references(parents);

        if self.compressor.as_ref().unwrap().endpoint() > self.config.group_size {
            self.flush()?;
        }
        Ok(sha1)
    }

    /// Seal the current block and stage its records into the write
    /// group's indexes. A later abort discards all of it; the committed
    /// store never sees a partial group.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.compressor = None;
            return Ok(());
        }
        let compressor = self.compressor.take();
        let (offset, len) = match compressor {
            Some(compressor) if !compressor.is_empty() => {
                let block = compressor.flush()?;
                let mut packs = self.packs.borrow_mut();
                let wg = packs.write_group_mut()?;
                wg.write_block(&block.to_bytes())?
            }
            _ => (0, 0),
        };

        let pack_loc = {
            let packs = self.packs.borrow();
            let loc = packs.write_group()?.as_loc().to_os_string();
            loc
        };
        for rec in self.pending.drain(..) {
            let value = to_value(offset, len, rec.start, rec.end, &rec.sha1);
            let refs: Vec<Vec<Key>> = match self.role.has_graph() {
                true => vec![rec.parents.clone()],
                false => vec![],
            };
            let mut packs = self.packs.borrow_mut();
            let wg = packs.write_group_mut()?;
            wg.add_entry(self.role, &rec.key, &value, &refs)?;
            self.flushed.insert(
                rec.key.clone(),
                Position {
                    pack: pack_loc.clone(),
                    block_start: offset,
                    block_len: len,
                    start: rec.start,
                    end: rec.end,
                    sha1: rec.sha1,
                    parents: rec.parents,
                },
            );
        }
        Ok(())
    }

    /// Graph lookup covering committed, staged and in-flight records.
    /// Absent keys are left out of the result.
    pub fn get_parent_map(&mut self, keys: &[Key]) -> Result<HashMap<Key, Vec<Key>>> {
        let mut out = HashMap::new();
        let mut rest = vec![];
        for key in keys.iter() {
            if let Some(rec) = self.pending.iter().find(|r| &r.key == key) {
                out.insert(key.clone(), rec.parents.clone());
            } else if let Some(position) = self.flushed.get(key) {
                out.insert(key.clone(), position.parents.clone());
            } else {
                rest.push(key.clone());
            }
        }
        out.extend(self.index.get_parent_map(&rest)?);
        Ok(out)
    }

    /// Keys referenced as a parent by some record but present nowhere,
    /// the known ghosts of an in-progress insert.
    pub fn get_missing_parents(&mut self) -> Result<Vec<Key>> {
        let candidates = self.keyrefs.missing_keys();
        let present = self.index.get_positions(&candidates)?;
        Ok(candidates
            .into_iter()
            .filter(|key| !present.contains_key(key))
            .collect())
    }

    pub fn keys(&mut self) -> Result<Vec<Key>> {
        let mut keys: BTreeSet<Key> = self.index.keys()?.into_iter().collect();
        keys.extend(self.flushed.keys().cloned());
        keys.extend(self.pending.iter().map(|r| r.key.clone()));
        Ok(keys.into_iter().collect())
    }

    pub fn key_count(&mut self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    /// Fulltext of one key, raising KeyNotFound when absent.
    pub fn get_bytes(&mut self, key: &Key) -> Result<Vec<u8>> {
        match self.find(key)? {
            Some(Found::Pending(_, _)) => {
                let compressor = self.compressor.as_ref().unwrap();
                Ok(compressor.extract(key)?.0)
            }
            Some(Found::Stored(position)) => self.extract(&position),
            None => err_at!(KeyNotFound, msg: "{:?}", key),
        }
    }

    /// Stream records for `keys` under an ordering contract.
    ///
    /// With `include_delta_closure` every record is resolved to a
    /// fulltext. Without it, locality orderings yield whole-block
    /// stripes ([Record::Block]) and the per-key orderings yield the
    /// record's native storage, fulltext or raw delta. Absent keys
    /// yield [Record::Absent] in every ordering.
    pub fn get_record_stream(
        &mut self,
        keys: &[Key],
        ordering: Ordering,
        include_delta_closure: bool,
    ) -> Result<RecordStream> {
        let mut seen: HashSet<&Key> = HashSet::new();
        let mut requested: Vec<&Key> = vec![];
        for key in keys.iter() {
            if seen.insert(key) {
                requested.push(key);
            }
        }

        // locate everything up front; the byte transfers stay lazy.
        let mut located: Vec<(Key, Position)> = vec![];
        let mut in_flight: Vec<Key> = vec![];
        let mut absent: Vec<Key> = vec![];
        for key in requested.iter() {
            match self.find(key)? {
                Some(Found::Pending(_, _)) => in_flight.push((*key).clone()),
                Some(Found::Stored(position)) => located.push(((*key).clone(), position)),
                None => absent.push((*key).clone()),
            }
        }

        let mut plans: VecDeque<Plan> = VecDeque::new();
        if ordering != Ordering::AsRequested {
            for key in absent.iter() {
                plans.push_back(Plan::Absent(key.clone()));
            }
        }

        match ordering {
            Ordering::AsRequested | Ordering::Topological => {
                let order: Vec<Key> = match ordering {
                    // absent keys ride along, in place.
                    Ordering::AsRequested => requested.iter().map(|k| (*k).clone()).collect(),
                    _ => {
                        let present: Vec<Key> = located
                            .iter()
                            .map(|(k, _)| k.clone())
                            .chain(in_flight.iter().cloned())
                            .collect();
                        let parent_map = self.get_parent_map(&present)?;
                        topo_sort(&present, &parent_map)?
                    }
                };
                let positions: HashMap<Key, Position> = located.into_iter().collect();
                let in_flight: HashSet<Key> = in_flight.into_iter().collect();
                for key in order.into_iter() {
                    match positions.get(&key) {
                        Some(position) => plans.push_back(Plan::Stored {
                            key,
                            position: position.clone(),
                            native: !include_delta_closure,
                        }),
                        None if in_flight.contains(&key) => {
                            plans.push_back(Plan::InFlight(key))
                        }
                        None => plans.push_back(Plan::Absent(key)),
                    }
                }
            }
            Ordering::Unordered | Ordering::GroupCompress => {
                for key in in_flight.into_iter() {
                    plans.push_back(Plan::InFlight(key));
                }
                located.sort_by(|a, b| {
                    (&a.1.pack, a.1.block_start, a.1.start)
                        .cmp(&(&b.1.pack, b.1.block_start, b.1.start))
                });
                if include_delta_closure {
                    for (key, position) in located.into_iter() {
                        plans.push_back(Plan::Stored {
                            key,
                            position,
                            native: false,
                        });
                    }
                } else {
                    let mut cursor = 0;
                    while cursor < located.len() {
                        let (pack, block_start) =
                            (located[cursor].1.pack.clone(), located[cursor].1.block_start);
                        let mut recs = vec![];
                        while cursor < located.len()
                            && located[cursor].1.pack == pack
                            && located[cursor].1.block_start == block_start
                        {
                            recs.push(located[cursor].clone());
                            cursor += 1;
                        }
                        plans.push_back(Plan::Group { recs });
                    }
                }
            }
        }

        Ok(RecordStream { store: self, plans })
    }

    /// Insert records produced by another store's record stream.
    ///
    /// Whole blocks that are well-utilised by the new keys splice in
    /// verbatim; everything else decomposes and re-compresses into the
    /// local writer's current block.
    pub fn insert_record_stream<I>(&mut self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        for record in records.into_iter() {
            match record? {
                Record::Fulltext {
                    key,
                    parents,
                    sha1,
                    bytes,
                } => {
                    if util::sha1_hex(&bytes) != sha1 {
                        return err_at!(InconsistentAdd, msg: "{:?} sha1 mismatch", key);
                    }
                    self.add_bytes(&key, &parents, &bytes, Some(&sha1))?;
                }
                Record::Delta { key, .. } => {
                    return err_at!(
                        DeltaFail, msg: "{:?} arrived as a bare delta record", key
                    );
                }
                Record::Absent { key } => {
                    return err_at!(KeyNotFound, msg: "{:?} absent in source", key);
                }
                Record::Block(group) => self.insert_group(group)?,
            }
        }
        Ok(())
    }

    fn insert_group(&mut self, mut group: LazyGroup) -> Result<()> {
        let mut wanted = vec![];
        for entry in group.as_entries().to_vec().into_iter() {
            match self.find(&entry.key)? {
                None => wanted.push(entry),
                Some(found) => {
                    let stored_sha1 = match found {
                        Found::Pending(sha1, _) => sha1,
                        Found::Stored(position) => position.sha1,
                    };
                    let incoming = util::sha1_hex(&group.extract(&entry.key)?);
                    if incoming != stored_sha1 {
                        if self.config.inconsistency_fatal {
                            return err_at!(
                                InconsistentAdd, msg: "{:?} present with sha1 {}",
                                entry.key, stored_sha1
                            );
                        }
                        log::warn!(
                            "inconsistent insert of {:?}, keeping stored record",
                            entry.key
                        );
                    }
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }
        let wanted_keys: Vec<Key> = wanted.iter().map(|e| e.key.clone()).collect();

        if group.is_well_utilised(&wanted_keys, self.config.rebuild_threshold) {
            // splice the block in whole, byte identical.
            self.flush()?;
            let (offset, len, pack_loc) = {
                let mut packs = self.packs.borrow_mut();
                let wg = packs.write_group_mut()?;
                let (offset, len) = wg.write_block(&group.as_block().to_bytes())?;
                (offset, len, wg.as_loc().to_os_string())
            };
            for entry in wanted.into_iter() {
                let sha1 = util::sha1_hex(&group.extract(&entry.key)?);
                let value = to_value(offset, len, entry.start, entry.end, &sha1);
                let refs: Vec<Vec<Key>> = match self.role.has_graph() {
                    true => vec![entry.parents.clone()],
                    false => vec![],
                };
                {
                    let mut packs = self.packs.borrow_mut();
                    let wg = packs.write_group_mut()?;
                    wg.add_entry(self.role, &entry.key, &value, &refs)?;
                }
                self.keyrefs.add_key(&entry.key);
                self.keyrefs.add_references(&entry.parents);
                self.flushed.insert(
                    entry.key.clone(),
                    Position {
                        pack: pack_loc.clone(),
                        block_start: offset,
                        block_len: len,
                        start: entry.start,
                        end: entry.end,
                        sha1,
                        parents: entry.parents,
                    },
                );
            }
            log::debug!("spliced block of {} records", wanted_keys.len());
        } else {
            // poorly utilised, re-compress just the records we need.
            log::debug!("rebuilding block for {} records", wanted_keys.len());
            for entry in wanted.into_iter() {
                let bytes = group.extract(&entry.key)?;
                self.add_bytes(&entry.key, &entry.parents, &bytes, None)?;
            }
        }
        Ok(())
    }

    /// Verify that every stored record reconstructs to its declared
    /// sha1 and report referenced-but-absent parents as ghosts. A hash
    /// mismatch marks the store read-only until a repair pass.
    pub fn check(&mut self) -> Result<CheckReport> {
        let keyed = self.index.all_keyed_positions()?;
        let present: HashSet<Key> = keyed.iter().map(|(k, _)| k.clone()).collect();

        let mut ghosts: BTreeSet<Key> = BTreeSet::new();
        let mut records = 0;
        for (key, position) in keyed.into_iter() {
            let bytes = self.extract(&position)?;
            if util::sha1_hex(&bytes) != position.sha1 {
                self.read_only = true;
                return err_at!(
                    CorruptBlock, msg: "{:?} reconstructs to wrong sha1", key
                );
            }
            records += 1;
            for parent in position.parents.iter() {
                if !present.contains(parent) {
                    ghosts.insert(parent.clone());
                }
            }
        }
        Ok(CheckReport {
            records,
            ghosts: ghosts.into_iter().collect(),
        })
    }

    fn validate_key(&self, key: &Key) -> Result<()> {
        if key.len() != self.role.key_elements() {
            return err_at!(
                InvalidFile, msg: "{:?} holds {} of {} elements",
                key, key.len(), self.role.key_elements()
            );
        }
        Ok(())
    }

    // probe pending, staged, then committed.
    fn find(&mut self, key: &Key) -> Result<Option<Found>> {
        if let Some(rec) = self.pending.iter().find(|r| &r.key == key) {
            return Ok(Some(Found::Pending(rec.sha1.clone(), rec.parents.clone())));
        }
        if let Some(position) = self.flushed.get(key) {
            return Ok(Some(Found::Stored(position.clone())));
        }
        match self.index.get(key)? {
            Some(position) => Ok(Some(Found::Stored(position))),
            None => Ok(None),
        }
    }

    fn read_block(&mut self, pack: &ffi::OsStr, offset: u64, len: u64) -> Result<Rc<RefCell<Block>>> {
        let cache_key = (pack.to_os_string(), offset);
        if let Some(block) = self.block_cache.get(&cache_key) {
            return Ok(block);
        }
        let bytes = read_range(pack, offset, len)?;
        let block = Rc::new(RefCell::new(Block::from_bytes(&bytes)?));
        self.block_cache.set(cache_key, Rc::clone(&block), len as usize);
        Ok(block)
    }

    fn extract(&mut self, position: &Position) -> Result<Vec<u8>> {
        if position.start == position.end {
            return Ok(vec![]);
        }
        let block = self.read_block(&position.pack, position.block_start, position.block_len)?;
        let res = block.borrow_mut().extract(position.start, position.end);
        if let Err(crate::Error::CorruptBlock(_, _)) = &res {
            self.read_only = true;
        }
        res
    }

    fn extract_raw(&mut self, position: &Position) -> Result<(u8, Vec<u8>)> {
        if position.start == position.end {
            return Ok((b'f', vec![]));
        }
        let block = self.read_block(&position.pack, position.block_start, position.block_len)?;
        let res = block.borrow_mut().extract_raw(position.start, position.end);
        if let Err(crate::Error::CorruptBlock(_, _)) = &res {
            self.read_only = true;
        }
        res
    }
}

// fetch plan for one stream element.
enum Plan {
    Absent(Key),
    InFlight(Key),
    Stored {
        key: Key,
        position: Position,
        native: bool,
    },
    Group {
        recs: Vec<(Key, Position)>,
    },
}

/// Lazy record stream; each pull may read and partially inflate one
/// block.
pub struct RecordStream<'a> {
    store: &'a mut GcStore,
    plans: VecDeque<Plan>,
}

impl<'a> RecordStream<'a> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let plan = match self.plans.pop_front() {
            Some(plan) => plan,
            None => return Ok(None),
        };
        let record = match plan {
            Plan::Absent(key) => Record::Absent { key },
            Plan::InFlight(key) => {
                let rec = self
                    .store
                    .pending
                    .iter()
                    .find(|r| r.key == key)
                    .map(|r| (r.sha1.clone(), r.parents.clone()));
                let (sha1, parents) = match rec {
                    Some(found) => found,
                    None => return err_at!(Fatal, msg: "{:?} left the compressor", key),
                };
                let compressor = self.store.compressor.as_ref().unwrap();
                let (bytes, _) = compressor.extract(&key)?;
                Record::Fulltext {
                    key,
                    parents,
                    sha1,
                    bytes,
                }
            }
            Plan::Stored {
                key,
                position,
                native,
            } => match native {
                false => {
                    let bytes = self.store.extract(&position)?;
                    Record::Fulltext {
                        key,
                        parents: position.parents,
                        sha1: position.sha1,
                        bytes,
                    }
                }
                true => match self.store.extract_raw(&position)? {
                    (b'f', bytes) => Record::Fulltext {
                        key,
                        parents: position.parents,
                        sha1: position.sha1,
                        bytes,
                    },
                    (_, delta) => Record::Delta {
                        key,
                        parents: position.parents,
                        sha1: position.sha1,
                        delta,
                    },
                },
            },
            Plan::Group { recs } => {
                let first = &recs[0].1;
                let bytes = read_range(&first.pack, first.block_start, first.block_len)?;
                let block = Block::from_bytes(&bytes)?;
                let entries = recs
                    .iter()
                    .map(|(key, p)| gcb::Entry {
                        key: key.clone(),
                        parents: p.parents.clone(),
                        start: p.start,
                        end: p.end,
                    })
                    .collect();
                Record::Block(LazyGroup::new(block, entries))
            }
        };
        Ok(Some(record))
    }
}

impl<'a> Iterator for RecordStream<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Parents-first order over `keys`; parents outside the set do not
/// constrain the order. Ties resolve to lexicographic key order, the
/// result is deterministic.
pub(crate) fn topo_sort(
    keys: &[Key],
    parent_map: &HashMap<Key, Vec<Key>>,
) -> Result<Vec<Key>> {
    let keyset: HashSet<&Key> = keys.iter().collect();
    let mut blocking: HashMap<&Key, usize> = HashMap::new();
    let mut children: HashMap<&Key, Vec<&Key>> = HashMap::new();
    for key in keys.iter() {
        let parents = parent_map.get(key).map(|p| p.as_slice()).unwrap_or(&[]);
        let in_set = parents.iter().filter(|p| keyset.contains(p)).count();
        blocking.insert(key, in_set);
        for parent in parents.iter().filter(|p| keyset.contains(p)) {
            children.entry(parent).or_insert_with(Vec::new).push(key);
        }
    }

    let mut ready: BTreeSet<&Key> = blocking
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut out = vec![];
    while let Some(key) = ready.iter().next().cloned() {
        ready.remove(key);
        out.push(key.clone());
        for child in children.get(key).cloned().unwrap_or_default() {
            let n = blocking.get_mut(child).unwrap();
            *n -= 1;
            if *n == 0 {
                ready.insert(child);
            }
        }
    }
    if out.len() != keys.len() {
        return err_at!(Fatal, msg: "cycle in parent graph");
    }
    Ok(out)
}

impl chk::Store for GcStore {
    fn get_chk(&mut self, key: &str) -> Result<Vec<u8>> {
        if let Some(bytes) = self.chk_cache.get(&key.to_string()) {
            return Ok(bytes);
        }
        let bytes = self.get_bytes(&vec![key.as_bytes().to_vec()])?;
        let size = bytes.len();
        self.chk_cache.set(key.to_string(), bytes.clone(), size);
        Ok(bytes)
    }

    fn put_chk(&mut self, bytes: &[u8]) -> Result<String> {
        let sha1 = util::sha1_hex(bytes);
        let name = format!("sha1:{}", sha1);
        let key: Key = vec![name.clone().into_bytes()];
        if self.find(&key)?.is_none() {
            self.add_bytes(&key, &[], bytes, Some(&sha1))?;
        }
        Ok(name)
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
