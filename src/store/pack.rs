use sha1::{Digest, Sha1};

use std::{ffi, fs, path, rc::Rc};

use crate::{
    btree,
    store::{GcIndex, LockDir, LockGuard, Role, StoreConfig},
    util, Key, Result,
};

/// Owner of a repository directory: the pack files, their indexes, the
/// pack-names snapshot, the writer lock and the shared page cache.
pub struct PackStore {
    dir: ffi::OsString,
    config: StoreConfig,
    lockdir: LockDir,
    page_cache: btree::PageCache,
    packs: Vec<String>,
    write_group: Option<WriteGroup>,
}

impl PackStore {
    /// Initialise a fresh repository under `dir`.
    pub fn create(dir: &ffi::OsStr, config: StoreConfig) -> Result<PackStore> {
        for sub in ["packs", "indices", "upload"].iter() {
            let loc: path::PathBuf = [dir, ffi::OsStr::new(sub)].iter().collect();
            err_at!(IOError, fs::create_dir_all(&loc))?;
        }
        let names = btree::Builder::new(btree::Config::new(1, 0));
        names.write_to(&pack_names_location(dir))?;
        PackStore::open(dir, config)
    }

    /// Open an existing repository. The pack list resolved here is the
    /// snapshot this handle serves for its lifetime.
    pub fn open(dir: &ffi::OsStr, config: StoreConfig) -> Result<PackStore> {
        let page_cache = btree::new_page_cache(config.page_cache_bytes);
        let mut val = PackStore {
            dir: dir.to_os_string(),
            lockdir: LockDir::new(dir),
            page_cache,
            packs: vec![],
            config,
            write_group: None,
        };
        val.packs = val.read_pack_names()?;
        Ok(val)
    }

    pub fn as_dir(&self) -> &ffi::OsStr {
        &self.dir
    }

    pub fn as_config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn to_page_cache(&self) -> btree::PageCache {
        Rc::clone(&self.page_cache)
    }

    pub fn as_pack_names(&self) -> &[String] {
        &self.packs
    }

    pub fn as_lockdir(&self) -> &LockDir {
        &self.lockdir
    }

    /// Re-read pack-names, picking up packs committed through this or
    /// another handle.
    pub fn refresh(&mut self) -> Result<()> {
        self.packs = self.read_pack_names()?;
        Ok(())
    }

    pub fn to_pack_location(&self, name: &str) -> ffi::OsString {
        let file = format!("{}.pack", name);
        let loc: path::PathBuf = [
            self.dir.as_os_str(),
            ffi::OsStr::new("packs"),
            ffi::OsStr::new(&file),
        ]
        .iter()
        .collect();
        loc.into_os_string()
    }

    pub fn to_index_location(&self, name: &str, role: Role) -> ffi::OsString {
        let file = format!("{}.{}", name, role.to_suffix());
        let loc: path::PathBuf = [
            self.dir.as_os_str(),
            ffi::OsStr::new("indices"),
            ffi::OsStr::new(&file),
        ]
        .iter()
        .collect();
        loc.into_os_string()
    }

    /// Combined index over every live pack for `role`.
    pub fn open_role_index(&self, role: Role) -> Result<GcIndex> {
        let mut indexes = vec![];
        let mut packs = vec![];
        for name in self.packs.iter() {
            let loc = self.to_index_location(name, role);
            indexes.push(btree::Index::open(&loc, self.to_page_cache())?);
            packs.push(self.to_pack_location(name));
        }
        Ok(GcIndex::new(role.has_graph(), indexes, packs))
    }

    /// Begin the (single) write group, taking the writer lock. All
    /// stores of this repository stage into one upload file.
    pub fn start_write_group(&mut self) -> Result<()> {
        if self.write_group.is_some() {
            return err_at!(Fatal, msg: "write group already active");
        }
        let guard = self
            .lockdir
            .lock_write(self.config.lock_attempts, self.config.lock_backoff_ms)?;
        let file = format!("u{:016x}.pack", rand::random::<u64>());
        let loc: path::PathBuf = [
            self.dir.as_os_str(),
            ffi::OsStr::new("upload"),
            ffi::OsStr::new(&file),
        ]
        .iter()
        .collect();
        self.write_group = Some(WriteGroup::start(loc.into_os_string(), guard)?);
        Ok(())
    }

    pub fn has_write_group(&self) -> bool {
        self.write_group.is_some()
    }

    pub fn write_group_mut(&mut self) -> Result<&mut WriteGroup> {
        match self.write_group.as_mut() {
            Some(wg) => Ok(wg),
            None => err_at!(Fatal, msg: "no write group active"),
        }
    }

    pub fn write_group(&self) -> Result<&WriteGroup> {
        match self.write_group.as_ref() {
            Some(wg) => Ok(wg),
            None => err_at!(Fatal, msg: "no write group active"),
        }
    }

    /// Seal the write group into a live pack. Nothing of the group is
    /// visible unless the rename and the pack-names rewrite both land.
    /// Returns the new pack name, or None for an empty group.
    pub fn commit_write_group(&mut self) -> Result<Option<String>> {
        let wg = match self.write_group.take() {
            Some(wg) => wg,
            None => return err_at!(Fatal, msg: "no write group active"),
        };
        if wg.is_empty() {
            wg.abandon();
            return Ok(None);
        }
        self.seal(wg, false)
    }

    /// Abandon the write group, discarding the staged pack. Index
    /// entries were never written, the store is untouched.
    pub fn abort_write_group(&mut self) -> Result<()> {
        match self.write_group.take() {
            Some(wg) => {
                wg.abandon();
                Ok(())
            }
            None => err_at!(Fatal, msg: "no write group active"),
        }
    }

    /// Rewrite every surviving record into a fresh pack and drop the
    /// old packs. This is the only operation that reclaims dead pages.
    pub fn pack_repository(&mut self) -> Result<Option<String>> {
        use crate::gcb::{Block, Entry, LazyGroup};

        if self.write_group.is_some() {
            return err_at!(Fatal, msg: "write group active");
        }
        let old_packs = self.packs.clone();
        if old_packs.is_empty() {
            return Ok(None);
        }

        self.start_write_group()?;
        for role in Role::iter() {
            let mut index = self.open_role_index(role)?;
            // group live records block by block, in locality order.
            let mut keyed = vec![];
            for (key, position) in index.all_keyed_positions()?.into_iter() {
                keyed.push((position.pack.clone(), position.block_start, key, position));
            }
            keyed.sort_by(|a, b| (&a.0, a.1, a.3.start).cmp(&(&b.0, b.1, b.3.start)));

            let mut cursor = 0;
            while cursor < keyed.len() {
                let (pack, block_start) = (keyed[cursor].0.clone(), keyed[cursor].1);
                let mut entries = vec![];
                let mut block_len = 0;
                while cursor < keyed.len()
                    && keyed[cursor].0 == pack
                    && keyed[cursor].1 == block_start
                {
                    let (_, _, key, position) = &keyed[cursor];
                    block_len = position.block_len;
                    entries.push((key.clone(), position.clone()));
                    cursor += 1;
                }

                let bytes = read_range(&pack, block_start, block_len)?;
                let block = Block::from_bytes(&bytes)?;
                let group_entries: Vec<Entry> = entries
                    .iter()
                    .map(|(key, p)| Entry {
                        key: key.clone(),
                        parents: p.parents.clone(),
                        start: p.start,
                        end: p.end,
                    })
                    .collect();
                let keys: Vec<Key> = entries.iter().map(|(k, _)| k.clone()).collect();
                let mut group = LazyGroup::new(block, group_entries);
                let group = match group
                    .is_well_utilised(&keys, self.config.rebuild_threshold)
                {
                    true => group,
                    false => group.rebuild(&keys, &self.config.to_gcb_config())?,
                };

                let wg = self.write_group_mut()?;
                let (offset, len) = wg.write_block(&group.as_block().to_bytes())?;
                for entry in group.as_entries().iter() {
                    let sha1 = entries
                        .iter()
                        .find(|(k, _)| k == &entry.key)
                        .map(|(_, p)| p.sha1.clone())
                        .unwrap();
                    let value =
                        super::index::to_value(offset, len, entry.start, entry.end, &sha1);
                    let refs: Vec<Vec<Key>> = match role.has_graph() {
                        true => vec![entry.parents.clone()],
                        false => vec![],
                    };
                    wg.add_entry(role, &entry.key, &value, &refs)?;
                }
            }
        }

        let wg = self.write_group.take().unwrap();
        if wg.is_empty() {
            wg.abandon();
            return Ok(None);
        }
        let name = self.seal(wg, true)?;

        // reclaim the superseded packs.
        for old in old_packs.iter() {
            if Some(old.as_str()) != name.as_deref() {
                fs::remove_file(self.to_pack_location(old)).ok();
                for role in Role::iter() {
                    fs::remove_file(self.to_index_location(old, role)).ok();
                }
            }
        }
        log::debug!("packed {:?} into {:?}", old_packs, name);
        Ok(name)
    }

    // Write indexes, rename the pack into place, rewrite pack-names.
    // With `replace` the new pack supersedes every existing one.
    fn seal(&mut self, wg: WriteGroup, replace: bool) -> Result<Option<String>> {
        let (loc, hasher, builders, guard) = wg.into_parts()?;
        let name = util::to_hex(&hasher.finalize());

        err_at!(
            IOError,
            fs::rename(&loc, self.to_pack_location(&name)),
            "sealing pack {}",
            name
        )?;
        let mut sizes = vec![];
        for (role, builder) in builders.iter() {
            sizes.push(builder.key_count().to_string());
            builder.write_to(&self.to_index_location(&name, *role))?;
        }

        let mut names = btree::Builder::new(btree::Config::new(1, 0));
        names.add_entry(&vec![name.clone().into_bytes()], sizes.join(" ").as_bytes(), &[])?;
        if !replace {
            let existing = self.read_pack_name_entries()?;
            for (key, value) in existing.into_iter() {
                if key != vec![name.clone().into_bytes()] {
                    names.add_entry(&key, &value, &[])?;
                }
            }
        }
        let staged: path::PathBuf = [
            self.dir.as_os_str(),
            ffi::OsStr::new("upload"),
            ffi::OsStr::new("pack-names.new"),
        ]
        .iter()
        .collect();
        names.write_to(staged.as_os_str())?;
        err_at!(
            IOError,
            fs::rename(&staged, pack_names_location(&self.dir))
        )?;

        std::mem::drop(guard);
        self.packs = self.read_pack_names()?;
        log::debug!("committed pack {} under {:?}", name, self.dir);
        Ok(Some(name))
    }

    fn read_pack_names(&self) -> Result<Vec<String>> {
        let entries = self.read_pack_name_entries()?;
        let mut names = vec![];
        for (key, _) in entries.into_iter() {
            match String::from_utf8(key[0].clone()) {
                Ok(name) => names.push(name),
                Err(_) => return err_at!(CorruptIndex, msg: "pack name not utf8"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_pack_name_entries(&self) -> Result<Vec<(Key, Vec<u8>)>> {
        let loc = pack_names_location(&self.dir);
        if !path::Path::new(&loc).exists() {
            return err_at!(InvalidFile, msg: "no pack-names under {:?}", self.dir);
        }
        // pack-names is rewritten in place on every commit, unlike the
        // hash-named index files it must never hit the shared cache.
        let mut index = btree::Index::open(&loc, btree::new_page_cache(64 * 1024))?;
        let mut out = vec![];
        for entry in index.iter_all_entries() {
            let entry = entry?;
            out.push((entry.key, entry.value));
        }
        Ok(out)
    }
}

/// In-progress staging of one pack: an upload file accumulating sealed
/// blocks plus an index builder per role. Holds the writer lock.
pub struct WriteGroup {
    loc: ffi::OsString,
    fd: fs::File,
    bytes_written: u64,
    hasher: Sha1,
    builders: Vec<(Role, btree::Builder)>,
    guard: LockGuard,
}

impl WriteGroup {
    fn start(loc: ffi::OsString, guard: LockGuard) -> Result<WriteGroup> {
        let fd = util::files::create_file_a(&loc)?;
        let builders = Role::iter()
            .map(|role| {
                let config = btree::Config::new(
                    role.key_elements(),
                    if role.has_graph() { 1 } else { 0 },
                );
                (role, btree::Builder::new(config))
            })
            .collect();
        Ok(WriteGroup {
            loc,
            fd,
            bytes_written: 0,
            hasher: Sha1::new(),
            builders,
            guard,
        })
    }

    pub fn as_loc(&self) -> &ffi::OsStr {
        &self.loc
    }

    /// Append a sealed block, returning its (offset, length) within the
    /// pack file.
    pub fn write_block(&mut self, bytes: &[u8]) -> Result<(u64, u64)> {
        let offset = self.bytes_written;
        util::files::sync_write(&mut self.fd, bytes)?;
        self.hasher.update(bytes);
        self.bytes_written += bytes.len() as u64;
        Ok((offset, bytes.len() as u64))
    }

    pub fn add_entry(
        &mut self,
        role: Role,
        key: &Key,
        value: &[u8],
        refs: &[Vec<Key>],
    ) -> Result<()> {
        let builder = self.builder_mut(role);
        builder.add_entry(key, value, refs)
    }

    pub fn get_entry(&self, role: Role, key: &Key) -> Option<btree::IndexEntry> {
        self.builder(role).get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0 && self.builders.iter().all(|(_, b)| b.key_count() == 0)
    }

    fn builder(&self, role: Role) -> &btree::Builder {
        &self.builders.iter().find(|(r, _)| *r == role).unwrap().1
    }

    fn builder_mut(&mut self, role: Role) -> &mut btree::Builder {
        &mut self
            .builders
            .iter_mut()
            .find(|(r, _)| *r == role)
            .unwrap()
            .1
    }

    fn abandon(self) {
        fs::remove_file(&self.loc).ok();
        // guard drops, releasing the lock.
    }

    fn into_parts(
        self,
    ) -> Result<(ffi::OsString, Sha1, Vec<(Role, btree::Builder)>, LockGuard)> {
        err_at!(IOError, self.fd.sync_all())?;
        let WriteGroup {
            loc,
            hasher,
            builders,
            guard,
            ..
        } = self;
        Ok((loc, hasher, builders, guard))
    }
}

fn pack_names_location(dir: &ffi::OsStr) -> ffi::OsString {
    let loc: path::PathBuf = [dir, ffi::OsStr::new("pack-names")].iter().collect();
    loc.into_os_string()
}

/// Read `len` bytes at `offset` from a pack file.
pub(crate) fn read_range(loc: &ffi::OsStr, offset: u64, len: u64) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};

    let mut fd = util::files::open_file_r(loc)?;
    let fd = &mut fd;
    crate::read_file!(fd, SeekFrom::Start(offset), len, "read pack range")
}

#[cfg(test)]
#[path = "pack_test.rs"]
mod pack_test;
