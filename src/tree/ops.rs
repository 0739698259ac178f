//! # Tree Operations
//!
//! Everything that manipulates key structure: single-key CRUD, key-value
//! binding, and the whole-subtree operations (delete, copy, merge, sync,
//! reference remapping, compaction).
//!
//! Subtree walks never recurse; they run on an explicit stack with a
//! depth cap, so a corrupt parent loop or a pathologically deep tree
//! fails cleanly instead of exhausting the call stack.
//!
//! Cross-hive operations take both hives as explicit parameters. Only
//! stable structure crosses hives: volatile keys are per-instance state
//! and are neither copied, merged, nor counted for sync deletions.

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use zerocopy::{FromBytes, IntoBytes};

use crate::config::{HiveConfig, MAX_CHECK_DEPTH};
use crate::hive::{CellId, Hive, StorageKind};
use crate::io::FileBacking;

use super::node::{
    decode_index, encode_index, index_cell_size, name_cmp, KeyNode, KEY_FLAG_ROOT,
};

/// Old-to-new cell index translations produced by a relocation pass.
pub type RemapTable = HashMap<CellId, CellId>;

/// Decoded key metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMeta {
    pub name: Vec<u8>,
    pub stable_subkeys: u32,
    pub volatile_subkeys: u32,
    pub values: u32,
    pub parent: CellId,
}

impl Hive {
    /// Creates the hive's root key. Fails when a root already exists.
    pub fn create_root_key(&mut self, name: &[u8]) -> Result<CellId> {
        ensure!(self.root_cell().is_nil(), "hive already has a root key");
        ensure!(!name.is_empty(), "key name cannot be empty");

        let cell = self.write_fresh_key(StorageKind::Stable, CellId::NIL, KEY_FLAG_ROOT, name)?;
        self.set_root_cell(cell);
        Ok(cell)
    }

    /// Creates a child key under `parent`. A volatile parent cannot carry
    /// stable children, since the child would survive a reload that
    /// erases its parent.
    pub fn create_key(
        &mut self,
        parent: CellId,
        name: &[u8],
        kind: StorageKind,
    ) -> Result<CellId> {
        ensure!(!name.is_empty(), "key name cannot be empty");
        ensure!(
            !(parent.kind() == StorageKind::Volatile && kind == StorageKind::Stable),
            "stable key cannot be created under a volatile parent"
        );
        ensure!(
            self.find_key(parent, name)?.is_none(),
            "key '{}' already exists",
            String::from_utf8_lossy(name)
        );

        let mut children = self.subkey_ids(parent, kind)?;
        let pos = match self.search_children(&children, name)? {
            Ok(_) => bail!("key '{}' already exists", String::from_utf8_lossy(name)),
            Err(pos) => pos,
        };

        let cell = self.write_fresh_key(kind, parent, 0, name)?;
        children.insert(pos, cell);
        if let Err(err) = self.set_subkey_index(parent, kind, &children) {
            let _ = self.free_cell(cell);
            return Err(err);
        }
        Ok(cell)
    }

    /// Finds a direct child of `parent` by name, searching stable then
    /// volatile children.
    pub fn find_key(&mut self, parent: CellId, name: &[u8]) -> Result<Option<CellId>> {
        for kind in StorageKind::both() {
            let children = self.subkey_ids(parent, kind)?;
            if let Ok(pos) = self.search_children(&children, name)? {
                return Ok(Some(children[pos]));
            }
        }
        Ok(None)
    }

    /// Walks a path of names from `start`.
    pub fn find_path(&mut self, start: CellId, path: &[&[u8]]) -> Result<Option<CellId>> {
        let mut key = start;
        for name in path {
            match self.find_key(key, name)? {
                Some(child) => key = child,
                None => return Ok(None),
            }
        }
        Ok(Some(key))
    }

    /// Deletes an empty key: its values go with it, subkeys must already
    /// be gone. The root key cannot be deleted.
    pub fn delete_key(&mut self, key: CellId) -> Result<()> {
        let (node, _) = self.read_key(key)?;
        ensure!(!node.is_root(), "cannot delete the root key");
        ensure!(
            node.total_subkeys() == 0,
            "key still has {} subkeys",
            node.total_subkeys()
        );

        self.detach_from_parent(key, &node)?;
        self.free_key_body(key)
    }

    /// Deletes a key and everything beneath it, bottom up.
    pub fn delete_subtree(&mut self, key: CellId) -> Result<()> {
        let (node, _) = self.read_key(key)?;
        ensure!(!node.is_root(), "cannot delete the root key");
        self.detach_from_parent(key, &node)?;

        let mut stack: Vec<(CellId, bool, usize)> = vec![(key, false, 0)];
        while let Some((k, expanded, depth)) = stack.pop() {
            if expanded {
                self.free_key_body(k)?;
                continue;
            }
            ensure!(
                depth <= MAX_CHECK_DEPTH,
                "subtree deeper than {} keys",
                MAX_CHECK_DEPTH
            );
            stack.push((k, true, depth));
            for kind in StorageKind::both() {
                for child in self.subkey_ids(k, kind)? {
                    stack.push((child, false, depth + 1));
                }
            }
        }
        Ok(())
    }

    /// All direct children, stable first, each class in name order.
    pub fn enumerate_subkeys(&mut self, key: CellId) -> Result<Vec<CellId>> {
        let mut out = self.subkey_ids(key, StorageKind::Stable)?;
        out.extend(self.subkey_ids(key, StorageKind::Volatile)?);
        Ok(out)
    }

    pub fn enumerate_values(&mut self, key: CellId) -> Result<Vec<CellId>> {
        let (node, _) = self.read_key(key)?;
        self.read_value_list(&node)
    }

    pub fn key_name(&mut self, key: CellId) -> Result<Vec<u8>> {
        let (_, name) = self.read_key(key)?;
        Ok(name)
    }

    pub fn key_meta(&mut self, key: CellId) -> Result<KeyMeta> {
        let (node, name) = self.read_key(key)?;
        Ok(KeyMeta {
            name,
            stable_subkeys: node.subkey_count(StorageKind::Stable),
            volatile_subkeys: node.subkey_count(StorageKind::Volatile),
            values: node.value_count(),
            parent: node.parent(),
        })
    }

    // --- values on keys -------------------------------------------------

    /// Sets a named value, replacing an existing one of the same name.
    /// The value lives in the key's own storage class.
    pub fn set_key_value(
        &mut self,
        key: CellId,
        name: &[u8],
        value_type: u32,
        data: &[u8],
    ) -> Result<()> {
        let (node, _) = self.read_key(key)?;
        let mut values = self.read_value_list(&node)?;

        let existing = self.find_value_slot(&values, name)?;
        let new_value = self.create_value(key.kind(), name, value_type, data)?;

        match existing {
            Some(pos) => {
                let old = values[pos];
                values[pos] = new_value;
                if let Err(err) = self.write_value_list(key, &values) {
                    let _ = self.delete_value(new_value);
                    return Err(err);
                }
                self.delete_value(old)
            }
            None => {
                values.push(new_value);
                if let Err(err) = self.write_value_list(key, &values) {
                    let _ = self.delete_value(new_value);
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// Finds a value on `key` by name.
    pub fn get_key_value(&mut self, key: CellId, name: &[u8]) -> Result<Option<CellId>> {
        let (node, _) = self.read_key(key)?;
        let values = self.read_value_list(&node)?;
        Ok(self.find_value_slot(&values, name)?.map(|pos| values[pos]))
    }

    pub fn delete_key_value(&mut self, key: CellId, name: &[u8]) -> Result<()> {
        let (node, _) = self.read_key(key)?;
        let mut values = self.read_value_list(&node)?;
        let pos = self
            .find_value_slot(&values, name)?
            .ok_or_else(|| eyre::eyre!("no value named '{}'", String::from_utf8_lossy(name)))?;
        let victim = values.remove(pos);
        self.write_value_list(key, &values)?;
        self.delete_value(victim)
    }

    // --- subtree operations ---------------------------------------------

    /// Copies the stable subtree rooted at `src_key` (in `src`) beneath
    /// `dst_parent` (in `dst`). Returns the new subtree root.
    pub fn copy_subtree(
        src: &mut Hive,
        src_key: CellId,
        dst: &mut Hive,
        dst_parent: CellId,
    ) -> Result<CellId> {
        let name = src.key_name(src_key)?;
        ensure!(
            dst.find_key(dst_parent, &name)?.is_none(),
            "destination already has a key named '{}'",
            String::from_utf8_lossy(&name)
        );
        let new_root = dst.create_key(dst_parent, &name, StorageKind::Stable)?;
        Hive::merge_subtree(src, src_key, dst, new_root)?;
        Ok(new_root)
    }

    /// Merges `src_key`'s stable subtree into `dst_key`: keys are
    /// created where missing, values overwritten with the source's.
    /// Keys and values present only in the destination survive.
    pub fn merge_subtree(
        src: &mut Hive,
        src_key: CellId,
        dst: &mut Hive,
        dst_key: CellId,
    ) -> Result<()> {
        let mut stack: Vec<(CellId, CellId, usize)> = vec![(src_key, dst_key, 0)];
        while let Some((s, d, depth)) = stack.pop() {
            ensure!(
                depth <= MAX_CHECK_DEPTH,
                "subtree deeper than {} keys",
                MAX_CHECK_DEPTH
            );

            for value in src.enumerate_values(s)? {
                let meta = src.value_meta(value)?;
                let data = src.read_value_data(value)?;
                dst.set_key_value(d, &meta.name, meta.value_type, &data)?;
            }

            for child in src.subkey_ids(s, StorageKind::Stable)? {
                let name = src.key_name(child)?;
                let target = match dst.find_key(d, &name)? {
                    Some(existing) => existing,
                    None => dst.create_key(d, &name, StorageKind::Stable)?,
                };
                stack.push((child, target, depth + 1));
            }
        }
        Ok(())
    }

    /// Makes `dst_key`'s stable subtree identical to `src_key`'s:
    /// deletes what the source lacks, then merges the rest.
    pub fn sync_subtree(
        src: &mut Hive,
        src_key: CellId,
        dst: &mut Hive,
        dst_key: CellId,
    ) -> Result<()> {
        let mut stack: Vec<(CellId, CellId, usize)> = vec![(src_key, dst_key, 0)];
        while let Some((s, d, depth)) = stack.pop() {
            ensure!(
                depth <= MAX_CHECK_DEPTH,
                "subtree deeper than {} keys",
                MAX_CHECK_DEPTH
            );

            let src_value_names: Vec<Vec<u8>> = {
                let mut names = Vec::new();
                for value in src.enumerate_values(s)? {
                    names.push(src.value_meta(value)?.name);
                }
                names
            };
            for value in dst.enumerate_values(d)? {
                let name = dst.value_meta(value)?.name;
                if !src_value_names
                    .iter()
                    .any(|n| name_cmp(n, &name) == std::cmp::Ordering::Equal)
                {
                    dst.delete_key_value(d, &name)?;
                }
            }
            for value in src.enumerate_values(s)? {
                let meta = src.value_meta(value)?;
                let data = src.read_value_data(value)?;
                dst.set_key_value(d, &meta.name, meta.value_type, &data)?;
            }

            let src_child_names: Vec<Vec<u8>> = {
                let mut names = Vec::new();
                for child in src.subkey_ids(s, StorageKind::Stable)? {
                    names.push(src.key_name(child)?);
                }
                names
            };
            for child in dst.subkey_ids(d, StorageKind::Stable)? {
                let name = dst.key_name(child)?;
                if !src_child_names
                    .iter()
                    .any(|n| name_cmp(n, &name) == std::cmp::Ordering::Equal)
                {
                    dst.delete_subtree(child)?;
                }
            }

            for child in src.subkey_ids(s, StorageKind::Stable)? {
                let name = src.key_name(child)?;
                let target = match dst.find_key(d, &name)? {
                    Some(existing) => existing,
                    None => dst.create_key(d, &name, StorageKind::Stable)?,
                };
                stack.push((child, target, depth + 1));
            }
        }
        Ok(())
    }

    /// Rewrites every stored cell reference through `remap`. Used after a
    /// relocation pass moved cells: the table says where each moved cell
    /// went, and this walk repoints the root, parent links, subkey and
    /// value lists, and value data references.
    pub fn apply_remap(&mut self, remap: &RemapTable) -> Result<()> {
        if remap.is_empty() {
            return Ok(());
        }
        let root = self.root_cell();
        if root.is_nil() {
            return Ok(());
        }
        let root = remap.get(&root).copied().unwrap_or(root);
        self.set_root_cell(root);

        let mut stack: Vec<(CellId, usize)> = vec![(root, 0)];
        while let Some((key, depth)) = stack.pop() {
            ensure!(
                depth <= MAX_CHECK_DEPTH,
                "subtree deeper than {} keys",
                MAX_CHECK_DEPTH
            );
            let (mut node, _) = self.read_key(key)?;
            let mut node_changed = false;

            if let Some(&parent) = remap.get(&node.parent()) {
                node.set_parent(parent);
                node_changed = true;
            }

            for kind in StorageKind::both() {
                let mut list = node.subkey_list(kind);
                if list.is_nil() {
                    continue;
                }
                if let Some(&moved) = remap.get(&list) {
                    node.set_subkey_list(kind, moved);
                    node_changed = true;
                    list = moved;
                }
                let mut children = {
                    let guard = self.cell(list)?;
                    decode_index(guard.data())?
                };
                let mut list_changed = false;
                for child in children.iter_mut() {
                    if let Some(&moved) = remap.get(child) {
                        *child = moved;
                        list_changed = true;
                    }
                }
                if list_changed {
                    let mut guard = self.cell(list)?;
                    encode_index(&children, guard.data_mut())?;
                    drop(guard);
                    self.mark_cell_dirty(list)?;
                }
                for child in children {
                    stack.push((child, depth + 1));
                }
            }

            let mut vlist = node.value_list();
            if !vlist.is_nil() {
                if let Some(&moved) = remap.get(&vlist) {
                    node.set_value_list(moved);
                    node_changed = true;
                    vlist = moved;
                }
                let count = node.value_count() as usize;
                let mut values = {
                    let guard = self.cell(vlist)?;
                    decode_bare_list(guard.data(), count)?
                };
                let mut list_changed = false;
                for value in values.iter_mut() {
                    if let Some(&moved) = remap.get(value) {
                        *value = moved;
                        list_changed = true;
                    }
                }
                if list_changed {
                    let mut guard = self.cell(vlist)?;
                    encode_bare_list(&values, guard.data_mut());
                    drop(guard);
                    self.mark_cell_dirty(vlist)?;
                }
                for value in values {
                    self.remap_value_data(value, remap)?;
                }
            }

            if node_changed {
                self.write_key(key, &node)?;
            }
        }
        Ok(())
    }

    /// Rebuilds the hive into a fresh image on `backing`: a tree copy
    /// into a grow-only hive, so free space, discarded bins and
    /// allocation scars all disappear. The source is unchanged.
    pub fn compact_into(&mut self, backing: Box<dyn FileBacking>) -> Result<Hive> {
        let mut target = Hive::create(backing, HiveConfig::grow_only())?;
        let root = self.root_cell();
        if root.is_nil() {
            target.flush()?;
            return Ok(target);
        }

        let name = self.key_name(root)?;
        let new_root = target.create_root_key(&name)?;
        Hive::merge_subtree(self, root, &mut target, new_root)?;
        target.flush()?;
        Ok(target)
    }

    // --- internals ------------------------------------------------------

    pub(crate) fn read_key(&mut self, key: CellId) -> Result<(KeyNode, Vec<u8>)> {
        let guard = self.cell(key)?;
        let (node, rest) = KeyNode::read_from_prefix(guard.data())
            .map_err(|_| eyre::eyre!("cell {} too small for a key node", key))?;
        node.validate(key)?;
        let name_len = node.name_length() as usize;
        ensure!(
            rest.len() >= name_len,
            "key node {} truncates its own name",
            key
        );
        let name = rest[..name_len].to_vec();
        Ok((node, name))
    }

    pub(crate) fn write_key(&mut self, key: CellId, node: &KeyNode) -> Result<()> {
        {
            let mut guard = self.cell(key)?;
            guard.data_mut()[..size_of::<KeyNode>()].copy_from_slice(node.as_bytes());
        }
        self.mark_cell_dirty(key)
    }

    fn write_fresh_key(
        &mut self,
        kind: StorageKind,
        parent: CellId,
        flags: u16,
        name: &[u8],
    ) -> Result<CellId> {
        ensure!(name.len() <= u16::MAX as usize, "key name too long");
        let size = size_of::<KeyNode>() + name.len();
        let vicinity = (!parent.is_nil()).then_some(parent);
        let cell = self.allocate_cell(kind, size, vicinity)?;

        let node = KeyNode::new(parent, flags, name.len());
        {
            let mut guard = self.cell(cell)?;
            let bytes = guard.data_mut();
            bytes[..size_of::<KeyNode>()].copy_from_slice(node.as_bytes());
            bytes[size_of::<KeyNode>()..size_of::<KeyNode>() + name.len()].copy_from_slice(name);
        }
        self.mark_cell_dirty(cell)?;
        Ok(cell)
    }

    pub(crate) fn subkey_ids(&mut self, key: CellId, kind: StorageKind) -> Result<Vec<CellId>> {
        let (node, _) = self.read_key(key)?;
        let list = node.subkey_list(kind);
        if list.is_nil() {
            ensure!(
                node.subkey_count(kind) == 0,
                "key {} counts {} subkeys but has no index",
                key,
                node.subkey_count(kind)
            );
            return Ok(Vec::new());
        }
        let guard = self.cell(list)?;
        let children = decode_index(guard.data())?;
        drop(guard);
        ensure!(
            children.len() == node.subkey_count(kind) as usize,
            "key {} subkey count disagrees with its index",
            key
        );
        Ok(children)
    }

    /// Binary search of a sorted child list by name.
    fn search_children(
        &mut self,
        children: &[CellId],
        name: &[u8],
    ) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = children.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_name = self.key_name(children[mid])?;
            match name_cmp(&mid_name, name) {
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(Err(lo))
    }

    /// Rewrites a key's subkey index for one class. The index cell lives
    /// in the children's storage class.
    fn set_subkey_index(
        &mut self,
        key: CellId,
        kind: StorageKind,
        children: &[CellId],
    ) -> Result<()> {
        let (mut node, _) = self.read_key(key)?;
        let old = node.subkey_list(kind);

        let list = if children.is_empty() {
            if !old.is_nil() {
                self.free_cell(old)?;
            }
            CellId::NIL
        } else {
            let size = index_cell_size(children.len());
            let cell = if old.is_nil() {
                self.allocate_cell(kind, size, Some(key))?
            } else {
                self.reallocate_cell(old, size)?
            };
            {
                let mut guard = self.cell(cell)?;
                encode_index(children, guard.data_mut())?;
            }
            self.mark_cell_dirty(cell)?;
            cell
        };

        node.set_subkey_list(kind, list);
        node.set_subkey_count(kind, children.len() as u32);
        self.write_key(key, &node)
    }

    fn read_value_list(&mut self, node: &KeyNode) -> Result<Vec<CellId>> {
        let list = node.value_list();
        if list.is_nil() {
            ensure!(
                node.value_count() == 0,
                "key counts {} values but has no list",
                node.value_count()
            );
            return Ok(Vec::new());
        }
        let guard = self.cell(list)?;
        decode_bare_list(guard.data(), node.value_count() as usize)
    }

    fn write_value_list(&mut self, key: CellId, values: &[CellId]) -> Result<()> {
        let (mut node, _) = self.read_key(key)?;
        let old = node.value_list();

        let list = if values.is_empty() {
            if !old.is_nil() {
                self.free_cell(old)?;
            }
            CellId::NIL
        } else {
            let size = values.len() * 4;
            let cell = if old.is_nil() {
                self.allocate_cell(key.kind(), size, Some(key))?
            } else {
                self.reallocate_cell(old, size)?
            };
            {
                let mut guard = self.cell(cell)?;
                encode_bare_list(values, guard.data_mut());
            }
            self.mark_cell_dirty(cell)?;
            cell
        };

        node.set_value_list(list);
        node.set_value_count(values.len() as u32);
        self.write_key(key, &node)
    }

    fn find_value_slot(&mut self, values: &[CellId], name: &[u8]) -> Result<Option<usize>> {
        for (pos, value) in values.iter().enumerate() {
            let meta = self.value_meta(*value)?;
            if name_cmp(&meta.name, name) == std::cmp::Ordering::Equal {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    fn detach_from_parent(&mut self, key: CellId, node: &KeyNode) -> Result<()> {
        let parent = node.parent();
        ensure!(!parent.is_nil(), "key {} has no parent to detach from", key);
        let mut siblings = self.subkey_ids(parent, key.kind())?;
        let pos = siblings
            .iter()
            .position(|&c| c == key)
            .ok_or_else(|| eyre::eyre!("key {} missing from its parent's index", key))?;
        siblings.remove(pos);
        self.set_subkey_index(parent, key.kind(), &siblings)
    }

    /// Frees a key's values, lists and node cell. Subkeys must already
    /// be gone and the parent index already updated.
    fn free_key_body(&mut self, key: CellId) -> Result<()> {
        let (node, _) = self.read_key(key)?;
        for value in self.read_value_list(&node)? {
            self.delete_value(value)?;
        }
        if !node.value_list().is_nil() {
            self.free_cell(node.value_list())?;
        }
        for kind in StorageKind::both() {
            let list = node.subkey_list(kind);
            if !list.is_nil() {
                self.free_cell(list)?;
            }
        }
        self.free_cell(key)
    }
}

fn decode_bare_list(data: &[u8], count: usize) -> Result<Vec<CellId>> {
    ensure!(
        data.len() >= count * 4,
        "list cell too small for {} entries",
        count
    );
    Ok((0..count)
        .map(|i| CellId(u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap())))
        .collect())
}

fn encode_bare_list(values: &[CellId], out: &mut [u8]) {
    for (i, value) in values.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&value.0.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBacking;

    fn new_hive() -> Hive {
        Hive::create(Box::new(MemoryBacking::new(0)), HiveConfig::default()).unwrap()
    }

    fn hive_with_root() -> (Hive, CellId) {
        let mut hive = new_hive();
        let root = hive.create_root_key(b"machine").unwrap();
        (hive, root)
    }

    #[test]
    fn root_key_is_flagged_and_registered() {
        let (mut hive, root) = hive_with_root();

        assert_eq!(hive.root_cell(), root);
        let meta = hive.key_meta(root).unwrap();
        assert_eq!(meta.name, b"machine");
        assert!(meta.parent.is_nil());
        assert!(hive.create_root_key(b"another").is_err());
    }

    #[test]
    fn create_find_delete_key() {
        let (mut hive, root) = hive_with_root();

        let child = hive.create_key(root, b"system", StorageKind::Stable).unwrap();
        assert_eq!(hive.find_key(root, b"system").unwrap(), Some(child));
        assert_eq!(hive.find_key(root, b"SYSTEM").unwrap(), Some(child));
        assert_eq!(hive.find_key(root, b"missing").unwrap(), None);

        hive.delete_key(child).unwrap();
        assert_eq!(hive.find_key(root, b"system").unwrap(), None);
        assert!(!hive.is_cell_allocated(child));
    }

    #[test]
    fn duplicate_names_are_rejected_across_classes() {
        let (mut hive, root) = hive_with_root();
        hive.create_key(root, b"session", StorageKind::Volatile).unwrap();

        assert!(hive.create_key(root, b"SESSION", StorageKind::Stable).is_err());
    }

    #[test]
    fn subkeys_enumerate_in_name_order() {
        let (mut hive, root) = hive_with_root();
        let c = hive.create_key(root, b"charlie", StorageKind::Stable).unwrap();
        let a = hive.create_key(root, b"alpha", StorageKind::Stable).unwrap();
        let b = hive.create_key(root, b"Bravo", StorageKind::Stable).unwrap();

        let children = hive.subkey_ids(root, StorageKind::Stable).unwrap();

        assert_eq!(children, vec![a, b, c]);
    }

    #[test]
    fn volatile_parent_rejects_stable_child() {
        let (mut hive, root) = hive_with_root();
        let session = hive.create_key(root, b"session", StorageKind::Volatile).unwrap();

        assert!(hive.create_key(session, b"leak", StorageKind::Stable).is_err());
        assert!(hive
            .create_key(session, b"scratch", StorageKind::Volatile)
            .is_ok());
    }

    #[test]
    fn find_path_walks_levels() {
        let (mut hive, root) = hive_with_root();
        let a = hive.create_key(root, b"software", StorageKind::Stable).unwrap();
        let b = hive.create_key(a, b"vendor", StorageKind::Stable).unwrap();

        assert_eq!(
            hive.find_path(root, &[b"software", b"vendor"]).unwrap(),
            Some(b)
        );
        assert_eq!(hive.find_path(root, &[b"software", b"nope"]).unwrap(), None);
    }

    #[test]
    fn key_values_roundtrip_and_replace() {
        let (mut hive, root) = hive_with_root();
        let key = hive.create_key(root, b"service", StorageKind::Stable).unwrap();

        hive.set_key_value(key, b"start", 4, &[2]).unwrap();
        hive.set_key_value(key, b"image", 1, b"C:\\svc.exe").unwrap();
        assert_eq!(hive.key_meta(key).unwrap().values, 2);

        let start = hive.get_key_value(key, b"START").unwrap().unwrap();
        assert_eq!(hive.read_value_data(start).unwrap(), vec![2]);

        // replacement keeps the count
        hive.set_key_value(key, b"start", 4, &[3]).unwrap();
        assert_eq!(hive.key_meta(key).unwrap().values, 2);
        let start = hive.get_key_value(key, b"start").unwrap().unwrap();
        assert_eq!(hive.read_value_data(start).unwrap(), vec![3]);

        hive.delete_key_value(key, b"image").unwrap();
        assert_eq!(hive.key_meta(key).unwrap().values, 1);
        assert!(hive.get_key_value(key, b"image").unwrap().is_none());
    }

    #[test]
    fn delete_key_refuses_populated_keys() {
        let (mut hive, root) = hive_with_root();
        let parent = hive.create_key(root, b"parent", StorageKind::Stable).unwrap();
        let _child = hive.create_key(parent, b"child", StorageKind::Stable).unwrap();

        assert!(hive.delete_key(parent).is_err());
        assert!(hive.delete_key(root).is_err());
    }

    #[test]
    fn delete_subtree_removes_everything() {
        let (mut hive, root) = hive_with_root();
        let top = hive.create_key(root, b"top", StorageKind::Stable).unwrap();
        let mid = hive.create_key(top, b"mid", StorageKind::Stable).unwrap();
        let leaf = hive.create_key(mid, b"leaf", StorageKind::Stable).unwrap();
        hive.set_key_value(leaf, b"payload", 3, &[0u8; 600]).unwrap();
        let vleaf = hive.create_key(mid, b"scratch", StorageKind::Volatile).unwrap();

        hive.delete_subtree(top).unwrap();

        assert_eq!(hive.find_key(root, b"top").unwrap(), None);
        for cell in [top, mid, leaf, vleaf] {
            assert!(!hive.is_cell_allocated(cell));
        }
    }

    #[test]
    fn copy_subtree_clones_structure_and_values() {
        let (mut src, src_root) = hive_with_root();
        let app = src.create_key(src_root, b"app", StorageKind::Stable).unwrap();
        let cfg = src.create_key(app, b"config", StorageKind::Stable).unwrap();
        src.set_key_value(cfg, b"port", 4, &8080u32.to_le_bytes()).unwrap();
        src.set_key_value(app, b"name", 1, b"demo").unwrap();
        // volatile children stay behind
        src.create_key(app, b"runtime", StorageKind::Volatile).unwrap();

        let (mut dst, dst_root) = hive_with_root();
        let copied = Hive::copy_subtree(&mut src, app, &mut dst, dst_root).unwrap();

        assert_eq!(dst.key_name(copied).unwrap(), b"app");
        let dcfg = dst.find_key(copied, b"config").unwrap().unwrap();
        let port = dst.get_key_value(dcfg, b"port").unwrap().unwrap();
        assert_eq!(dst.read_value_data(port).unwrap(), 8080u32.to_le_bytes());
        assert_eq!(dst.find_key(copied, b"runtime").unwrap(), None);
    }

    #[test]
    fn merge_overwrites_values_but_keeps_extras() {
        let (mut src, src_root) = hive_with_root();
        src.set_key_value(src_root, b"shared", 4, &[1]).unwrap();
        let sub = src.create_key(src_root, b"incoming", StorageKind::Stable).unwrap();
        src.set_key_value(sub, b"v", 4, &[7]).unwrap();

        let (mut dst, dst_root) = hive_with_root();
        dst.set_key_value(dst_root, b"shared", 4, &[9]).unwrap();
        dst.set_key_value(dst_root, b"local", 4, &[5]).unwrap();
        dst.create_key(dst_root, b"existing", StorageKind::Stable).unwrap();

        Hive::merge_subtree(&mut src, src_root, &mut dst, dst_root).unwrap();

        let shared = dst.get_key_value(dst_root, b"shared").unwrap().unwrap();
        assert_eq!(dst.read_value_data(shared).unwrap(), vec![1]);
        assert!(dst.get_key_value(dst_root, b"local").unwrap().is_some());
        assert!(dst.find_key(dst_root, b"existing").unwrap().is_some());
        assert!(dst.find_key(dst_root, b"incoming").unwrap().is_some());
    }

    #[test]
    fn sync_makes_destination_identical() {
        let (mut src, src_root) = hive_with_root();
        src.set_key_value(src_root, b"keep", 4, &[1]).unwrap();
        src.create_key(src_root, b"wanted", StorageKind::Stable).unwrap();

        let (mut dst, dst_root) = hive_with_root();
        dst.set_key_value(dst_root, b"keep", 4, &[2]).unwrap();
        dst.set_key_value(dst_root, b"stale", 4, &[3]).unwrap();
        let doomed = dst.create_key(dst_root, b"unwanted", StorageKind::Stable).unwrap();

        Hive::sync_subtree(&mut src, src_root, &mut dst, dst_root).unwrap();

        let keep = dst.get_key_value(dst_root, b"keep").unwrap().unwrap();
        assert_eq!(dst.read_value_data(keep).unwrap(), vec![1]);
        assert!(dst.get_key_value(dst_root, b"stale").unwrap().is_none());
        assert!(dst.find_key(dst_root, b"unwanted").unwrap().is_none());
        assert!(!dst.is_cell_allocated(doomed));
        assert!(dst.find_key(dst_root, b"wanted").unwrap().is_some());
    }

    #[test]
    fn apply_remap_repoints_moved_cells() {
        let (mut hive, root) = hive_with_root();
        let key = hive.create_key(root, b"svc", StorageKind::Stable).unwrap();
        hive.set_key_value(key, b"data", 3, &[0xAA; 100]).unwrap();
        let value = hive.get_key_value(key, b"data").unwrap().unwrap();

        // physically relocate the value descriptor, then repoint
        let moved = hive.duplicate_cell(value, StorageKind::Stable).unwrap();
        let mut remap = RemapTable::new();
        remap.insert(value, moved);
        hive.apply_remap(&remap).unwrap();
        hive.free_cell(value).unwrap();

        let found = hive.get_key_value(key, b"data").unwrap().unwrap();
        assert_eq!(found, moved);
        assert_eq!(hive.read_value_data(found).unwrap(), vec![0xAA; 100]);
    }

    #[test]
    fn compact_into_produces_equivalent_compact_image() {
        let (mut hive, root) = hive_with_root();
        let app = hive.create_key(root, b"app", StorageKind::Stable).unwrap();
        hive.set_key_value(app, b"big", 3, &vec![7u8; 40_000]).unwrap();
        hive.set_key_value(app, b"small", 4, &[1]).unwrap();
        // churn to leave holes behind
        hive.set_key_value(app, b"big", 3, &[2]).unwrap();
        let doomed = hive.create_key(root, b"temp", StorageKind::Stable).unwrap();
        hive.delete_key(doomed).unwrap();

        let mut compacted = hive.compact_into(Box::new(MemoryBacking::new(0))).unwrap();

        assert!(
            compacted.storage_length(StorageKind::Stable)
                <= hive.storage_length(StorageKind::Stable)
        );
        let croot = compacted.root_cell();
        let capp = compacted.find_key(croot, b"app").unwrap().unwrap();
        let big = compacted.get_key_value(capp, b"big").unwrap().unwrap();
        assert_eq!(compacted.read_value_data(big).unwrap(), vec![2]);
    }
}
