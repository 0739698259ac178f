//! # Tree Consistency Checker
//!
//! Walks the key tree with an explicit stack and validates every node
//! against its cell, its parent, its value list and its subkey indices.
//! The walk is detection only: it produces a list of findings, each with
//! a numeric status code and, where the damage is locally repairable, a
//! repair action. A separate apply pass performs the repairs, then the
//! walk re-runs until it comes back clean. Keeping detection and
//! mutation apart makes a healed hive stable: a second check finds
//! nothing left to do.
//!
//! Unresolvable cells and trees deeper than `MAX_CHECK_DEPTH` are fatal.
//! A cell that cannot be read cannot be judged, and a runaway depth
//! usually means an index cycle; neither is healed.
//!
//! The worst-case repair unlinks an offending subtree from its parent
//! without freeing its cells. Corrupt cells are not safe to free (their
//! size words may lie), so the space is leaked until the hive is
//! compacted.

use eyre::Result;
use smallvec::SmallVec;
use zerocopy::{FromBytes, IntoBytes};

use crate::config::MAX_CHECK_DEPTH;
use crate::hive::{CellId, Hive, StorageKind};
use crate::tree::node::{decode_index, encode_index, KeyNode, KEY_FLAG_ROOT};
use crate::tree::name_cmp;

/// Detection passes before the checker gives up on a flapping repair.
const HEAL_PASS_LIMIT: usize = 8;

/// Checker status codes. Zero is clean; everything else identifies the
/// first problem found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CheckCode {
    Clean = 0,
    /// A referenced cell could not be resolved at all. Fatal.
    UnmappedCell = 4010,
    /// A key reference points at a free or implausible cell.
    FreeKeyCell = 4015,
    /// A key node does not fit its containing cell.
    ImplausibleSize = 4020,
    BadSignature = 4030,
    WrongParent = 4040,
    /// Root flag set on a non-root key, or missing from the root.
    BadRootFlag = 4045,
    /// Value list cell missing, free or too small for its count.
    DanglingValueList = 4050,
    /// A value list entry is not a valid value cell.
    BadValueEntry = 4055,
    /// Subkey index cell missing or free.
    DanglingSubkeyList = 4060,
    /// Subkey index cell undecodable.
    BadSubkeyIndex = 4065,
    /// Declared subkey count disagrees with the index.
    SubkeyCountMismatch = 4070,
    SiblingOrderViolation = 4075,
    /// A volatile key claims stable children.
    VolatileWithStableChildren = 4080,
    /// Tree deeper than `MAX_CHECK_DEPTH`. Fatal.
    DepthExceeded = 4090,
}

/// What the check should do beyond detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckFlags {
    /// Apply repairs and re-run until clean.
    pub heal: bool,
    /// Clear all volatile subkey state during the walk. Used right after
    /// opening an image, whose volatile storage is necessarily empty.
    pub clear_volatile: bool,
}

impl From<&crate::config::HiveConfig> for CheckFlags {
    fn from(cfg: &crate::config::HiveConfig) -> Self {
        Self {
            heal: cfg.self_heal,
            clear_volatile: false,
        }
    }
}

/// Out-of-band context for the first finding.
#[derive(Debug, Clone)]
pub struct CheckDebug {
    pub cell: CellId,
    pub code: CheckCode,
    pub detail: String,
}

/// Result of a full check.
#[derive(Debug)]
pub struct CheckOutcome {
    /// Zero when the tree is (or was healed to) clean.
    pub status: u32,
    /// Repairs were applied in this call.
    pub healed: bool,
    pub repairs_applied: usize,
    /// Context for the first unhealed finding, when `status != 0`.
    pub debug: Option<CheckDebug>,
}

/// A locally applicable fix for one finding. All repairs patch the key
/// node (or its index cells) in place; none of them free cells.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Repair {
    FixSignature,
    FixFlags(u16),
    RepointParent(CellId),
    /// Zero the value count and NIL the list reference.
    ClearValueList,
    /// Keep only the first `n` value entries.
    TruncateValues(u32),
    /// Zero one class's subkey count and NIL its index reference.
    ClearSubkeyList(StorageKind),
    FixSubkeyCount(StorageKind, u32),
    /// Remove one child from a class's index, leaking its subtree.
    UnlinkChild(StorageKind, CellId),
}

#[derive(Debug)]
struct Finding {
    cell: CellId,
    code: CheckCode,
    repair: Option<Repair>,
    detail: String,
}

impl Hive {
    /// Validates the whole key tree. With healing enabled, repairs what
    /// it can and re-runs until the tree is clean; the outcome's status
    /// is the first finding the final pass could not fix.
    pub fn check(&mut self, flags: CheckFlags) -> Result<CheckOutcome> {
        let mut repairs_applied = 0usize;
        let mut healed = false;

        for pass in 0..HEAL_PASS_LIMIT {
            let mut walk = Walk::new(flags.clear_volatile && pass == 0);
            walk.run(self)?;

            for (cell, repair) in walk.cleanups {
                apply_repair(self, cell, &repair)?;
            }

            let Some(first) = walk.findings.first() else {
                return Ok(CheckOutcome {
                    status: 0,
                    healed,
                    repairs_applied,
                    debug: None,
                });
            };

            let fatal = walk.findings.iter().find(|f| f.repair.is_none());
            if !flags.heal || fatal.is_some() {
                let f = fatal.unwrap_or(first);
                return Ok(CheckOutcome {
                    status: f.code as u32,
                    healed,
                    repairs_applied,
                    debug: Some(CheckDebug {
                        cell: f.cell,
                        code: f.code,
                        detail: f.detail.clone(),
                    }),
                });
            }

            for finding in &walk.findings {
                if let Some(repair) = &finding.repair {
                    apply_repair(self, finding.cell, repair)?;
                    repairs_applied += 1;
                }
            }
            healed = true;
            self.set_self_healed();
        }

        // a repair that keeps re-detecting is itself a bug; report the
        // last pass's first finding rather than looping forever
        let mut walk = Walk::new(false);
        walk.run(self)?;
        let status = walk.findings.first().map(|f| f.code as u32).unwrap_or(0);
        Ok(CheckOutcome {
            status,
            healed,
            repairs_applied,
            debug: walk.findings.first().map(|f| CheckDebug {
                cell: f.cell,
                code: f.code,
                detail: f.detail.clone(),
            }),
        })
    }
}

struct Walk {
    clear_volatile: bool,
    findings: Vec<Finding>,
    cleanups: Vec<(CellId, Repair)>,
    fatal: bool,
}

impl Walk {
    fn new(clear_volatile: bool) -> Self {
        Self {
            clear_volatile,
            findings: Vec::new(),
            cleanups: Vec::new(),
            fatal: false,
        }
    }

    fn run(&mut self, hive: &mut Hive) -> Result<()> {
        let root = hive.root_cell();
        if root.is_nil() {
            return Ok(());
        }

        let mut stack: Vec<(CellId, CellId, usize)> = vec![(root, CellId::NIL, 0)];
        while let Some((key, parent, depth)) = stack.pop() {
            if self.fatal {
                break;
            }
            if depth > MAX_CHECK_DEPTH {
                self.fatal = true;
                self.findings.push(Finding {
                    cell: key,
                    code: CheckCode::DepthExceeded,
                    repair: None,
                    detail: format!("key tree deeper than {} levels", MAX_CHECK_DEPTH),
                });
                break;
            }
            for child in self.visit(hive, key, parent)? {
                stack.push((child, key, depth + 1));
            }
        }
        Ok(())
    }

    /// Validates one key and returns the children to descend into.
    fn visit(&mut self, hive: &mut Hive, key: CellId, parent: CellId) -> Result<Vec<CellId>> {
        if !hive.is_cell_allocated(key) {
            let repair = (!parent.is_nil()).then(|| Repair::UnlinkChild(key.kind(), key));
            // the unlink patches the parent, so attribute it there
            let cell = if parent.is_nil() { key } else { parent };
            self.findings.push(Finding {
                cell,
                code: if parent.is_nil() {
                    CheckCode::UnmappedCell
                } else {
                    CheckCode::FreeKeyCell
                },
                repair,
                detail: format!("key reference {} is not an allocated cell", key),
            });
            self.fatal = parent.is_nil();
            return Ok(Vec::new());
        }

        let (node, cell_len) = {
            let guard = match hive.cell(key) {
                Ok(g) => g,
                Err(_) => {
                    self.fatal = true;
                    self.findings.push(Finding {
                        cell: key,
                        code: CheckCode::UnmappedCell,
                        repair: None,
                        detail: format!("key cell {} cannot be mapped", key),
                    });
                    return Ok(Vec::new());
                }
            };
            let Ok((node, _)) = KeyNode::read_from_prefix(guard.data()) else {
                self.findings.push(Finding {
                    cell: parent,
                    code: CheckCode::ImplausibleSize,
                    repair: (!parent.is_nil()).then(|| Repair::UnlinkChild(key.kind(), key)),
                    detail: format!("cell {} too small for a key node", key),
                });
                self.fatal = parent.is_nil();
                return Ok(Vec::new());
            };
            (node, guard.len())
        };

        if size_of::<KeyNode>() + node.name_length() as usize > cell_len {
            self.findings.push(Finding {
                cell: parent,
                code: CheckCode::ImplausibleSize,
                repair: (!parent.is_nil()).then(|| Repair::UnlinkChild(key.kind(), key)),
                detail: format!(
                    "key {} claims a {}-byte name in a {}-byte cell",
                    key,
                    node.name_length(),
                    cell_len
                ),
            });
            self.fatal = parent.is_nil();
            return Ok(Vec::new());
        }

        if node.signature() != crate::tree::KEY_SIGNATURE {
            self.findings.push(Finding {
                cell: key,
                code: CheckCode::BadSignature,
                repair: Some(Repair::FixSignature),
                detail: format!("key {} signature {:04x}", key, node.signature()),
            });
        }

        if node.parent() != parent {
            self.findings.push(Finding {
                cell: key,
                code: CheckCode::WrongParent,
                repair: Some(Repair::RepointParent(parent)),
                detail: format!(
                    "key {} records parent {}, reached from {}",
                    key,
                    node.parent(),
                    parent
                ),
            });
        }

        let want_root = parent.is_nil();
        if node.is_root() != want_root {
            let flags = if want_root {
                node.flags() | KEY_FLAG_ROOT
            } else {
                node.flags() & !KEY_FLAG_ROOT
            };
            self.findings.push(Finding {
                cell: key,
                code: CheckCode::BadRootFlag,
                repair: Some(Repair::FixFlags(flags)),
                detail: format!("key {} root flag disagrees with its position", key),
            });
        }

        self.check_values(hive, key, &node)?;

        let mut children = Vec::new();
        for kind in StorageKind::both() {
            if kind == StorageKind::Volatile && self.clear_volatile {
                if node.subkey_count(kind) != 0 || !node.subkey_list(kind).is_nil() {
                    self.cleanups.push((key, Repair::ClearSubkeyList(kind)));
                }
                continue;
            }
            if kind == StorageKind::Stable
                && key.kind() == StorageKind::Volatile
                && (node.subkey_count(kind) != 0 || !node.subkey_list(kind).is_nil())
            {
                self.findings.push(Finding {
                    cell: key,
                    code: CheckCode::VolatileWithStableChildren,
                    repair: Some(Repair::ClearSubkeyList(kind)),
                    detail: format!("volatile key {} claims stable children", key),
                });
                continue;
            }
            self.check_subkey_index(hive, key, &node, kind, &mut children)?;
        }
        Ok(children)
    }

    fn check_values(&mut self, hive: &mut Hive, key: CellId, node: &KeyNode) -> Result<()> {
        let count = node.value_count();
        let list = node.value_list();
        if count == 0 && list.is_nil() {
            return Ok(());
        }
        if list.is_nil() || !hive.is_cell_allocated(list) {
            self.findings.push(Finding {
                cell: key,
                code: CheckCode::DanglingValueList,
                repair: Some(Repair::ClearValueList),
                detail: format!("key {} counts {} values with no usable list", key, count),
            });
            return Ok(());
        }

        let values: SmallVec<[CellId; 16]> = {
            let guard = match hive.cell(list) {
                Ok(g) => g,
                Err(_) => {
                    self.fatal = true;
                    self.findings.push(Finding {
                        cell: list,
                        code: CheckCode::UnmappedCell,
                        repair: None,
                        detail: format!("value list cell {} cannot be mapped", list),
                    });
                    return Ok(());
                }
            };
            let data = guard.data();
            if data.len() < count as usize * 4 {
                self.findings.push(Finding {
                    cell: key,
                    code: CheckCode::DanglingValueList,
                    repair: Some(Repair::ClearValueList),
                    detail: format!(
                        "key {} value list holds {} bytes for {} entries",
                        key,
                        data.len(),
                        count
                    ),
                });
                return Ok(());
            }
            (0..count as usize)
                .map(|i| CellId(u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap())))
                .collect()
        };

        for (i, value) in values.iter().enumerate() {
            let ok = hive.is_cell_allocated(*value) && hive.value_meta(*value).is_ok();
            if !ok {
                self.findings.push(Finding {
                    cell: key,
                    code: CheckCode::BadValueEntry,
                    repair: Some(Repair::TruncateValues(i as u32)),
                    detail: format!("key {} value entry {} ({}) is invalid", key, i, value),
                });
                return Ok(());
            }
        }
        Ok(())
    }

    fn check_subkey_index(
        &mut self,
        hive: &mut Hive,
        key: CellId,
        node: &KeyNode,
        kind: StorageKind,
        children: &mut Vec<CellId>,
    ) -> Result<()> {
        let count = node.subkey_count(kind);
        let list = node.subkey_list(kind);
        if count == 0 && list.is_nil() {
            return Ok(());
        }
        if list.is_nil() {
            self.findings.push(Finding {
                cell: key,
                code: CheckCode::SubkeyCountMismatch,
                repair: Some(Repair::FixSubkeyCount(kind, 0)),
                detail: format!("key {} counts {} subkeys with no index", key, count),
            });
            return Ok(());
        }
        if !hive.is_cell_allocated(list) {
            self.findings.push(Finding {
                cell: key,
                code: CheckCode::DanglingSubkeyList,
                repair: Some(Repair::ClearSubkeyList(kind)),
                detail: format!("key {} subkey index {} is not allocated", key, list),
            });
            return Ok(());
        }

        let entries = {
            let guard = match hive.cell(list) {
                Ok(g) => g,
                Err(_) => {
                    self.fatal = true;
                    self.findings.push(Finding {
                        cell: list,
                        code: CheckCode::UnmappedCell,
                        repair: None,
                        detail: format!("subkey index cell {} cannot be mapped", list),
                    });
                    return Ok(());
                }
            };
            match decode_index(guard.data()) {
                Ok(entries) => entries,
                Err(err) => {
                    self.findings.push(Finding {
                        cell: key,
                        code: CheckCode::BadSubkeyIndex,
                        repair: Some(Repair::ClearSubkeyList(kind)),
                        detail: format!("key {} subkey index undecodable: {}", key, err),
                    });
                    return Ok(());
                }
            }
        };

        if entries.len() != count as usize {
            self.findings.push(Finding {
                cell: key,
                code: CheckCode::SubkeyCountMismatch,
                repair: Some(Repair::FixSubkeyCount(kind, entries.len() as u32)),
                detail: format!(
                    "key {} counts {} {} subkeys, index holds {}",
                    key,
                    count,
                    kind_label(kind),
                    entries.len()
                ),
            });
        }

        let mut prior: Option<Vec<u8>> = None;
        for entry in &entries {
            let Some(name) = key_name_raw(hive, *entry) else {
                // the child's own visit reports and unlinks it
                children.push(*entry);
                continue;
            };
            if let Some(prev) = &prior {
                if name_cmp(prev, &name) != std::cmp::Ordering::Less {
                    self.findings.push(Finding {
                        cell: key,
                        code: CheckCode::SiblingOrderViolation,
                        repair: Some(Repair::UnlinkChild(kind, *entry)),
                        detail: format!(
                            "key {} child '{}' out of order",
                            key,
                            String::from_utf8_lossy(&name)
                        ),
                    });
                    continue;
                }
            }
            prior = Some(name);
            children.push(*entry);
        }
        Ok(())
    }
}

/// Reads a key's name without judging the node; `None` when the cell or
/// layout is unusable.
fn key_name_raw(hive: &mut Hive, key: CellId) -> Option<Vec<u8>> {
    if !hive.is_cell_allocated(key) {
        return None;
    }
    let guard = hive.cell(key).ok()?;
    let (node, rest) = KeyNode::read_from_prefix(guard.data()).ok()?;
    let len = node.name_length() as usize;
    (rest.len() >= len).then(|| rest[..len].to_vec())
}

/// Applies one repair by patching the node (or one of its index cells)
/// in place. Never allocates or frees.
fn apply_repair(hive: &mut Hive, cell: CellId, repair: &Repair) -> Result<()> {
    match repair {
        Repair::UnlinkChild(kind, child) => return unlink_child(hive, cell, *kind, *child),
        Repair::TruncateValues(keep) => {
            return patch_node(hive, cell, |node| node.set_value_count(*keep))
        }
        _ => {}
    }

    patch_node(hive, cell, |node| match repair {
        Repair::FixSignature => node.set_signature(crate::tree::KEY_SIGNATURE),
        Repair::FixFlags(flags) => node.set_flags(*flags),
        Repair::RepointParent(parent) => node.set_parent(*parent),
        Repair::ClearValueList => {
            node.set_value_count(0);
            node.set_value_list(CellId::NIL);
        }
        Repair::ClearSubkeyList(kind) => {
            node.set_subkey_count(*kind, 0);
            node.set_subkey_list(*kind, CellId::NIL);
        }
        Repair::FixSubkeyCount(kind, count) => node.set_subkey_count(*kind, *count),
        Repair::TruncateValues(_) | Repair::UnlinkChild(..) => unreachable!(),
    })
}

fn patch_node(hive: &mut Hive, key: CellId, patch: impl FnOnce(&mut KeyNode)) -> Result<()> {
    {
        let mut guard = hive.cell(key)?;
        let bytes = guard.data_mut();
        let (mut node, _) = KeyNode::read_from_prefix(bytes)
            .map_err(|_| eyre::eyre!("cell {} too small for a key node", key))?;
        patch(&mut node);
        bytes[..size_of::<KeyNode>()].copy_from_slice(node.as_bytes());
    }
    hive.mark_cell_dirty(key)
}

/// Rewrites the parent's index with `child` removed, in place. The index
/// cell only shrinks, so no reallocation is needed.
fn unlink_child(hive: &mut Hive, parent: CellId, kind: StorageKind, child: CellId) -> Result<()> {
    let node = {
        let guard = hive.cell(parent)?;
        let (node, _) = KeyNode::read_from_prefix(guard.data())
            .map_err(|_| eyre::eyre!("cell {} too small for a key node", parent))?;
        node
    };
    let list = node.subkey_list(kind);
    if list.is_nil() {
        return Ok(());
    }

    let mut entries = {
        let guard = hive.cell(list)?;
        decode_index(guard.data())?
    };
    entries.retain(|&e| e != child);

    if entries.is_empty() {
        return patch_node(hive, parent, |node| {
            node.set_subkey_count(kind, 0);
            node.set_subkey_list(kind, CellId::NIL);
        });
    }

    {
        let mut guard = hive.cell(list)?;
        encode_index(&entries, guard.data_mut())?;
    }
    hive.mark_cell_dirty(list)?;
    patch_node(hive, parent, |node| {
        node.set_subkey_count(kind, entries.len() as u32)
    })
}

fn kind_label(kind: StorageKind) -> &'static str {
    match kind {
        StorageKind::Stable => "stable",
        StorageKind::Volatile => "volatile",
    }
}
