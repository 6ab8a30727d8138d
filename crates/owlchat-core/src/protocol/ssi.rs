//! Server-stored buddy list
//!
//! The server keeps the buddy list as flat items keyed by
//! `(group id, item id)`. Groups list their members' item ids in TLV 0x00c8;
//! the master group (0, 0) lists the group ids. [`Feedbag`] is the local
//! mirror and plans the item edits for adding and removing buddies.

use std::collections::BTreeSet;

use crate::errors::{OwlchatError, Result};
use crate::protocol::bytes::{check_u16_len, ByteReader, WireWrite};
use crate::protocol::tlv::{Tlv, TlvChain};
use crate::types::normalize_screen_name;

pub const ITEM_BUDDY: u16 = 0x0000;
pub const ITEM_GROUP: u16 = 0x0001;

pub const TLV_MEMBERS: u16 = 0x00c8;

/// One server-stored list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsiItem {
    pub name: String,
    pub group_id: u16,
    pub item_id: u16,
    pub item_type: u16,
    pub tlvs: TlvChain,
}

impl SsiItem {
    pub fn buddy(name: &str, group_id: u16, item_id: u16) -> Self {
        Self {
            name: name.to_string(),
            group_id,
            item_id,
            item_type: ITEM_BUDDY,
            tlvs: TlvChain::new(),
        }
    }

    pub fn group(name: &str, group_id: u16, members: &[u16]) -> Self {
        let mut item = Self {
            name: name.to_string(),
            group_id,
            item_id: 0,
            item_type: ITEM_GROUP,
            tlvs: TlvChain::new(),
        };
        item.set_members(members);
        item
    }

    pub fn is_group(&self) -> bool {
        self.item_type == ITEM_GROUP
    }

    pub fn is_buddy(&self) -> bool {
        self.item_type == ITEM_BUDDY
    }

    pub fn is_master_group(&self) -> bool {
        self.is_group() && self.group_id == 0 && self.item_id == 0
    }

    /// Member ids listed in TLV 0x00c8
    pub fn members(&self) -> Vec<u16> {
        self.tlvs
            .get(TLV_MEMBERS, 0)
            .map(|tlv| {
                tlv.value()
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_members(&mut self, members: &[u16]) {
        let value: Vec<u8> = members.iter().flat_map(|id| id.to_be_bytes()).collect();
        let others = self
            .tlvs
            .entries()
            .iter()
            .filter(|tlv| tlv.tag() != TLV_MEMBERS)
            .cloned();
        let mut tlvs: TlvChain = others.collect();
        if !members.is_empty() {
            tlvs.push(Tlv::new(TLV_MEMBERS, value).unwrap_or_else(|_| Tlv::empty(TLV_MEMBERS)));
        }
        self.tlvs = tlvs;
    }

    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(reader.read_u16_prefixed()?).into_owned();
        let group_id = reader.read_u16()?;
        let item_id = reader.read_u16()?;
        let item_type = reader.read_u16()?;
        let tlvs = TlvChain::decode_sized(reader)?;
        Ok(Self {
            name,
            group_id,
            item_id,
            item_type,
            tlvs,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        check_u16_len("list item name", self.name.as_bytes())?;
        out.put_u16_prefixed(self.name.as_bytes());
        out.put_u16(self.group_id);
        out.put_u16(self.item_id);
        out.put_u16(self.item_type);
        let tlvs = self.tlvs.encode();
        check_u16_len("list item TLVs", &tlvs)?;
        out.put_u16_prefixed(&tlvs);
        Ok(())
    }
}

/// Decode a run of items filling `data`
pub fn decode_items(data: &[u8]) -> Result<Vec<SsiItem>> {
    let mut reader = ByteReader::new(data, "list items");
    let mut items = Vec::new();
    while !reader.is_empty() {
        items.push(SsiItem::read(&mut reader)?);
    }
    Ok(items)
}

pub fn encode_items(items: &[SsiItem]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for item in items {
        item.write(&mut out)?;
    }
    Ok(out)
}

/// Full list reply (possibly one of several parts)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsiList {
    pub version: u8,
    pub items: Vec<SsiItem>,
    /// Zero on every part except the last
    pub last_modified: u32,
}

impl SsiList {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data, "list");
        let version = reader.read_u8()?;
        let count = reader.read_u16()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(SsiItem::read(&mut reader)?);
        }
        let last_modified = reader.read_u32()?;
        Ok(Self {
            version,
            items,
            last_modified,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.put_u8(self.version);
        out.put_u16(self.items.len() as u16);
        for item in &self.items {
            item.write(&mut out)?;
        }
        out.put_u32(self.last_modified);
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// Feedbag
// ----------------------------------------------------------------------------

/// Kind of list edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsiOp {
    Add,
    Modify,
    Delete,
}

/// One item edit to send inside an edit transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsiEdit {
    pub op: SsiOp,
    pub item: SsiItem,
}

/// Local mirror of the server-stored list
#[derive(Debug, Clone, Default)]
pub struct Feedbag {
    items: Vec<SsiItem>,
    received: bool,
}

impl Feedbag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one list reply; `is_final` marks the list complete
    pub fn extend(&mut self, items: Vec<SsiItem>, is_final: bool) {
        for item in items {
            self.upsert(item);
        }
        if is_final {
            self.received = true;
        }
    }

    pub fn is_received(&self) -> bool {
        self.received
    }

    pub fn mark_received(&mut self) {
        self.received = true;
    }

    pub fn items(&self) -> &[SsiItem] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.received = false;
    }

    pub fn upsert(&mut self, item: SsiItem) {
        match self.items.iter_mut().find(|existing| {
            existing.group_id == item.group_id
                && existing.item_id == item.item_id
                && existing.is_group() == item.is_group()
        }) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn remove(&mut self, item: &SsiItem) {
        self.items.retain(|existing| {
            !(existing.group_id == item.group_id
                && existing.item_id == item.item_id
                && existing.item_type == item.item_type)
        });
    }

    pub fn find_group(&self, name: &str) -> Option<&SsiItem> {
        let wanted = normalize_screen_name(name);
        self.items
            .iter()
            .filter(|item| item.is_group() && !item.is_master_group())
            .find(|item| normalize_screen_name(&item.name) == wanted)
    }

    pub fn find_buddy(&self, name: &str, group_id: u16) -> Option<&SsiItem> {
        let wanted = normalize_screen_name(name);
        self.items.iter().find(|item| {
            item.is_buddy()
                && item.group_id == group_id
                && normalize_screen_name(&item.name) == wanted
        })
    }

    /// Buddy names across all groups
    pub fn buddies(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.is_buddy())
            .map(|item| item.name.clone())
            .collect()
    }

    fn master_group(&self) -> Option<&SsiItem> {
        self.items.iter().find(|item| item.is_master_group())
    }

    fn unused_id(used: BTreeSet<u16>) -> Result<u16> {
        (1..=0x7fff)
            .find(|id| !used.contains(id))
            .ok_or_else(|| OwlchatError::invalid_argument("buddy list is full"))
    }

    /// Edits that add `name` to `group`, creating the group when missing
    ///
    /// The local mirror is updated immediately.
    pub fn plan_add_buddy(&mut self, name: &str, group: &str) -> Result<Vec<SsiEdit>> {
        let mut adds = Vec::new();
        let mut modifies = Vec::new();

        let group_item = match self.find_group(group) {
            Some(existing) => existing.clone(),
            None => {
                let used = self
                    .items
                    .iter()
                    .filter(|item| item.is_group())
                    .map(|item| item.group_id)
                    .collect();
                let group_id = Self::unused_id(used)?;
                let created = SsiItem::group(group, group_id, &[]);
                if let Some(master) = self.master_group() {
                    let mut master = master.clone();
                    let mut members = master.members();
                    members.push(group_id);
                    master.set_members(&members);
                    modifies.push(SsiEdit {
                        op: SsiOp::Modify,
                        item: master,
                    });
                }
                adds.push(SsiEdit {
                    op: SsiOp::Add,
                    item: created.clone(),
                });
                created
            }
        };

        if self.find_buddy(name, group_item.group_id).is_some() {
            return Err(OwlchatError::invalid_argument(format!(
                "{} is already in group {}",
                name, group
            )));
        }

        let used = self
            .items
            .iter()
            .filter(|item| item.group_id == group_item.group_id && !item.is_group())
            .map(|item| item.item_id)
            .collect();
        let item_id = Self::unused_id(used)?;
        adds.push(SsiEdit {
            op: SsiOp::Add,
            item: SsiItem::buddy(name, group_item.group_id, item_id),
        });

        let mut updated_group = group_item;
        let mut members = updated_group.members();
        members.push(item_id);
        updated_group.set_members(&members);
        modifies.push(SsiEdit {
            op: SsiOp::Modify,
            item: updated_group,
        });

        let edits: Vec<SsiEdit> = adds.into_iter().chain(modifies).collect();
        for edit in &edits {
            self.upsert(edit.item.clone());
        }
        Ok(edits)
    }

    /// Edits that remove `name` from `group`
    pub fn plan_remove_buddy(&mut self, name: &str, group: &str) -> Result<Vec<SsiEdit>> {
        let group_item = self.find_group(group).cloned().ok_or_else(|| {
            OwlchatError::invalid_argument(format!("no group named {}", group))
        })?;
        let buddy = self
            .find_buddy(name, group_item.group_id)
            .cloned()
            .ok_or_else(|| {
                OwlchatError::invalid_argument(format!("{} is not in group {}", name, group))
            })?;

        let mut updated_group = group_item;
        let members: Vec<u16> = updated_group
            .members()
            .into_iter()
            .filter(|id| *id != buddy.item_id)
            .collect();
        updated_group.set_members(&members);

        self.remove(&buddy);
        self.upsert(updated_group.clone());
        Ok(vec![
            SsiEdit {
                op: SsiOp::Delete,
                item: buddy,
            },
            SsiEdit {
                op: SsiOp::Modify,
                item: updated_group,
            },
        ])
    }
}
