use std::collections::HashMap;
use std::sync::RwLock;

/// Compute the vnode a user maps to.
///
/// Takes the first 32 bits of the MD5 digest of the UTF-8 bytes of
/// `user_id`, interpreted big-endian, modulo `vnode_count`. The digest
/// choice is load-bearing: every cached user→instance mapping and every
/// assigned-vnode list in flight assumes this exact bucket function.
pub fn user_vnode(user_id: &str, vnode_count: u32) -> u32 {
    let digest = md5::compute(user_id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % vnode_count
}

/// In-memory replica of the vnode→instance ownership map.
///
/// Reads happen on every connection and every routing query; writes only on
/// ownership changes, as merges ingested from the directory. The map is
/// small (one entry per assigned vnode), so a single `RwLock` is enough.
pub struct HashRing {
    vnode_count: u32,
    owners: RwLock<HashMap<u32, String>>,
}

impl HashRing {
    pub fn new(vnode_count: u32) -> Self {
        Self {
            vnode_count,
            owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn vnode_count(&self) -> u32 {
        self.vnode_count
    }

    /// The vnode for a user under this ring's configured vnode count.
    pub fn vnode_for(&self, user_id: &str) -> u32 {
        user_vnode(user_id, self.vnode_count)
    }

    pub fn owner_of(&self, vnode: u32) -> Option<String> {
        self.owners.read().unwrap().get(&vnode).cloned()
    }

    /// Merge a partial ownership map into the ring. Entries not present in
    /// `mappings` are left untouched; this is a merge, never a replace.
    pub fn update_mappings(&self, mappings: &HashMap<u32, String>) {
        if mappings.is_empty() {
            return;
        }
        let mut owners = self.owners.write().unwrap();
        for (vnode, instance) in mappings {
            owners.insert(*vnode, instance.clone());
        }
    }

    pub fn remove_vnodes(&self, vnodes: &[u32]) {
        if vnodes.is_empty() {
            return;
        }
        let mut owners = self.owners.write().unwrap();
        for vnode in vnodes {
            owners.remove(vnode);
        }
    }

    /// Copy of the current ownership map, for cache serving.
    pub fn snapshot(&self) -> HashMap<u32, String> {
        self.owners.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.owners.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.read().unwrap().is_empty()
    }
}
