//! Registry of running torrent downloads

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::peer::PeerStorage;
use crate::group::context::DownloadContextHandle;
use crate::types::GroupId;

/// Runtime objects of one torrent download
#[derive(Debug, Clone)]
pub struct BtObject {
    pub download_context: DownloadContextHandle,
    pub peer_storage: Rc<RefCell<PeerStorage>>,
}

impl BtObject {
    pub fn new(download_context: DownloadContextHandle) -> Self {
        Self {
            download_context,
            peer_storage: Rc::new(RefCell::new(PeerStorage::new())),
        }
    }
}

/// Torrent downloads keyed by their group
#[derive(Debug, Default)]
pub struct BtRegistry {
    objects: HashMap<GroupId, BtObject>,
}

impl BtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, gid: GroupId, object: BtObject) {
        self.objects.insert(gid, object);
    }

    pub fn get(&self, gid: GroupId) -> Option<&BtObject> {
        self.objects.get(&gid)
    }

    pub fn get_download_context(&self, gid: GroupId) -> Option<DownloadContextHandle> {
        self.objects
            .get(&gid)
            .map(|o| Rc::clone(&o.download_context))
    }

    /// The download with this info hash
    pub fn get_download_context_by_info_hash(
        &self,
        info_hash: &[u8; 20],
    ) -> Option<DownloadContextHandle> {
        self.objects
            .values()
            .find(|o| o.download_context.borrow().info_hash() == Some(info_hash))
            .map(|o| Rc::clone(&o.download_context))
    }

    pub fn get_all_download_context(&self) -> Vec<DownloadContextHandle> {
        self.objects
            .values()
            .map(|o| Rc::clone(&o.download_context))
            .collect()
    }

    /// True if there was an entry
    pub fn remove(&mut self, gid: GroupId) -> bool {
        self.objects.remove(&gid).is_some()
    }

    pub fn remove_all(&mut self) {
        self.objects.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::context::{DownloadContext, TorrentAttributes};

    fn gid(n: u64) -> GroupId {
        GroupId::from_raw(n).unwrap()
    }

    fn add_two(registry: &mut BtRegistry) {
        for n in 1..=2 {
            let ctx = DownloadContext::new(1024, vec![("f".into(), 10)]).into_handle();
            registry.put(gid(n), BtObject::new(ctx));
        }
    }

    #[test]
    fn test_get_download_context() {
        let mut registry = BtRegistry::new();
        assert!(registry.get_download_context(gid(1)).is_none());
        let ctx = DownloadContext::new(1024, Vec::new()).into_handle();
        registry.put(gid(1), BtObject::new(Rc::clone(&ctx)));
        assert!(Rc::ptr_eq(
            &registry.get_download_context(gid(1)).unwrap(),
            &ctx
        ));
    }

    #[test]
    fn test_get_download_context_by_info_hash() {
        let mut registry = BtRegistry::new();
        add_two(&mut registry);
        for (n, hash) in [(1, [1u8; 20]), (2, [2u8; 20])] {
            registry
                .get_download_context(gid(n))
                .unwrap()
                .borrow_mut()
                .set_torrent(TorrentAttributes {
                    info_hash: hash,
                    ..Default::default()
                });
        }
        let found = registry.get_download_context_by_info_hash(&[1u8; 20]).unwrap();
        assert!(Rc::ptr_eq(
            &found,
            &registry.get_download_context(gid(1)).unwrap()
        ));
        assert!(registry.get_download_context_by_info_hash(&[9u8; 20]).is_none());
    }

    #[test]
    fn test_get_all_download_context() {
        let mut registry = BtRegistry::new();
        add_two(&mut registry);
        assert_eq!(registry.get_all_download_context().len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut registry = BtRegistry::new();
        add_two(&mut registry);
        assert!(registry.remove(gid(1)));
        assert!(!registry.remove(gid(1)));
        assert!(registry.get(gid(1)).is_none());
        assert!(registry.get(gid(2)).is_some());
    }

    #[test]
    fn test_remove_all() {
        let mut registry = BtRegistry::new();
        add_two(&mut registry);
        registry.remove_all();
        assert!(registry.get(gid(1)).is_none());
        assert!(registry.get(gid(2)).is_none());
        assert!(registry.is_empty());
    }
}
