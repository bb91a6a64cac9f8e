use std::collections::HashSet;

use tether_gateway::{Peer, UserId};

/// Cached list of conversation partners and who is currently online.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Vec<Peer>,
    loading: bool,
    online: HashSet<UserId>,
}

impl PeerDirectory {
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn begin_load(&mut self) {
        self.loading = true;
    }

    /// Ends a load. A failed load keeps the previous list.
    pub fn finish_load(&mut self, peers: Option<Vec<Peer>>) {
        self.loading = false;
        if let Some(peers) = peers {
            self.peers = peers;
        }
    }

    pub fn find(&self, peer_id: &UserId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.id == *peer_id)
    }

    /// Case-insensitive substring match on the display name. A blank query matches everyone.
    pub fn search(&self, query: &str) -> Vec<&Peer> {
        self.filter(query, false)
    }

    /// [`Self::search`], optionally narrowed to peers that are online.
    pub fn filter(&self, query: &str, online_only: bool) -> Vec<&Peer> {
        let needle = query.trim().to_lowercase();
        self.peers
            .iter()
            .filter(|peer| !online_only || self.online.contains(&peer.id))
            .filter(|peer| needle.is_empty() || peer.full_name.to_lowercase().contains(&needle))
            .collect()
    }

    /// Replaces the presence set with a fresh snapshot.
    pub fn set_online(&mut self, users: impl IntoIterator<Item = UserId>) {
        self.online = users.into_iter().collect();
    }

    pub fn is_online(&self, peer_id: &UserId) -> bool {
        self.online.contains(peer_id)
    }

    /// Listed peers that are online. Users outside the directory are not counted.
    pub fn online_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|peer| self.online.contains(&peer.id))
            .count()
    }
}
