//! Sticky, least-loaded assignment of public connections to transfer links.

use std::collections::{BTreeMap, HashMap};

use rand::seq::SliceRandom;

use crate::id::{ConnectionId, LinkId};
use crate::transport::socket::SocketHandle;

#[derive(Debug, Default)]
pub struct Router {
    links: BTreeMap<LinkId, SocketHandle>,
    assignments: HashMap<ConnectionId, LinkId>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_link(&mut self, id: LinkId, socket: SocketHandle) {
        self.links.insert(id, socket);
    }

    /// Remove a link and every assignment pointing at it.
    ///
    /// Returns the connections that were routed through it, or `None` if the
    /// link was not registered.
    pub fn unregister_link(&mut self, id: &LinkId) -> Option<Vec<ConnectionId>> {
        self.links.remove(id)?;
        let orphans: Vec<ConnectionId> = self
            .assignments
            .iter()
            .filter(|(_, link)| *link == id)
            .map(|(conn, _)| conn.clone())
            .collect();
        for conn in &orphans {
            self.assignments.remove(conn);
        }
        Some(orphans)
    }

    pub fn has_links(&self) -> bool {
        !self.links.is_empty()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn links(&self) -> impl Iterator<Item = (&LinkId, &SocketHandle)> {
        self.links.iter()
    }

    /// Link for `conn`, choosing one on first use.
    ///
    /// A new connection goes to a link with the fewest connections, picked
    /// uniformly among ties. Returns `None` when no link is registered.
    pub fn assign(&mut self, conn: &ConnectionId) -> Option<LinkId> {
        if let Some(link) = self.assignments.get(conn) {
            return Some(link.clone());
        }

        let mut loads: BTreeMap<&LinkId, usize> = self.links.keys().map(|id| (id, 0)).collect();
        for link in self.assignments.values() {
            if let Some(load) = loads.get_mut(link) {
                *load += 1;
            }
        }
        let min = loads.values().copied().min()?;
        let candidates: Vec<&LinkId> = loads
            .iter()
            .filter(|(_, load)| **load == min)
            .map(|(id, _)| *id)
            .collect();
        let chosen = candidates
            .choose(&mut rand::thread_rng())
            .map(|id| (*id).clone())?;

        self.assignments.insert(conn.clone(), chosen.clone());
        Some(chosen)
    }

    pub fn assigned(&self, conn: &ConnectionId) -> Option<&LinkId> {
        self.assignments.get(conn)
    }

    /// Socket of the link `conn` is routed to, without assigning.
    pub fn route(&self, conn: &ConnectionId) -> Option<&SocketHandle> {
        self.assignments
            .get(conn)
            .and_then(|link| self.links.get(link))
    }

    pub fn release(&mut self, conn: &ConnectionId) -> Option<LinkId> {
        self.assignments.remove(conn)
    }

    pub fn load(&self, link: &LinkId) -> usize {
        self.assignments.values().filter(|l| *l == link).count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn router_with(links: &[&str]) -> Router {
        let mut router = Router::new();
        for link in links {
            let (socket, _rx) = SocketHandle::channel();
            router.register_link(LinkId::from(*link), socket);
        }
        router
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test]
    fn test_assign_without_links() {
        let mut router = Router::new();
        assert_eq!(router.assign(&conn("c_1")), None);
        assert!(router.assigned(&conn("c_1")).is_none());
    }

    #[test]
    fn test_assignment_is_sticky() {
        let mut router = router_with(&["i_a", "i_b", "i_c"]);
        let first = router.assign(&conn("c_1")).unwrap();

        for i in 0..20 {
            router.assign(&conn(&format!("c_other_{i}")));
            assert_eq!(router.assign(&conn("c_1")), Some(first.clone()));
        }
        assert_eq!(router.assigned(&conn("c_1")), Some(&first));
    }

    #[test]
    fn test_least_loaded_link_wins() {
        let mut router = router_with(&["i_a", "i_b"]);
        router.assignments.insert(conn("c_1"), LinkId::from("i_a"));
        router.assignments.insert(conn("c_2"), LinkId::from("i_a"));
        router.assignments.insert(conn("c_3"), LinkId::from("i_b"));
        router.assignments.insert(conn("c_4"), LinkId::from("i_b"));
        let (socket, _rx) = SocketHandle::channel();
        router.register_link(LinkId::from("i_c"), socket);

        assert_eq!(router.assign(&conn("c_5")), Some(LinkId::from("i_c")));
        assert_eq!(router.load(&LinkId::from("i_c")), 1);
    }

    #[test]
    fn test_ties_are_spread_across_all_tied_links() {
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let mut router = router_with(&["i_a", "i_b", "i_c"]);
            seen.insert(router.assign(&conn("c_1")).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_loads_stay_balanced() {
        let mut router = router_with(&["i_a", "i_b", "i_c"]);
        for i in 0..30 {
            router.assign(&conn(&format!("c_{i}")));
        }
        for link in ["i_a", "i_b", "i_c"] {
            assert_eq!(router.load(&LinkId::from(link)), 10);
        }
    }

    #[test]
    fn test_unregister_link_returns_orphans() {
        let mut router = router_with(&["i_l", "i_m"]);
        router.assignments.insert(conn("c_x"), LinkId::from("i_l"));
        router.assignments.insert(conn("c_y"), LinkId::from("i_l"));
        router.assignments.insert(conn("c_z"), LinkId::from("i_m"));

        let mut orphans = router.unregister_link(&LinkId::from("i_l")).unwrap();
        orphans.sort();
        assert_eq!(orphans, vec![conn("c_x"), conn("c_y")]);
        assert!(router.assigned(&conn("c_x")).is_none());
        assert_eq!(router.assigned(&conn("c_z")), Some(&LinkId::from("i_m")));
        assert!(router.unregister_link(&LinkId::from("i_l")).is_none());
        assert_eq!(router.link_count(), 1);
    }

    #[test]
    fn test_route_and_release() {
        let mut router = router_with(&["i_a"]);
        assert!(router.route(&conn("c_1")).is_none());
        router.assign(&conn("c_1"));
        assert!(router.route(&conn("c_1")).is_some());
        assert_eq!(router.release(&conn("c_1")), Some(LinkId::from("i_a")));
        assert!(router.route(&conn("c_1")).is_none());
    }
}
