//! Intrusive doubly linked list whose links are segment-relative offsets.
//!
//! The list never stores an address. Every operation goes through a
//! [`LinkArena`], which turns an offset into whatever the caller's mapping
//! needs at the moment of access, so two processes that map the segment at
//! different addresses walk the same list.
//!
//! Lists are null terminated: [`NIL`] ends a chain in either direction.
//! A node on no list carries [`UNLINKED`] in both fields, which is how a
//! second removal of the same node is caught instead of silently unlinking
//! its former neighbours.

use crate::errors::{IpcError, Result};

pub type Offset = u64;

/// Chain terminator. Offset 0 is the segment header and never names a node.
pub const NIL: Offset = 0;

/// Marks a node that is not on any list.
pub const UNLINKED: Offset = u64::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub prev: Offset,
    pub next: Offset,
}

impl Link {
    pub const UNLINKED: Link = Link {
        prev: UNLINKED,
        next: UNLINKED,
    };

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.prev != UNLINKED && self.next != UNLINKED
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListHead {
    pub head: Offset,
    pub tail: Offset,
    pub len: u64,
}

/// Load/store access to links and list heads by offset.
///
/// Implemented by the locked segment view, and by plain in-memory arenas in
/// tests. Values are copied in and out so no reference into shared memory
/// outlives a single access.
pub trait LinkArena {
    fn load_link(&self, node: Offset) -> Result<Link>;
    fn store_link(&mut self, node: Offset, link: Link) -> Result<()>;
    fn load_head(&self, list: Offset) -> Result<ListHead>;
    fn store_head(&mut self, list: Offset, head: ListHead) -> Result<()>;
}

#[inline]
fn non_nil(offset: Offset) -> Option<Offset> {
    if offset == NIL {
        None
    } else {
        Some(offset)
    }
}

/// A list identified by the offset of its [`ListHead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrusiveList {
    at: Offset,
}

impl IntrusiveList {
    pub const fn at(at: Offset) -> IntrusiveList {
        IntrusiveList { at }
    }

    pub fn offset(self) -> Offset {
        self.at
    }

    pub fn init<A: LinkArena + ?Sized>(self, arena: &mut A) -> Result<()> {
        arena.store_head(self.at, ListHead::default())
    }

    pub fn len<A: LinkArena + ?Sized>(self, arena: &A) -> Result<u64> {
        Ok(arena.load_head(self.at)?.len)
    }

    pub fn front<A: LinkArena + ?Sized>(self, arena: &A) -> Result<Option<Offset>> {
        Ok(non_nil(arena.load_head(self.at)?.head))
    }

    pub fn next<A: LinkArena + ?Sized>(self, arena: &A, node: Offset) -> Result<Option<Offset>> {
        let link = arena.load_link(node)?;
        if !link.is_linked() {
            return Err(IpcError::NotLinked { offset: node });
        }
        Ok(non_nil(link.next))
    }

    pub fn insert_tail<A: LinkArena + ?Sized>(self, arena: &mut A, node: Offset) -> Result<()> {
        let head = arena.load_head(self.at)?;
        self.insert_between(arena, head, head.tail, NIL, node)
    }

    /// Links `node` right after `anchor`, or at the front when `anchor` is `None`.
    pub fn insert_after<A: LinkArena + ?Sized>(
        self,
        arena: &mut A,
        anchor: Option<Offset>,
        node: Offset,
    ) -> Result<()> {
        let head = arena.load_head(self.at)?;
        let (prev, next) = match anchor {
            None => (NIL, head.head),
            Some(anchor) => {
                let link = arena.load_link(anchor)?;
                if !link.is_linked() {
                    return Err(IpcError::NotLinked { offset: anchor });
                }
                (anchor, link.next)
            }
        };
        self.insert_between(arena, head, prev, next, node)
    }

    fn insert_between<A: LinkArena + ?Sized>(
        self,
        arena: &mut A,
        mut head: ListHead,
        prev: Offset,
        next: Offset,
        node: Offset,
    ) -> Result<()> {
        if node == NIL || node == UNLINKED {
            return Err(IpcError::corruption(node, "not a valid node offset"));
        }
        if arena.load_link(node)?.is_linked() {
            return Err(IpcError::corruption(node, "node is already linked"));
        }
        let prev_link = if prev == NIL { None } else { Some(arena.load_link(prev)?) };
        let next_link = if next == NIL { None } else { Some(arena.load_link(next)?) };

        arena.store_link(node, Link { prev, next })?;
        match prev_link {
            None => head.head = node,
            Some(mut link) => {
                link.next = node;
                arena.store_link(prev, link)?;
            }
        }
        match next_link {
            None => head.tail = node,
            Some(mut link) => {
                link.prev = node;
                arena.store_link(next, link)?;
            }
        }
        head.len += 1;
        arena.store_head(self.at, head)
    }

    pub fn remove_head<A: LinkArena + ?Sized>(self, arena: &mut A) -> Result<Option<Offset>> {
        let head = arena.load_head(self.at)?;
        match non_nil(head.head) {
            None if head.len != 0 => Err(IpcError::corruption(
                self.at,
                format!("empty list reports {} nodes", head.len),
            )),
            None => Ok(None),
            Some(node) => {
                self.remove(arena, node)?;
                Ok(Some(node))
            }
        }
    }

    pub fn remove<A: LinkArena + ?Sized>(self, arena: &mut A, node: Offset) -> Result<()> {
        let link = arena.load_link(node)?;
        if !link.is_linked() {
            return Err(IpcError::NotLinked { offset: node });
        }
        let mut head = arena.load_head(self.at)?;

        // Validate every neighbour before touching anything.
        let prev_link = if link.prev == NIL {
            if head.head != node {
                return Err(IpcError::corruption(node, "first node is not the list head"));
            }
            None
        } else {
            let prev = arena.load_link(link.prev)?;
            if prev.next != node {
                return Err(IpcError::corruption(link.prev, "forward link does not match"));
            }
            Some(prev)
        };
        let next_link = if link.next == NIL {
            if head.tail != node {
                return Err(IpcError::corruption(node, "last node is not the list tail"));
            }
            None
        } else {
            let next = arena.load_link(link.next)?;
            if next.prev != node {
                return Err(IpcError::corruption(link.next, "back link does not match"));
            }
            Some(next)
        };
        if head.len == 0 {
            return Err(IpcError::corruption(self.at, "list length underflow"));
        }

        match prev_link {
            None => head.head = link.next,
            Some(mut prev) => {
                prev.next = link.next;
                arena.store_link(link.prev, prev)?;
            }
        }
        match next_link {
            None => head.tail = link.prev,
            Some(mut next) => {
                next.prev = link.prev;
                arena.store_link(link.next, next)?;
            }
        }
        head.len -= 1;
        arena.store_head(self.at, head)?;
        arena.store_link(node, Link::UNLINKED)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct MapArena {
        links: HashMap<Offset, Link>,
        heads: HashMap<Offset, ListHead>,
    }

    impl MapArena {
        fn with_nodes(nodes: &[Offset]) -> MapArena {
            let mut arena = MapArena::default();
            for &node in nodes {
                arena.links.insert(node, Link::UNLINKED);
            }
            arena
        }
    }

    impl LinkArena for MapArena {
        fn load_link(&self, node: Offset) -> Result<Link> {
            self.links
                .get(&node)
                .copied()
                .ok_or_else(|| IpcError::corruption(node, "no such node"))
        }

        fn store_link(&mut self, node: Offset, link: Link) -> Result<()> {
            self.links.insert(node, link);
            Ok(())
        }

        fn load_head(&self, list: Offset) -> Result<ListHead> {
            self.heads
                .get(&list)
                .copied()
                .ok_or_else(|| IpcError::corruption(list, "no such list"))
        }

        fn store_head(&mut self, list: Offset, head: ListHead) -> Result<()> {
            self.heads.insert(list, head);
            Ok(())
        }
    }

    const LIST: IntrusiveList = IntrusiveList::at(8);

    fn drain(arena: &mut MapArena, list: IntrusiveList) -> Vec<Offset> {
        let mut out = Vec::new();
        while let Some(node) = list.remove_head(arena).unwrap() {
            out.push(node);
        }
        out
    }

    #[test]
    fn fifo_order() {
        let mut arena = MapArena::with_nodes(&[100, 200, 300]);
        LIST.init(&mut arena).unwrap();
        for node in [100, 200, 300] {
            LIST.insert_tail(&mut arena, node).unwrap();
        }
        assert_eq!(LIST.len(&arena).unwrap(), 3);
        assert_eq!(drain(&mut arena, LIST), vec![100, 200, 300]);
        assert_eq!(LIST.len(&arena).unwrap(), 0);
        assert_eq!(LIST.remove_head(&mut arena).unwrap(), None);
    }

    #[test]
    fn remove_middle_keeps_neighbours() {
        let mut arena = MapArena::with_nodes(&[100, 200, 300]);
        LIST.init(&mut arena).unwrap();
        for node in [100, 200, 300] {
            LIST.insert_tail(&mut arena, node).unwrap();
        }
        LIST.remove(&mut arena, 200).unwrap();
        assert_eq!(arena.links[&200], Link::UNLINKED);
        assert_eq!(LIST.next(&arena, 100).unwrap(), Some(300));
        assert_eq!(drain(&mut arena, LIST), vec![100, 300]);
    }

    #[test]
    fn double_remove_is_detected() {
        let mut arena = MapArena::with_nodes(&[100, 200]);
        LIST.init(&mut arena).unwrap();
        LIST.insert_tail(&mut arena, 100).unwrap();
        LIST.insert_tail(&mut arena, 200).unwrap();
        LIST.remove(&mut arena, 100).unwrap();
        assert!(matches!(
            LIST.remove(&mut arena, 100),
            Err(IpcError::NotLinked { offset: 100 })
        ));
        assert_eq!(LIST.len(&arena).unwrap(), 1);
        assert_eq!(LIST.front(&arena).unwrap(), Some(200));
    }

    #[test]
    fn linking_twice_is_rejected() {
        let mut arena = MapArena::with_nodes(&[100]);
        LIST.init(&mut arena).unwrap();
        LIST.insert_tail(&mut arena, 100).unwrap();
        assert!(matches!(
            LIST.insert_tail(&mut arena, 100),
            Err(IpcError::Corruption { offset: 100, .. })
        ));
        assert_eq!(LIST.len(&arena).unwrap(), 1);
    }

    #[test]
    fn insert_after_orders_nodes() {
        let mut arena = MapArena::with_nodes(&[100, 200, 300, 400]);
        LIST.init(&mut arena).unwrap();
        LIST.insert_after(&mut arena, None, 300).unwrap();
        LIST.insert_after(&mut arena, None, 100).unwrap();
        LIST.insert_after(&mut arena, Some(100), 200).unwrap();
        LIST.insert_after(&mut arena, Some(300), 400).unwrap();
        assert_eq!(drain(&mut arena, LIST), vec![100, 200, 300, 400]);
    }

    #[test]
    fn removing_from_the_wrong_list_is_corruption() {
        let other = IntrusiveList::at(16);
        let mut arena = MapArena::with_nodes(&[100, 200]);
        LIST.init(&mut arena).unwrap();
        other.init(&mut arena).unwrap();
        LIST.insert_tail(&mut arena, 100).unwrap();
        other.insert_tail(&mut arena, 200).unwrap();
        assert!(matches!(
            LIST.remove(&mut arena, 200),
            Err(IpcError::Corruption { .. })
        ));
        assert_eq!(other.len(&arena).unwrap(), 1);
    }
}
