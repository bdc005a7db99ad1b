//! Index-linked list nodes for the per-run-length free lists.
//!
//! A run length `L` owns one circular list. Its head lives in
//! [`FreeListHeads`](super::small_pages::FreeListHeads) and every group that
//! currently has a free run of at least `L` pages is threaded into it through
//! its own node for `L`. Links name the owning group by index, never by
//! pointer, so the group storage may grow without invalidating anything.

/// Handle to the owner of a [`PageListNode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Link {
    /// The list head for this run length.
    Head,
    /// A small allocation group, by index.
    Group(u32),
}

/// Free-list entry for one run length inside one group, doubling as the
/// allocated-run record for the page with the same index.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PageListNode {
    next: Link,
    prev: Link,
    owner: Link,
    /// First page of the free run this node advertises.
    available_page: u16,
    /// Nonzero only on the first page of an allocated run.
    allocated_page_count: u16,
}

impl PageListNode {
    /// A node owned by `owner`, not a member of any list.
    pub(crate) const fn new(owner: Link) -> Self {
        Self {
            next: owner,
            prev: owner,
            owner,
            available_page: 0,
            allocated_page_count: 0,
        }
    }

    #[inline]
    pub(crate) fn next(&self) -> Link {
        self.next
    }

    #[inline]
    pub(crate) fn prev(&self) -> Link {
        self.prev
    }

    #[inline]
    pub(crate) fn set_next(&mut self, next: Link) {
        self.next = next;
    }

    #[inline]
    pub(crate) fn set_prev(&mut self, prev: Link) {
        self.prev = prev;
    }

    /// True while the node is a member of a circular list. For a head this
    /// means the list is non-empty.
    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.next != self.owner
    }

    /// Drop both neighbour references, leaving the node unlinked. The
    /// neighbours themselves are patched by the owning list storage.
    #[inline]
    pub(crate) fn reset_links(&mut self) {
        self.next = self.owner;
        self.prev = self.owner;
    }

    #[inline]
    pub(crate) fn available_page(&self) -> usize {
        usize::from(self.available_page)
    }

    #[inline]
    pub(crate) fn set_available_page(&mut self, page: usize) {
        debug_assert!(page < super::small_pages::PAGES_PER_GROUP);
        self.available_page = u16::try_from(page).unwrap_or(u16::MAX);
    }

    #[inline]
    pub(crate) fn allocated_page_count(&self) -> usize {
        usize::from(self.allocated_page_count)
    }

    #[inline]
    pub(crate) fn set_allocated_page_count(&mut self, count: usize) {
        debug_assert!(count <= super::small_pages::PAGES_PER_GROUP);
        self.allocated_page_count = u16::try_from(count).unwrap_or(u16::MAX);
    }
}

/// Storage that can resolve a [`Link`] to the node it names for a given run
/// length. Implemented by the small page allocator, which owns both the list
/// heads and the groups.
pub(crate) trait NodeStore {
    fn node(&self, at: Link, run: usize) -> &PageListNode;
    fn node_mut(&mut self, at: Link, run: usize) -> &mut PageListNode;

    /// Insert `at` immediately before `before` in `before`'s circular list.
    fn link_before(&mut self, at: Link, before: Link, run: usize) {
        debug_assert!(
            !self.node(at, run).is_linked(),
            "{at:?} is already linked for run {run}"
        );
        let prev = self.node(before, run).prev();

        let node = self.node_mut(at, run);
        node.set_next(before);
        node.set_prev(prev);

        self.node_mut(prev, run).set_next(at);
        self.node_mut(before, run).set_prev(at);
    }

    /// Remove `at` from whichever list holds it and reset it to unlinked.
    fn unlink(&mut self, at: Link, run: usize) {
        let node = self.node(at, run);
        debug_assert!(node.is_linked(), "{at:?} is not linked for run {run}");
        let (prev, next) = (node.prev(), node.next());

        self.node_mut(prev, run).set_next(next);
        self.node_mut(next, run).set_prev(prev);
        self.node_mut(at, run).reset_links();
    }
}
