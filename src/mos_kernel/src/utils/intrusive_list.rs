//! Intrusive circular doubly linked lists.
//!
//! A list never owns its elements. Each element embeds a cell holding an
//! optional [`Link`], and a list is accessed through [`ListAccessorCell`],
//! which bundles the head cell, a mapping from indices to elements, and the key
//! that unlocks the cells (a CPU Lock or IRQ Lock token). Kernel objects are
//! `'static`, so they are indexed by [`Ident`] through [`Static`].
use core::{convert::Infallible, fmt, ops};

/// The head of a circular list.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

/// The neighbors of a linked element. The back of a list is linked to its
/// front.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// Maps `Ident<&'static T>` to `T`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// A reference compared by address.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The pointee may contain this very list
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// The head of a list of `'static` objects.
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// The link embedded in a `'static` object.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// A cell whose contents can be read and written by presenting `Key`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    /// Update the contents in place. Implementors can avoid the copy.
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum InsertError<E> {
    AlreadyLinked,
    Inconsistent(E),
}

impl<E> From<E> for InsertError<E> {
    #[inline(always)]
    fn from(x: E) -> Self {
        Self::Inconsistent(x)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ItemError<E> {
    NotLinked,
    Inconsistent(E),
}

impl<E> From<E> for ItemError<E> {
    #[inline(always)]
    fn from(x: E) -> Self {
        Self::Inconsistent(x)
    }
}

/// The list structure was found broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconsistentError;

/// What a [`ListAccessorCell`] does when it finds a broken link.
pub trait OnInconsistency {
    type Error;

    fn error(&self) -> Self::Error;
}

/// Report a broken link as [`InconsistentError`].
pub struct Checked;

impl OnInconsistency for Checked {
    type Error = InconsistentError;

    #[inline(always)]
    fn error(&self) -> Self::Error {
        InconsistentError
    }
}

/// Assume there are no broken links. Obtained through
/// [`ListAccessorCell::unchecked`].
pub struct Unchecked {
    _private: (),
}

impl OnInconsistency for Unchecked {
    type Error = Infallible;

    #[inline(always)]
    fn error(&self) -> Self::Error {
        if cfg!(debug_assertions) {
            panic!("linked list is inconsistent");
        }
        // Safety: `ListAccessorCell::unchecked`'s caller guarantees the list
        //         is structurally sound
        unsafe { core::hint::unreachable_unchecked() }
    }
}

/// Accessor to a list whose head and links are stored in [`CellLike`] cells.
pub struct ListAccessorCell<'a, HeadCell, Pool: ?Sized, MapLink, CellKey, Handler = Checked> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    cell_key: CellKey,
    handler: Handler,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey, Checked>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element> + ?Sized,
    Element: ?Sized,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        Self {
            head,
            pool,
            map_link,
            cell_key,
            handler: Checked,
        }
    }

    /// Skip the consistency checks. Every operation's error type becomes
    /// `Infallible`.
    ///
    /// # Safety
    ///
    /// The list must be structurally sound. A broken link found by any
    /// operation is undefined behavior.
    pub unsafe fn unchecked(
        self,
    ) -> ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey, Unchecked> {
        ListAccessorCell {
            head: self.head,
            pool: self.pool,
            map_link: self.map_link,
            cell_key: self.cell_key,
            handler: Unchecked { _private: () },
        }
    }
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey, Handler>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey, Handler>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element> + ?Sized,
    Element: ?Sized,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
    Handler: OnInconsistency,
{
    fn link(&self, item: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[item]).get(&self.cell_key)
    }

    fn set_link(&mut self, item: Index, link: Option<Link<Index>>) {
        let pool = self.pool;
        (self.map_link)(&pool[item]).set(&mut self.cell_key, link);
    }

    /// Apply `f` to the link of `item`, which must be linked.
    fn update_link(
        &mut self,
        item: Index,
        f: impl FnOnce(&mut Link<Index>),
    ) -> Result<(), Handler::Error> {
        let pool = self.pool;
        let handler = &self.handler;
        (self.map_link)(&pool[item]).modify(&mut self.cell_key, |link| match link {
            Some(link) => {
                f(link);
                Ok(())
            }
            None => Err(handler.error()),
        })
    }

    fn set_first(&mut self, first: Option<Index>) {
        self.head.set(&mut self.cell_key, ListHead { first });
    }

    /// The key presented to the cells, which the caller can use to read other
    /// cells while the accessor is alive.
    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn is_empty(&self) -> bool {
        self.head.get(&self.cell_key).is_empty()
    }

    /// Return `true` if `item` is linked to *some* list using the same link
    /// cell. The caller must know which list that is.
    pub fn is_linked(&self, item: Index) -> bool {
        self.link(item).is_some()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head.get(&self.cell_key).first
    }

    #[inline]
    pub fn front_data(&self) -> Option<&'a Element> {
        let pool = self.pool;
        self.front().map(|item| &pool[item])
    }

    /// Get the element after `item`, or `None` if `item` is at the back.
    pub fn next(&self, item: Index) -> Result<Option<Index>, ItemError<Handler::Error>> {
        let next = self.link(item).ok_or(ItemError::NotLinked)?.next;
        Ok(Some(next).filter(|next| self.front().as_ref() != Some(next)))
    }

    /// Link `item` right before `before`, or at the back if `before` is
    /// `None`.
    pub fn insert(
        &mut self,
        item: Index,
        before: Option<Index>,
    ) -> Result<(), InsertError<Handler::Error>> {
        if self.is_linked(item.clone()) {
            return Err(InsertError::AlreadyLinked);
        }

        let Some(first) = self.front() else {
            debug_assert!(before.is_none());
            let link = Link {
                prev: item.clone(),
                next: item.clone(),
            };
            self.set_link(item.clone(), Some(link));
            self.set_first(Some(item));
            return Ok(());
        };

        let becomes_first = before.as_ref() == Some(&first);
        // The back is right before the front
        let next = before.unwrap_or(first);
        let prev = self.link(next.clone()).ok_or_else(|| self.handler.error())?.prev;

        self.update_link(prev.clone(), |link| link.next = item.clone())?;
        self.update_link(next.clone(), |link| link.prev = item.clone())?;
        self.set_link(item.clone(), Some(Link { prev, next }));

        if becomes_first {
            self.set_first(Some(item));
        }
        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) -> Result<(), InsertError<Handler::Error>> {
        self.insert(item, None)
    }

    /// Unlink `item` and return it.
    pub fn remove(&mut self, item: Index) -> Result<Index, ItemError<Handler::Error>> {
        let link = self.link(item.clone()).ok_or(ItemError::NotLinked)?;

        if self.front().as_ref() == Some(&item) {
            // `item` might be the only element
            let first = Some(link.next.clone()).filter(|next| *next != item);
            self.set_first(first);
        }

        self.update_link(link.prev.clone(), |l| l.next = link.next.clone())?;
        self.update_link(link.next.clone(), |l| l.prev = link.prev.clone())?;
        self.set_link(item.clone(), None);
        Ok(item)
    }

    /// Unlink and return the front element.
    pub fn pop_front(&mut self) -> Result<Option<Index>, Handler::Error> {
        let Some(first) = self.front() else {
            return Ok(None);
        };
        match self.remove(first) {
            Ok(item) => Ok(Some(item)),
            Err(ItemError::Inconsistent(e)) => Err(e),
            // The front is linked by definition
            Err(ItemError::NotLinked) => Err(self.handler.error()),
        }
    }

    /// Move `item` to the back of the list.
    pub fn move_to_back(&mut self, item: Index) -> Result<(), ItemError<Handler::Error>> {
        let link = self.link(item.clone()).ok_or(ItemError::NotLinked)?;

        if self.front().as_ref() == Some(&item) {
            // Rotate the circle
            self.set_first(Some(link.next));
            return Ok(());
        }

        let item = self.remove(item)?;
        self.push_back(item).map_err(|e| match e {
            InsertError::AlreadyLinked => ItemError::Inconsistent(self.handler.error()),
            InsertError::Inconsistent(e) => ItemError::Inconsistent(e),
        })
    }

    /// Iterate over the elements from front to back.
    pub fn iter(&self) -> Iter<'_, Self, Index> {
        Iter {
            accessor: self,
            cursor: self.front(),
        }
    }
}

/// An iterator over the elements of a list, created by
/// [`ListAccessorCell::iter`].
pub struct Iter<'b, Accessor, Index> {
    accessor: &'b Accessor,
    cursor: Option<Index>,
}

impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey, Handler> Iterator
    for Iter<'b, ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey, Handler>, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element> + ?Sized,
    Element: ?Sized + 'a,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
    Handler: OnInconsistency,
{
    type Item = Result<(Index, &'a Element), Handler::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.cursor.take()?;
        match self.accessor.next(item.clone()) {
            Ok(next) => self.cursor = next,
            Err(_) => return Some(Err(self.accessor.handler.error())),
        }
        let pool: &'a Pool = self.accessor.pool;
        Some(Ok((item.clone(), &pool[item])))
    }
}
