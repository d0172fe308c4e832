//! Lazily loaded association collections.
//!
//! A collection returned for a lazy to-many association starts
//! [`Uninitialized`](CollectionState::Uninitialized) and holds a
//! [`CollectionLoader`]. The first operation that reads or mutates the
//! collection runs the loader exactly once; afterwards the collection behaves
//! like its plain backing vector. A collection that is never touched never
//! calls its loader.
//!
//! Handles are cheap to clone and share state: a clone taken from a domain
//! object observes (and triggers) the same initialization.
//!
//! Dirtiness is tracked independently of initialization. Loading does not
//! make a collection dirty; any successful mutation does.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CollectionError, CollectionResult};
use crate::object::{same_object, ObjectRef};

/// Produces the elements of a lazy collection on first access.
pub trait CollectionLoader: Send + Sync {
    fn load(&self) -> CollectionResult<Vec<ObjectRef>>;
}

/// Initialization state of a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionState {
    Uninitialized,
    Initializing,
    Initialized,
}

/// Whether a collection association keeps duplicates and order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CollectionKind {
    List,
    Set,
}

struct Elements {
    state: CollectionState,
    items: Vec<ObjectRef>,
}

/// State shared by every handle of one collection.
struct Shared {
    elements: Mutex<Elements>,
    loader: Option<Arc<dyn CollectionLoader>>,
    dirty: AtomicBool,
    unique: bool,
}

impl Shared {
    fn loaded(items: Vec<ObjectRef>, unique: bool) -> Self {
        let items = if unique { dedup(items) } else { items };
        Self {
            elements: Mutex::new(Elements {
                state: CollectionState::Initialized,
                items,
            }),
            loader: None,
            dirty: AtomicBool::new(false),
            unique,
        }
    }

    fn lazy(loader: Arc<dyn CollectionLoader>, unique: bool) -> Self {
        Self {
            elements: Mutex::new(Elements {
                state: CollectionState::Uninitialized,
                items: Vec::new(),
            }),
            loader: Some(loader),
            dirty: AtomicBool::new(false),
            unique,
        }
    }

    fn lock(&self) -> CollectionResult<MutexGuard<'_, Elements>> {
        self.elements
            .lock()
            .map_err(|e| CollectionError::LockPoisoned(e.to_string()))
    }

    fn state(&self) -> CollectionResult<CollectionState> {
        Ok(self.lock()?.state)
    }

    fn ensure_initialized(&self) -> CollectionResult<()> {
        {
            let mut elements = self.lock()?;
            match elements.state {
                CollectionState::Initialized => return Ok(()),
                CollectionState::Initializing => {
                    return Err(CollectionError::InitializationInProgress)
                }
                CollectionState::Uninitialized => elements.state = CollectionState::Initializing,
            }
        }

        // The loader runs without the lock held; it calls back into the
        // session and may touch other collections.
        let loaded = match &self.loader {
            Some(loader) => loader.load(),
            None => Ok(Vec::new()),
        };

        let mut elements = self.lock()?;
        match loaded {
            Ok(items) => {
                for item in items {
                    if !self.unique || !elements.items.iter().any(|e| same_object(e, &item)) {
                        elements.items.push(item);
                    }
                }
                elements.state = CollectionState::Initialized;
                Ok(())
            }
            Err(err) => {
                elements.state = CollectionState::Uninitialized;
                Err(err)
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&[ObjectRef]) -> R) -> CollectionResult<R> {
        self.ensure_initialized()?;
        let elements = self.lock()?;
        Ok(f(&elements.items))
    }

    /// Mutate the elements; `f` reports whether anything changed.
    fn write<R>(&self, f: impl FnOnce(&mut Vec<ObjectRef>) -> (R, bool)) -> CollectionResult<R> {
        self.ensure_initialized()?;
        let mut elements = self.lock()?;
        let (result, changed) = f(&mut elements.items);
        if changed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    fn loaded_elements(&self) -> CollectionResult<Option<Vec<ObjectRef>>> {
        let elements = self.lock()?;
        Ok(match elements.state {
            CollectionState::Initialized => Some(elements.items.clone()),
            _ => None,
        })
    }

    fn loaded_len(&self) -> Option<usize> {
        let elements = self.elements.lock().ok()?;
        (elements.state == CollectionState::Initialized).then_some(elements.items.len())
    }
}

fn dedup(items: Vec<ObjectRef>) -> Vec<ObjectRef> {
    let mut out: Vec<ObjectRef> = Vec::with_capacity(items.len());
    for item in items {
        if !out.iter().any(|e| same_object(e, &item)) {
            out.push(item);
        }
    }
    out
}

fn position(items: &[ObjectRef], object: &ObjectRef) -> Option<usize> {
    items.iter().position(|e| same_object(e, object))
}

fn fmt_elements(f: &mut fmt::Formatter<'_>, shared: &Shared) -> fmt::Result {
    let count = shared.read(<[ObjectRef]>::len).map_err(|_| fmt::Error)?;
    write!(f, "[{count} element")?;
    if count != 1 {
        f.write_str("s")?;
    }
    f.write_str("]")
}

// ---------------------------------------------------------------
// PersistentList
// ---------------------------------------------------------------

/// Ordered association collection.
///
/// Every accessor initializes the list first and therefore returns a
/// [`CollectionResult`].
#[derive(Clone)]
pub struct PersistentList {
    shared: Arc<Shared>,
}

impl PersistentList {
    /// An empty, initialized list.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// An initialized list holding `items`.
    pub fn from_vec(items: Vec<ObjectRef>) -> Self {
        Self {
            shared: Arc::new(Shared::loaded(items, false)),
        }
    }

    /// An uninitialized list that calls `loader` on first access.
    pub fn lazy(loader: Arc<dyn CollectionLoader>) -> Self {
        Self {
            shared: Arc::new(Shared::lazy(loader, false)),
        }
    }

    pub fn state(&self) -> CollectionResult<CollectionState> {
        self.shared.state()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.shared.state(), Ok(CollectionState::Initialized))
    }

    /// Force initialization without otherwise touching the list.
    pub fn initialize(&self) -> CollectionResult<()> {
        self.shared.ensure_initialized()
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.dirty.load(Ordering::SeqCst)
    }

    pub fn reset_dirty(&self) {
        self.shared.dirty.store(false, Ordering::SeqCst);
    }

    /// The elements if the list is already initialized, without loading it.
    pub fn loaded_elements(&self) -> CollectionResult<Option<Vec<ObjectRef>>> {
        self.shared.loaded_elements()
    }

    pub fn len(&self) -> CollectionResult<usize> {
        self.shared.read(<[ObjectRef]>::len)
    }

    pub fn is_empty(&self) -> CollectionResult<bool> {
        self.shared.read(<[ObjectRef]>::is_empty)
    }

    pub fn get(&self, index: usize) -> CollectionResult<Option<ObjectRef>> {
        self.shared.read(|items| items.get(index).cloned())
    }

    pub fn contains(&self, object: &ObjectRef) -> CollectionResult<bool> {
        self.shared.read(|items| position(items, object).is_some())
    }

    pub fn index_of(&self, object: &ObjectRef) -> CollectionResult<Option<usize>> {
        self.shared.read(|items| position(items, object))
    }

    pub fn last_index_of(&self, object: &ObjectRef) -> CollectionResult<Option<usize>> {
        self.shared
            .read(|items| items.iter().rposition(|e| same_object(e, object)))
    }

    pub fn push(&self, object: ObjectRef) -> CollectionResult<()> {
        self.shared.write(|items| {
            items.push(object);
            ((), true)
        })
    }

    pub fn insert(&self, index: usize, object: ObjectRef) -> CollectionResult<()> {
        self.shared
            .write(|items| {
                if index > items.len() {
                    return (
                        Err(CollectionError::IndexOutOfBounds {
                            index,
                            len: items.len(),
                        }),
                        false,
                    );
                }
                items.insert(index, object);
                (Ok(()), true)
            })
            .and_then(|r| r)
    }

    /// Replace the element at `index`, returning the previous one.
    pub fn set(&self, index: usize, object: ObjectRef) -> CollectionResult<ObjectRef> {
        self.shared
            .write(|items| match items.get_mut(index) {
                Some(slot) => (Ok(std::mem::replace(slot, object)), true),
                None => (
                    Err(CollectionError::IndexOutOfBounds {
                        index,
                        len: items.len(),
                    }),
                    false,
                ),
            })
            .and_then(|r| r)
    }

    pub fn remove(&self, index: usize) -> CollectionResult<Option<ObjectRef>> {
        self.shared.write(|items| {
            if index < items.len() {
                (Some(items.remove(index)), true)
            } else {
                (None, false)
            }
        })
    }

    /// Remove the first occurrence of `object`. Returns `true` if found.
    pub fn remove_item(&self, object: &ObjectRef) -> CollectionResult<bool> {
        self.shared.write(|items| match position(items, object) {
            Some(i) => {
                items.remove(i);
                (true, true)
            }
            None => (false, false),
        })
    }

    pub fn extend(&self, objects: impl IntoIterator<Item = ObjectRef>) -> CollectionResult<()> {
        let objects: Vec<ObjectRef> = objects.into_iter().collect();
        self.shared.write(|items| {
            let changed = !objects.is_empty();
            items.extend(objects);
            ((), changed)
        })
    }

    pub fn clear(&self) -> CollectionResult<()> {
        self.shared.write(|items| {
            let changed = !items.is_empty();
            items.clear();
            ((), changed)
        })
    }

    /// Snapshot of the elements.
    pub fn to_vec(&self) -> CollectionResult<Vec<ObjectRef>> {
        self.shared.read(<[ObjectRef]>::to_vec)
    }

    /// Iterate over a snapshot of the elements.
    pub fn iter(&self) -> CollectionResult<std::vec::IntoIter<ObjectRef>> {
        Ok(self.to_vec()?.into_iter())
    }

    /// A new, independent, initialized list with the same elements.
    pub fn detached_copy(&self) -> CollectionResult<Self> {
        Ok(Self::from_vec(self.to_vec()?))
    }

    /// Element-wise identity comparison; initializes both lists.
    pub fn content_eq(&self, other: &Self) -> CollectionResult<bool> {
        let mine = self.to_vec()?;
        let theirs = other.to_vec()?;
        Ok(mine.len() == theirs.len()
            && mine.iter().zip(&theirs).all(|(a, b)| same_object(a, b)))
    }
}

impl Default for PersistentList {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<ObjectRef>> for PersistentList {
    fn from(items: Vec<ObjectRef>) -> Self {
        Self::from_vec(items)
    }
}

impl fmt::Display for PersistentList {
    /// Initializes the list.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PersistentList")?;
        fmt_elements(f, &self.shared)
    }
}

impl fmt::Debug for PersistentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentList")
            .field("state", &self.shared.state().ok())
            .field("len", &self.shared.loaded_len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

// ---------------------------------------------------------------
// PersistentSet
// ---------------------------------------------------------------

/// Association collection without duplicates (by instance identity).
/// Iteration follows insertion order.
#[derive(Clone)]
pub struct PersistentSet {
    shared: Arc<Shared>,
}

impl PersistentSet {
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// An initialized set; duplicate handles in `items` collapse.
    pub fn from_vec(items: Vec<ObjectRef>) -> Self {
        Self {
            shared: Arc::new(Shared::loaded(items, true)),
        }
    }

    pub fn lazy(loader: Arc<dyn CollectionLoader>) -> Self {
        Self {
            shared: Arc::new(Shared::lazy(loader, true)),
        }
    }

    pub fn state(&self) -> CollectionResult<CollectionState> {
        self.shared.state()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.shared.state(), Ok(CollectionState::Initialized))
    }

    pub fn initialize(&self) -> CollectionResult<()> {
        self.shared.ensure_initialized()
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.dirty.load(Ordering::SeqCst)
    }

    pub fn reset_dirty(&self) {
        self.shared.dirty.store(false, Ordering::SeqCst);
    }

    pub fn loaded_elements(&self) -> CollectionResult<Option<Vec<ObjectRef>>> {
        self.shared.loaded_elements()
    }

    pub fn len(&self) -> CollectionResult<usize> {
        self.shared.read(<[ObjectRef]>::len)
    }

    pub fn is_empty(&self) -> CollectionResult<bool> {
        self.shared.read(<[ObjectRef]>::is_empty)
    }

    pub fn contains(&self, object: &ObjectRef) -> CollectionResult<bool> {
        self.shared.read(|items| position(items, object).is_some())
    }

    /// Add `object`; returns `false` if it was already present.
    pub fn insert(&self, object: ObjectRef) -> CollectionResult<bool> {
        self.shared.write(|items| {
            if position(items, &object).is_some() {
                (false, false)
            } else {
                items.push(object);
                (true, true)
            }
        })
    }

    pub fn remove(&self, object: &ObjectRef) -> CollectionResult<bool> {
        self.shared.write(|items| match position(items, object) {
            Some(i) => {
                items.remove(i);
                (true, true)
            }
            None => (false, false),
        })
    }

    pub fn clear(&self) -> CollectionResult<()> {
        self.shared.write(|items| {
            let changed = !items.is_empty();
            items.clear();
            ((), changed)
        })
    }

    pub fn to_vec(&self) -> CollectionResult<Vec<ObjectRef>> {
        self.shared.read(<[ObjectRef]>::to_vec)
    }

    pub fn iter(&self) -> CollectionResult<std::vec::IntoIter<ObjectRef>> {
        Ok(self.to_vec()?.into_iter())
    }

    pub fn detached_copy(&self) -> CollectionResult<Self> {
        Ok(Self::from_vec(self.to_vec()?))
    }

    /// Set equality by instance identity, ignoring order.
    pub fn content_eq(&self, other: &Self) -> CollectionResult<bool> {
        let mine = self.to_vec()?;
        let theirs = other.to_vec()?;
        Ok(mine.len() == theirs.len() && mine.iter().all(|a| position(&theirs, a).is_some()))
    }
}

impl Default for PersistentSet {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<ObjectRef>> for PersistentSet {
    fn from(items: Vec<ObjectRef>) -> Self {
        Self::from_vec(items)
    }
}

impl fmt::Display for PersistentSet {
    /// Initializes the set.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PersistentSet")?;
        fmt_elements(f, &self.shared)
    }
}

impl fmt::Debug for PersistentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentSet")
            .field("state", &self.shared.state().ok())
            .field("len", &self.shared.loaded_len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

// ---------------------------------------------------------------
// PersistentCollection
// ---------------------------------------------------------------

/// Either kind of association collection, as held in a property value.
#[derive(Clone, Debug)]
pub enum PersistentCollection {
    List(PersistentList),
    Set(PersistentSet),
}

impl PersistentCollection {
    /// An initialized collection of the given kind.
    pub fn from_vec(kind: CollectionKind, items: Vec<ObjectRef>) -> Self {
        match kind {
            CollectionKind::List => Self::List(PersistentList::from_vec(items)),
            CollectionKind::Set => Self::Set(PersistentSet::from_vec(items)),
        }
    }

    /// An uninitialized collection of the given kind.
    pub fn lazy(kind: CollectionKind, loader: Arc<dyn CollectionLoader>) -> Self {
        match kind {
            CollectionKind::List => Self::List(PersistentList::lazy(loader)),
            CollectionKind::Set => Self::Set(PersistentSet::lazy(loader)),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::List(_) => CollectionKind::List,
            Self::Set(_) => CollectionKind::Set,
        }
    }

    pub fn is_initialized(&self) -> bool {
        match self {
            Self::List(l) => l.is_initialized(),
            Self::Set(s) => s.is_initialized(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Self::List(l) => l.is_dirty(),
            Self::Set(s) => s.is_dirty(),
        }
    }

    pub fn reset_dirty(&self) {
        match self {
            Self::List(l) => l.reset_dirty(),
            Self::Set(s) => s.reset_dirty(),
        }
    }

    pub fn loaded_elements(&self) -> CollectionResult<Option<Vec<ObjectRef>>> {
        match self {
            Self::List(l) => l.loaded_elements(),
            Self::Set(s) => s.loaded_elements(),
        }
    }

    pub fn to_vec(&self) -> CollectionResult<Vec<ObjectRef>> {
        match self {
            Self::List(l) => l.to_vec(),
            Self::Set(s) => s.to_vec(),
        }
    }

    pub fn len(&self) -> CollectionResult<usize> {
        match self {
            Self::List(l) => l.len(),
            Self::Set(s) => s.len(),
        }
    }
}
