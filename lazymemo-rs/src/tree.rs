//! Maps argument tuples onto their cache nodes.
//!
//! A computation which takes arguments needs a separate [CacheNode] per distinct argument tuple.
//! These are kept in a tree which has one level per argument position: The first level maps the
//! first argument onto a second level, which maps the second argument onto a third level and so
//! on. The last level finally maps onto the cache nodes. Levels and nodes are created on demand
//! and are never removed (an invalidation resets the nodes in place).
//!
//! The shape of the tree is determined by the argument type via the [Arguments] trait, which is
//! implemented for `()` (where the tree is a single node) and tuples of up to six elements.
//!
//! Arguments are compared by their [Eq] and [Hash] implementations, therefore two tuples which
//! are equal by value share the same node. If values should rather be told apart by identity,
//! they can be wrapped in a [ByIdentity].
//!
//! # Examples
//!
//! ```
//! # use lazymemo::tree::Arguments;
//! # use lazymemo::node::CacheNode;
//! # use std::sync::Arc;
//! type Args = (u32, String);
//! type Tree = <Args as Arguments<i32, String>>::Tree;
//! let tree: Arc<Tree> = Arc::new(Default::default());
//!
//! let resolve = |arguments: &Args| -> Arc<CacheNode<i32, String>> {
//!     <Args as Arguments<i32, String>>::resolve(&tree, arguments)
//! };
//! let node = resolve(&(1, "a".to_owned()));
//! let same = resolve(&(1, "a".to_owned()));
//! let other = resolve(&(1, "b".to_owned()));
//!
//! assert_eq!(Arc::ptr_eq(&node, &same), true);
//! assert_eq!(Arc::ptr_eq(&node, &other), false);
//! ```
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use fnv::FnvHashMap;

use crate::node::CacheNode;

/// Represents one level of the tree, keyed by the argument at its position.
///
/// **T** is either the next level or a [CacheNode] for the last position.
pub struct Level<K, T> {
    children: Mutex<FnvHashMap<K, Arc<T>>>,
}

impl<K, T> Default for Level<K, T> {
    fn default() -> Self {
        Level {
            children: Mutex::new(FnvHashMap::default()),
        }
    }
}

impl<K: Eq + Hash + Clone, T: Default> Level<K, T> {
    /// Returns the child for the given key, creating it if necessary.
    pub fn child(&self, key: &K) -> Arc<T> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = children.get(key) {
            return child.clone();
        }

        let child = Arc::new(T::default());
        let _ = children.insert(key.clone(), child.clone());

        child
    }

    /// Returns the number of distinct keys seen at this level.
    pub fn len(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Determines if no key has been seen at this level yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Visits all cache nodes reachable from a part of the tree.
pub trait Walk<V, E> {
    /// Appends all reachable nodes to **nodes**.
    ///
    /// This only takes a snapshot. Nodes being created concurrently might or might not be
    /// reported.
    fn collect_nodes(self: &Arc<Self>, nodes: &mut Vec<Arc<CacheNode<V, E>>>);
}

impl<V, E> Walk<V, E> for CacheNode<V, E> {
    fn collect_nodes(self: &Arc<Self>, nodes: &mut Vec<Arc<CacheNode<V, E>>>) {
        nodes.push(self.clone());
    }
}

impl<K, T: Walk<V, E>, V, E> Walk<V, E> for Level<K, T> {
    fn collect_nodes(self: &Arc<Self>, nodes: &mut Vec<Arc<CacheNode<V, E>>>) {
        // Release the lock before descending, so that callers aren't blocked for long...
        let children: Vec<Arc<T>> = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for child in children {
            child.collect_nodes(nodes);
        }
    }
}

/// Describes an argument tuple which can be used to look up a [CacheNode].
pub trait Arguments<V, E>: Clone + Send + Sync + 'static {
    /// The root of the tree storing the nodes for this kind of arguments.
    type Tree: Walk<V, E> + Default + Send + Sync + 'static;

    /// The number of argument positions.
    const ARITY: usize;

    /// Returns the node for the given arguments, creating all missing levels along the way.
    fn resolve(tree: &Arc<Self::Tree>, arguments: &Self) -> Arc<CacheNode<V, E>>;
}

impl<V, E> Arguments<V, E> for ()
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type Tree = CacheNode<V, E>;

    const ARITY: usize = 0;

    fn resolve(tree: &Arc<Self::Tree>, _arguments: &Self) -> Arc<CacheNode<V, E>> {
        tree.clone()
    }
}

macro_rules! nested_tree {
    ($value:ty, $error:ty;) => { CacheNode<$value, $error> };
    ($value:ty, $error:ty; $head:ident $(, $tail:ident)*) => {
        Level<$head, nested_tree!($value, $error; $($tail),*)>
    };
}

macro_rules! tuple_arguments {
    ($arity:expr; $($name:ident : $index:tt),+) => {
        impl<V, E, $($name),+> Arguments<V, E> for ($($name,)+)
        where
            V: Send + Sync + 'static,
            E: Send + Sync + 'static,
            $($name: Eq + Hash + Clone + Send + Sync + 'static),+
        {
            type Tree = nested_tree!(V, E; $($name),+);

            const ARITY: usize = $arity;

            fn resolve(tree: &Arc<Self::Tree>, arguments: &Self) -> Arc<CacheNode<V, E>> {
                let level = tree.clone();
                $(let level = level.child(&arguments.$index);)+

                level
            }
        }
    };
}

tuple_arguments!(1; K1: 0);
tuple_arguments!(2; K1: 0, K2: 1);
tuple_arguments!(3; K1: 0, K2: 1, K3: 2);
tuple_arguments!(4; K1: 0, K2: 1, K3: 2, K4: 3);
tuple_arguments!(5; K1: 0, K2: 1, K3: 2, K4: 3, K5: 4);
tuple_arguments!(6; K1: 0, K2: 1, K3: 2, K4: 3, K5: 4, K6: 5);

/// Wraps a shared value so that it is used as key by identity instead of by value.
///
/// Two wrappers are equal if (and only if) they point to the same allocation.
///
/// # Examples
///
/// ```
/// # use lazymemo::tree::ByIdentity;
/// # use std::sync::Arc;
/// let shared = Arc::new(vec![1, 2, 3]);
/// let first = ByIdentity(shared.clone());
/// let second = ByIdentity(shared);
/// let lookalike = ByIdentity(Arc::new(vec![1, 2, 3]));
///
/// assert_eq!(first == second, true);
/// assert_eq!(first == lookalike, false);
/// ```
#[derive(Debug)]
pub struct ByIdentity<T>(pub Arc<T>);

impl<T> Clone for ByIdentity<T> {
    fn clone(&self) -> Self {
        ByIdentity(self.0.clone())
    }
}

impl<T> PartialEq for ByIdentity<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Eq for ByIdentity<T> {}

impl<T> Hash for ByIdentity<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state)
    }
}
