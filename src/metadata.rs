//! Shared metadata views.
//!
//! A metadata tree is a plain value behind a lock, paired with a version
//! channel. Views hand out snapshots and bump the version on every update;
//! consumers re-snapshot when the version changes and never mutate in place.
//! `field` projects a view through a lens onto a struct field, `member`
//! publishes a keyed child of a map-typed view — together they let a
//! component own exactly the slice of the tree it is responsible for.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// A readable and writable view of one slice of a metadata tree.
pub struct ReadWriteView<T> {
    read: Arc<dyn Fn() -> T + Send + Sync>,
    write: Arc<dyn Fn(&mut dyn FnMut(&mut T)) + Send + Sync>,
    version: Arc<watch::Sender<u64>>,
}

impl<T> Clone for ReadWriteView<T> {
    fn clone(&self) -> Self {
        ReadWriteView {
            read: self.read.clone(),
            write: self.write.clone(),
            version: self.version.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ReadWriteView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReadWriteView")
    }
}

impl<T: Clone + Send + Sync + 'static> ReadWriteView<T> {
    /// Creates the root of a new metadata tree.
    pub fn root(initial: T) -> Self {
        let value = Arc::new(Mutex::new(initial));
        let version = Arc::new(watch::channel(0u64).0);
        let read = {
            let value = value.clone();
            Arc::new(move || value.lock().clone()) as Arc<dyn Fn() -> T + Send + Sync>
        };
        let write = {
            let version = version.clone();
            Arc::new(move |f: &mut dyn FnMut(&mut T)| {
                f(&mut value.lock());
                version.send_modify(|v| *v += 1);
            }) as Arc<dyn Fn(&mut dyn FnMut(&mut T)) + Send + Sync>
        };
        ReadWriteView {
            read,
            write,
            version,
        }
    }

    pub fn snapshot(&self) -> T {
        (self.read)()
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut f = Some(f);
        (self.write)(&mut move |t: &mut T| {
            if let Some(f) = f.take() {
                f(t)
            }
        });
    }

    /// Projects the view through a lens onto part of `T`.
    pub fn field<U: Clone + Send + Sync + 'static>(
        &self,
        lens: impl Fn(&mut T) -> &mut U + Send + Sync + 'static,
    ) -> ReadWriteView<U> {
        let lens = Arc::new(lens);
        let read = {
            let parent = self.read.clone();
            let lens = lens.clone();
            Arc::new(move || {
                let mut snapshot = parent();
                lens(&mut snapshot).clone()
            }) as Arc<dyn Fn() -> U + Send + Sync>
        };
        let write = {
            let parent = self.write.clone();
            Arc::new(move |f: &mut dyn FnMut(&mut U)| {
                parent(&mut |t: &mut T| f(lens(t)));
            }) as Arc<dyn Fn(&mut dyn FnMut(&mut U)) + Send + Sync>
        };
        ReadWriteView {
            read,
            write,
            version: self.version.clone(),
        }
    }

    pub fn read_only(&self) -> ReadView<T> {
        ReadView {
            read: self.read.clone(),
            version: self.version.subscribe(),
        }
    }
}

impl<K, V> ReadWriteView<BTreeMap<K, V>>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Default + Clone + Send + Sync + 'static,
{
    /// Publishes a keyed child of a map-typed view and returns a view of it.
    ///
    /// The member must not be removed from the map while the returned view is
    /// in use.
    pub fn member(&self, key: K) -> ReadWriteView<V> {
        {
            let key = key.clone();
            self.update(move |map| {
                map.entry(key).or_default();
            });
        }
        self.field(move |map: &mut BTreeMap<K, V>| {
            map.get_mut(&key).expect("member was published above")
        })
    }
}

/// A read-only view of one slice of a metadata tree.
pub struct ReadView<T> {
    read: Arc<dyn Fn() -> T + Send + Sync>,
    version: watch::Receiver<u64>,
}

impl<T> Clone for ReadView<T> {
    fn clone(&self) -> Self {
        ReadView {
            read: self.read.clone(),
            version: self.version.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ReadView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReadView")
    }
}

impl<T: Clone + Send + Sync + 'static> ReadView<T> {
    pub fn snapshot(&self) -> T {
        (self.read)()
    }

    /// Suspends until the tree changes anywhere. Re-snapshot afterwards.
    pub async fn changed(&mut self) {
        if self.version.changed().await.is_err() {
            // Every writer is gone; the value is frozen forever.
            std::future::pending::<()>().await;
        }
    }

    pub fn field<U: Clone + Send + Sync + 'static>(
        &self,
        project: impl Fn(&T) -> U + Send + Sync + 'static,
    ) -> ReadView<U> {
        let parent = self.read.clone();
        ReadView {
            read: Arc::new(move || project(&parent())),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Tree {
        label: String,
        children: BTreeMap<u32, String>,
    }

    #[test]
    fn field_views_share_the_root() {
        let root = ReadWriteView::root(Tree::default());
        let label = root.field(|t: &mut Tree| &mut t.label);
        label.update(|l| *l = "hello".into());
        assert_eq!(root.snapshot().label, "hello");
        assert_eq!(label.snapshot(), "hello");
    }

    #[test]
    fn members_publish_into_the_map() {
        let root = ReadWriteView::root(Tree::default());
        let children = root.field(|t: &mut Tree| &mut t.children);
        let child = children.member(7);
        child.update(|c| *c = "seven".into());
        assert_eq!(root.snapshot().children.get(&7).unwrap(), "seven");
    }

    #[tokio::test]
    async fn readers_observe_version_bumps() {
        let root = ReadWriteView::root(Tree::default());
        let mut view = root.read_only();
        assert_eq!(view.snapshot().label, "");
        let waiter = tokio::spawn({
            let mut view = view.clone();
            async move {
                view.changed().await;
                view.snapshot().label
            }
        });
        tokio::task::yield_now().await;
        root.update(|t| t.label = "bumped".into());
        assert_eq!(waiter.await.unwrap(), "bumped");
        view.changed().await;
        assert_eq!(view.snapshot().label, "bumped");
    }
}
