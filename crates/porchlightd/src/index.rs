//! Published gallery index.
//!
//! Rebuilds happen off to the side and are swapped in whole through a watch
//! channel, so a running session only ever sees a complete index.

use porchlight_core::{FaceIndex, PersonId};
use porchlight_store::{GalleryStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// One immutable generation of the gallery.
#[derive(Debug, Default)]
pub struct GallerySnapshot {
    pub index: FaceIndex,
    pub names: HashMap<PersonId, String>,
}

impl GallerySnapshot {
    pub fn name_of(&self, id: PersonId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }
}

#[derive(Clone)]
pub struct GalleryIndex {
    store: Arc<dyn GalleryStore>,
    tx: Arc<watch::Sender<Arc<GallerySnapshot>>>,
}

impl GalleryIndex {
    /// Starts empty; call [`refresh`](Self::refresh) to load the store.
    pub fn new(store: Arc<dyn GalleryStore>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(GallerySnapshot::default()));
        Self {
            store,
            tx: Arc::new(tx),
        }
    }

    pub fn current(&self) -> Arc<GallerySnapshot> {
        self.tx.borrow().clone()
    }

    pub fn store(&self) -> &Arc<dyn GalleryStore> {
        &self.store
    }

    /// Reload every person and publish a fresh index. Returns the gallery size.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let people = self.store.list_all().await?;
        let names = people
            .iter()
            .map(|p| (p.id, p.display_name.clone()))
            .collect();
        let index = FaceIndex::build(people.into_iter().map(|p| (p.id, p.descriptor)));
        let size = index.len();
        self.tx.send_replace(Arc::new(GallerySnapshot { index, names }));
        tracing::info!(people = size, "gallery index rebuilt");
        Ok(size)
    }
}
