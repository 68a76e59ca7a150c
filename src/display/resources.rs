//! Ordered record of every kernel object a display session holds
//!
//! Objects are released strictly in reverse acquisition order. A [`Scope`]
//! marks the list on entry and, unless committed, releases everything
//! acquired after the mark when it goes out of scope.

use std::ops::{Deref, DerefMut};

use tracing::{trace, warn};

use super::kms::{KmsDevice, ObjectKind};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Looked-up topology object
    Object { kind: ObjectKind, id: u32 },
    PropertyBlob(u64),
    DumbBuffer(u32),
    Framebuffer(u32),
    GemHandle(u32),
}

impl Resource {
    fn release<K: KmsDevice>(self, kms: &K) -> Result<()> {
        match self {
            Self::Object { kind, id } => {
                kms.release_object(kind, id);
                Ok(())
            }
            Self::PropertyBlob(blob) => kms.destroy_blob(blob),
            Self::DumbBuffer(handle) => kms.destroy_dumb(handle),
            Self::Framebuffer(fb) => kms.remove_fb(fb),
            Self::GemHandle(handle) => kms.close_gem(handle),
        }
    }
}

#[derive(Debug, Default)]
pub struct Acquisitions {
    held: Vec<Resource>,
}

impl Acquisitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource) {
        trace!(?resource, "acquired");
        self.held.push(resource);
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.held.iter()
    }

    pub fn contains(&self, resource: &Resource) -> bool {
        self.held.contains(resource)
    }

    /// Release everything acquired after position `mark`, newest first
    ///
    /// Release failures are logged and do not stop the walk.
    pub fn release_from<K: KmsDevice>(&mut self, kms: &K, mark: usize) -> usize {
        let mut released = 0;
        while self.held.len() > mark {
            let Some(resource) = self.held.pop() else {
                break;
            };
            if let Err(e) = resource.release(kms) {
                warn!("Releasing {resource:?} failed: {e}");
            }
            trace!(?resource, "released");
            released += 1;
        }
        released
    }

    pub fn release_all<K: KmsDevice>(&mut self, kms: &K) -> usize {
        self.release_from(kms, 0)
    }

    /// Open a scope whose acquisitions roll back unless committed
    pub fn scope<'a, K: KmsDevice>(&'a mut self, kms: &'a K) -> Scope<'a, K> {
        Scope {
            mark: self.held.len(),
            list: self,
            kms,
            committed: false,
        }
    }
}

pub struct Scope<'a, K: KmsDevice> {
    list: &'a mut Acquisitions,
    kms: &'a K,
    mark: usize,
    committed: bool,
}

impl<K: KmsDevice> Scope<'_, K> {
    /// Keep everything acquired inside the scope
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Entries acquired since the scope opened
    pub fn acquired(&self) -> usize {
        self.list.len() - self.mark
    }
}

impl<K: KmsDevice> Deref for Scope<'_, K> {
    type Target = Acquisitions;

    fn deref(&self) -> &Acquisitions {
        self.list
    }
}

impl<K: KmsDevice> DerefMut for Scope<'_, K> {
    fn deref_mut(&mut self) -> &mut Acquisitions {
        self.list
    }
}

impl<K: KmsDevice> Drop for Scope<'_, K> {
    fn drop(&mut self) {
        if !self.committed {
            let released = self.list.release_from(self.kms, self.mark);
            if released > 0 {
                warn!("Rolled back {released} kernel objects");
            }
        }
    }
}
