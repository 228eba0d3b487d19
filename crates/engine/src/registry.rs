// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Renderers owned by a [`MediaCore`](crate::MediaCore), looked up by id.
//!
//! Sessions only ever store a [`RendererId`]. They resolve it here for each frame and drop
//! the handle straight away, so tearing a renderer down never leaves a session pointing at
//! a dead one: the next lookup simply misses.

use mediacore_core::RendererId;
use mediacore_nodes::render::Renderer;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Clone, Default)]
pub struct RendererRegistry {
    renderers: Arc<RwLock<HashMap<RendererId, Arc<Renderer>>>>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, renderer: Arc<Renderer>) {
        self.renderers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(renderer.id(), renderer);
    }

    pub fn get(&self, id: RendererId) -> Option<Arc<Renderer>> {
        self.renderers.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    pub fn contains(&self, id: RendererId) -> bool {
        self.renderers.read().unwrap_or_else(PoisonError::into_inner).contains_key(&id)
    }

    pub(crate) fn remove(&self, id: RendererId) -> Option<Arc<Renderer>> {
        self.renderers.write().unwrap_or_else(PoisonError::into_inner).remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Renderer>> {
        self.renderers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, r)| r)
            .collect()
    }

    pub fn ids(&self) -> Vec<RendererId> {
        let mut ids: Vec<RendererId> =
            self.renderers.read().unwrap_or_else(PoisonError::into_inner).keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mediacore_core::RenderConfig;
    use mediacore_nodes::render::HeadlessGpuContext;

    #[test]
    fn removed_renderer_no_longer_resolves() {
        let registry = RendererRegistry::new();
        let renderer = Arc::new(
            Renderer::spawn(Box::new(HeadlessGpuContext::new()), &RenderConfig::default()).unwrap(),
        );
        let id = renderer.id();
        registry.insert(renderer);
        assert!(registry.contains(id));
        assert_eq!(registry.ids(), vec![id]);

        let removed = registry.remove(id).unwrap();
        removed.shutdown();
        assert!(registry.get(id).is_none());
        assert!(registry.drain().is_empty());
    }
}
