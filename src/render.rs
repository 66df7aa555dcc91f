//! Render coalescing.
//!
//! Remote RENDER messages only queue a view id. The client timer drains the
//! queue and forces one render per distinct view. While a drain is forcing
//! renders, the `end_render` notifications it produces must not broadcast
//! RENDER again, or two clients would keep triggering each other forever.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;

use tracing::debug;

use crate::message::{self, StateMessage, ViewId};

/// View collaborator.
pub trait ViewHost {
    /// Render `view` synchronously. Implementations call `end_render` once
    /// the frame is done.
    fn force_render(&mut self, view: ViewId, end_render: &mut dyn FnMut(ViewId));
}

#[derive(Default)]
pub struct RenderCoalescer {
    pending: RefCell<BTreeSet<ViewId>>,
    rendering_from_notification: Cell<bool>,
}

impl RenderCoalescer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a render for `view`. Returns whether it was newly queued.
    pub fn request(&self, view: ViewId) -> bool {
        self.pending.borrow_mut().insert(view)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    #[must_use]
    pub fn is_pending(&self, view: ViewId) -> bool {
        self.pending.borrow().contains(&view)
    }

    /// False while a drain is forcing renders.
    #[must_use]
    pub fn can_trigger_render(&self) -> bool {
        !self.rendering_from_notification.get()
    }

    /// RENDER message to broadcast after a local render, or `None` when the
    /// render was itself caused by a remote trigger.
    #[must_use]
    pub fn end_render(&self, view: ViewId) -> Option<StateMessage> {
        self.can_trigger_render().then(|| message::render(view))
    }

    /// Force one render per queued view. Views are looked up through `views`;
    /// `on_end_render` sees every end-of-render notification. Returns the
    /// number of renders forced.
    pub fn drain<V>(&self, views: &mut V, on_end_render: &mut dyn FnMut(ViewId)) -> usize
    where
        V: ViewHost + ?Sized,
    {
        let batch = std::mem::take(&mut *self.pending.borrow_mut());
        if batch.is_empty() {
            return 0;
        }
        self.rendering_from_notification.set(true);
        for view in &batch {
            views.force_render(*view, on_end_render);
        }
        self.rendering_from_notification.set(false);
        debug!(count = batch.len(), "render: drained coalesced renders");
        batch.len()
    }
}
