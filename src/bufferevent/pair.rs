//! Connected in-memory buffer event pairs.
//!
//! Each half's output buffer feeds the other half's input buffer
//! directly, with no descriptor in between. Transfer happens inside the
//! write call; the resulting callbacks always run deferred, from the
//! base's next loop iteration, so a write never re-enters user code.

use super::{BevInner, BevOptions, BufferEvent, Link, LinkState};
use crate::reactor::EventBase;
use std::cell::RefCell;
use std::rc::Rc;

impl BufferEvent {
    /// Builds two connected buffer events that exchange bytes through
    /// memory.
    ///
    /// Pairs have no descriptor: timeouts never fire and
    /// [`BevOptions::CLOSE_ON_FREE`] has nothing to close. Bytes a peer
    /// cannot take yet, because reading is disabled or its input sits at
    /// the high watermark, stay in the writer's output buffer and move
    /// once the peer drains.
    #[must_use]
    pub fn pair(base: &EventBase, options: BevOptions) -> (BufferEvent, BufferEvent) {
        let a = Self::bare(base, options);
        let b = Self::bare(base, options);
        {
            let mut inner = a.inner.borrow_mut();
            inner.link = Link::Pair(Rc::downgrade(&b.inner));
            inner.state = LinkState::Connected;
        }
        {
            let mut inner = b.inner.borrow_mut();
            inner.link = Link::Pair(Rc::downgrade(&a.inner));
            inner.state = LinkState::Connected;
        }
        (a, b)
    }
}

/// Moves bytes from `rc`'s output into its peer's input, honoring the
/// peer's enabled state and read high watermark, then schedules the
/// watermark callbacks on the base's deferred queue.
pub(super) fn shuttle(rc: &Rc<RefCell<BevInner>>) {
    let (peer_rc, base, fire_peer_read, fire_self_write) = {
        let mut me_guard = rc.borrow_mut();
        let me = &mut *me_guard;
        let Link::Pair(peer_weak) = &me.link else {
            return;
        };
        let Some(peer_rc) = peer_weak.upgrade() else {
            return;
        };
        let base = me.base.clone();
        let mut fire_peer_read = false;
        let mut fire_self_write = false;
        {
            let mut peer_guard = peer_rc.borrow_mut();
            let peer = &mut *peer_guard;
            if !peer.enabled.is_read() || peer.state != LinkState::Connected {
                return;
            }
            let room = if peer.read_high > 0 {
                peer.read_high.saturating_sub(peer.input.len())
            } else {
                usize::MAX
            };
            let n = room.min(me.output.len());
            if n > 0 {
                if let Ok(moved) = peer.input.move_from(&mut me.output, n) {
                    if moved > 0 {
                        fire_peer_read = peer.input.len() >= peer.read_low;
                        fire_self_write =
                            me.output.len() <= me.write_low && me.enabled.is_write();
                    }
                }
            }
        }
        (peer_rc, base, fire_peer_read, fire_self_write)
    };
    if fire_peer_read {
        let weak = Rc::downgrade(&peer_rc);
        base.defer(Box::new(move || {
            if let Some(rc) = weak.upgrade() {
                super::invoke_read(&rc);
            }
        }));
    }
    if fire_self_write {
        let weak = Rc::downgrade(rc);
        base.defer(Box::new(move || {
            if let Some(rc) = weak.upgrade() {
                super::invoke_write(&rc);
            }
        }));
    }
}
