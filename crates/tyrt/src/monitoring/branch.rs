//! The legacy BRANCH event.
//!
//! Registering a callback for BRANCH installs one wrapper on BRANCH_LEFT and
//! one on BRANCH_RIGHT. When the user callback disables itself from one
//! direction, the wrapper also removes the tool from the other direction's
//! slot, so a coverage tool that disables after the first hit stops seeing
//! either direction of that branch.

use std::sync::Arc;

use super::{
    callback::{Callback, CallbackResult, Disposition, EventArgs, MonitorCallback},
    events::Event,
    rewriter::remove_tools,
};

struct BranchHandler {
    handler: Callback,
    tool: u8,
    /// Installed on BRANCH_RIGHT rather than BRANCH_LEFT.
    right: bool,
}

impl MonitorCallback for BranchHandler {
    fn call(&self, args: &EventArgs<'_>) -> CallbackResult {
        let code = args.code;
        let src = args.offset;
        if src >= code.len() || !code.slot(src).is_instrumented() {
            // the other direction already disabled the branch
            return Ok(Disposition::Disable);
        }
        let result = self.handler.call(args)?;
        if result == Disposition::Disable {
            let sibling = {
                let state = code.state();
                state
                    .monitoring
                    .as_ref()
                    .and_then(|data| data.branch_sites.get(&src).copied())
            };
            let (slot, event) = match sibling {
                Some(site) if self.right => (site.left, Event::BranchLeft),
                Some(site) => (site.right, Event::BranchRight),
                None => (None, Event::BranchLeft),
            };
            if let Some(slot) = slot {
                remove_tools(&mut code.state_mut(), slot, event, 1 << self.tool);
            }
        }
        Ok(result)
    }

    fn wrapped(&self) -> Option<Callback> {
        Some(Arc::clone(&self.handler))
    }
}

/// Wrappers for BRANCH_LEFT and BRANCH_RIGHT around one BRANCH callback.
pub(crate) fn branch_handlers(tool: u8, handler: &Callback) -> (Callback, Callback) {
    let left = BranchHandler {
        handler: Arc::clone(handler),
        tool,
        right: false,
    };
    let right = BranchHandler {
        handler: Arc::clone(handler),
        tool,
        right: true,
    };
    (Arc::new(left), Arc::new(right))
}
