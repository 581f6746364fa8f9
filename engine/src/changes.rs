//! Batching of change events between a transaction settling and the sync
//! commit that confirms it.

use crate::ChangeMessage;

#[derive(Debug, Default)]
pub(crate) struct ChangeBuffer {
    batched: Vec<ChangeMessage>,
    pub should_batch: bool,
}

impl ChangeBuffer {
    /// Queue or release `changes`.
    ///
    /// With `force`, any batched events are released first, followed by
    /// `changes`. Returns `None` when there is nothing to deliver.
    pub fn emit(&mut self, changes: Vec<ChangeMessage>, force: bool) -> Option<Vec<ChangeMessage>> {
        if self.should_batch && !force {
            self.batched.extend(changes);
            return None;
        }

        let out = if force {
            self.should_batch = false;
            let mut out = std::mem::take(&mut self.batched);
            out.extend(changes);
            out
        } else {
            changes
        };

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    pub fn clear(&mut self) {
        self.batched.clear();
        self.should_batch = false;
    }
}
