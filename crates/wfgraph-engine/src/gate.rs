//! Runtime concurrency groups.
//!
//! At most one holder per group is in flight. A newcomer either cancels the
//! holder (`cancel-in-progress: true`) or queues behind it; in both cases it
//! supersedes any older queued entry, which is cancelled. Holders release the
//! group by dropping their [`GroupPermit`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wfgraph_core::obs;

/// Why an admission did not produce a permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A newer entry for the same group replaced this one while it waited.
    Superseded { by: String },
    /// The entry's own token was cancelled while it waited.
    Cancelled,
}

impl std::fmt::Display for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Admission::Superseded { by } => write!(f, "superseded by {by}"),
            Admission::Cancelled => f.write_str("cancelled while waiting for concurrency group"),
        }
    }
}

struct Holder {
    id: String,
    token: CancellationToken,
}

struct Waiter {
    id: String,
    token: CancellationToken,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct GroupState {
    holder: Option<Holder>,
    waiter: Option<Waiter>,
}

type Groups = Arc<Mutex<HashMap<String, GroupState>>>;

/// Shared map from rendered group key to the entry holding it.
#[derive(Clone, Default)]
pub struct ConcurrencyGate {
    groups: Groups,
}

/// Ownership of a group; released on drop.
pub struct GroupPermit {
    groups: Groups,
    group: String,
    id: String,
}

impl std::fmt::Debug for GroupPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupPermit")
            .field("group", &self.group)
            .field("id", &self.id)
            .finish()
    }
}

impl GroupPermit {
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl Drop for GroupPermit {
    fn drop(&mut self) {
        let Ok(mut groups) = self.groups.lock() else {
            return;
        };
        release(&mut groups, &self.group, &self.id);
    }
}

impl GroupState {
    /// Pass the group to the queued waiter, if it is still listening.
    fn hand_over(&mut self) {
        self.holder = None;
        if let Some(Waiter { id, token, wake }) = self.waiter.take() {
            if wake.send(()).is_ok() {
                self.holder = Some(Holder { id, token });
            }
        }
    }
}

/// Release `id`'s claim on `group`, as holder or as waiter.
fn release(groups: &mut HashMap<String, GroupState>, group: &str, id: &str) {
    let Some(state) = groups.get_mut(group) else {
        return;
    };
    if state.waiter.as_ref().is_some_and(|w| w.id == id) {
        state.waiter = None;
    }
    if state.holder.as_ref().is_some_and(|h| h.id == id) {
        state.hand_over();
    }
    if state.holder.is_none() && state.waiter.is_none() {
        groups.remove(group);
    }
}

/// Withdraws a pending entry unless `acquire` turned it into a permit.
struct Pending<'a> {
    groups: &'a Groups,
    group: &'a str,
    id: &'a str,
    admitted: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        if let Ok(mut groups) = self.groups.lock() {
            release(&mut groups, self.group, self.id);
        }
    }
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `group` as `id`. `token` is cancelled if a newer entry with
    /// `cancel-in-progress` takes the group over.
    pub async fn acquire(
        &self,
        group: &str,
        id: &str,
        cancel_in_progress: bool,
        token: CancellationToken,
    ) -> Result<GroupPermit, Admission> {
        let wake = {
            let Ok(mut groups) = self.groups.lock() else {
                return Err(Admission::Cancelled);
            };
            let state = groups.entry(group.to_string()).or_default();

            if state.holder.is_none() {
                state.holder = Some(Holder {
                    id: id.to_string(),
                    token: token.clone(),
                });
                debug!(group = %group, id = %id, "concurrency group acquired");
                return Ok(self.permit(group, id));
            }

            if let Some(old) = state.waiter.take() {
                obs::emit_group_cancelled(group, &old.id, id);
                old.token.cancel();
            }
            if let Some(holder) = &state.holder {
                if cancel_in_progress {
                    obs::emit_group_cancelled(group, &holder.id, id);
                    holder.token.cancel();
                } else {
                    obs::emit_group_waiting(group, id, &holder.id);
                }
            }

            let (tx, rx) = oneshot::channel();
            state.waiter = Some(Waiter {
                id: id.to_string(),
                token: token.clone(),
                wake: tx,
            });
            rx
        };

        // Dropping this future mid-wait must not leave a holder nobody owns.
        let mut pending = Pending {
            groups: &self.groups,
            group,
            id,
            admitted: false,
        };
        tokio::select! {
            woken = wake => match woken {
                Ok(()) => {
                    pending.admitted = true;
                    Ok(self.permit(group, id))
                }
                Err(_) => Err(self.superseded_or_cancelled(group, id)),
            },
            _ = token.cancelled() => Err(self.superseded_or_cancelled(group, id)),
        }
    }

    /// Id of the current holder of `group`.
    pub fn holder_of(&self, group: &str) -> Option<String> {
        let groups = self.groups.lock().ok()?;
        groups.get(group)?.holder.as_ref().map(|h| h.id.clone())
    }

    fn permit(&self, group: &str, id: &str) -> GroupPermit {
        GroupPermit {
            groups: self.groups.clone(),
            group: group.to_string(),
            id: id.to_string(),
        }
    }

    fn superseded_or_cancelled(&self, group: &str, id: &str) -> Admission {
        let Ok(groups) = self.groups.lock() else {
            return Admission::Cancelled;
        };
        match groups.get(group).and_then(|s| s.waiter.as_ref()) {
            Some(w) if w.id != id => Admission::Superseded { by: w.id.clone() },
            _ => Admission::Cancelled,
        }
    }
}
