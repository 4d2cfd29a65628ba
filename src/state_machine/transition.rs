use serde_json::json;

use super::job::{Job, JobEvent, JobFields};
use super::state::{JobStatus, StateMachine, Trigger};
use crate::error::{LifecycleError, StoreError};
use crate::store::{EventLog, JobStore};

/// Result of trying to commit a trigger against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// The conditional write landed; the job as it now stands.
    Advanced(Job),
    /// The job is already at or past the target status. Not an error.
    AlreadyAdvanced(JobStatus),
    /// The lifecycle table forbids this move. State is untouched.
    Rejected(LifecycleError),
    /// No job with that key.
    UnknownJob,
}

impl Advance {
    pub fn is_advanced(&self) -> bool {
        matches!(self, Advance::Advanced(_))
    }
}

/// Commit `trigger` for `key` as a conditional write and record the event.
///
/// The write only succeeds while the job still sits in the trigger's `from`
/// set. When it affects no rows the job is re-read: a status at or past the
/// target means a concurrent writer already advanced it.
pub async fn advance(
    store: &dyn JobStore,
    events: &dyn EventLog,
    key: &str,
    trigger: Trigger,
    fields: JobFields,
    source: serde_json::Value,
) -> Result<Advance, StoreError> {
    let Some(job) = store.get(key).await? else {
        return Ok(Advance::UnknownJob);
    };

    let transition = match StateMachine::plan(job.status, trigger) {
        Ok(t) => t,
        Err(_) if StateMachine::already_reached(job.status, trigger) => {
            return Ok(Advance::AlreadyAdvanced(job.status));
        }
        Err(e) => return Ok(Advance::Rejected(e)),
    };

    let rows = store
        .update_if_status_in(key, trigger.from_states(), transition.to, &fields)
        .await?;

    if rows == 0 {
        return Ok(match store.get(key).await? {
            None => Advance::UnknownJob,
            Some(current) if StateMachine::already_reached(current.status, trigger) => {
                Advance::AlreadyAdvanced(current.status)
            }
            Some(current) => Advance::Rejected(LifecycleError::Rejected {
                from: current.status,
                to: transition.to,
            }),
        });
    }

    let updated = store.get(key).await?.unwrap_or_else(|| {
        let mut local = job.clone();
        local.status = transition.to;
        local.apply(&fields);
        local
    });

    let payload = json!({
        "from": transition.from,
        "to": transition.to,
        "fields": fields,
        "source": source,
    });
    events
        .append(JobEvent::new(key, trigger.event_type(), payload, updated.machine_id))
        .await?;

    tracing::info!(
        job = %key,
        from = %transition.from,
        to = %transition.to,
        trigger = %trigger,
        "Job advanced"
    );

    Ok(Advance::Advanced(updated))
}
