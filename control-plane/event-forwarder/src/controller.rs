use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::{
    Client, ResourceExt,
    api::Api,
    runtime::{Controller, controller::Action, watcher::Config},
};
use tokio::time::Duration;
use tracing::{debug, info, trace};

use crate::event::EventRef;
use crate::reconcile::{Outcome, Reconciler};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("transient failure: {0}")]
    Transient(String),
}

pub struct ControllerContext {
    pub reconciler: Reconciler,
    pub requeue_after: Duration,
}

/// Watch `core/v1` events and feed each one to the reconciler. Runs until
/// the watch stream ends or the future is dropped.
pub async fn run_controller(
    client: Client,
    watch_namespace: Option<String>,
    ctx: Arc<ControllerContext>,
) {
    let api: Api<Event> = match watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    info!(namespace = ?watch_namespace, "event controller starting");

    Controller::new(api, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    trace!(event = %obj_ref, ?action, "reconciled")
                }
                Err(e) => debug!(error = ?e, "reconcile error"),
            }
        })
        .await;
}

pub fn event_ref_of(obj: &Event) -> EventRef {
    EventRef::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

async fn reconcile(
    obj: Arc<Event>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let id = event_ref_of(&obj);
    action_for(ctx.reconciler.process(&id).await)
}

/// Transient failures go back through the controller's requeue; everything
/// else waits for the next change to the object.
fn action_for(outcome: Outcome) -> Result<Action, ReconcileErr> {
    match outcome {
        Outcome::TransientFailure(reason) => Err(ReconcileErr::Transient(reason)),
        Outcome::Delivered { .. }
        | Outcome::Skipped
        | Outcome::NotLeader
        | Outcome::PermanentFailure(_) => Ok(Action::await_change()),
    }
}

fn error_policy(
    _obj: Arc<Event>,
    _error: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    Action::requeue(ctx.requeue_after)
}
