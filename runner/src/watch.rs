//! Background watchers that make the cluster easier to follow during a run.
//! Nothing in the load test depends on them.
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client,
};
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle on a watcher running in the background.
#[async_trait::async_trait]
pub trait BackgroundWatcher: Send {
    /// Stop the watcher and wait for it to exit.
    async fn stop(self: Box<Self>);
}

/// Logs Warning events of a namespace, or of the whole cluster.
pub struct EventWatcher {
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl EventWatcher {
    /// Start watching Warning events.
    pub fn start(client: Client, namespace: Option<&str>) -> Self {
        let api: Api<Event> = match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        let cancellation = CancellationToken::new();
        let token = cancellation.clone();
        let task = tokio::spawn(async move {
            let events = watcher(api, watcher::Config::default().fields("type=Warning"))
                .default_backoff()
                .applied_objects();
            pin_mut!(events);
            loop {
                select! {
                    _ = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(Ok(event)) => log_event(&event),
                        Some(Err(err)) => debug!(%err, "event watch error"),
                        None => break,
                    }
                }
            }
        });
        Self { cancellation, task }
    }
}

fn log_event(event: &Event) {
    warn!(
        kind = event.involved_object.kind.as_deref().unwrap_or_default(),
        name = event.involved_object.name.as_deref().unwrap_or_default(),
        namespace = event.metadata.namespace.as_deref().unwrap_or_default(),
        reason = event.reason.as_deref().unwrap_or_default(),
        message = event.message.as_deref().unwrap_or_default(),
        "warning event"
    );
}

#[async_trait::async_trait]
impl BackgroundWatcher for EventWatcher {
    async fn stop(self: Box<Self>) {
        self.cancellation.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "event watcher did not exit cleanly");
        }
    }
}
