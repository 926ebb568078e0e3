//! Server-sent event streams: the global event feed and per-task logs.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use verve_core::event::{Event, EventBroker, EventType};

use super::routes::{AppError, AppState};

/// Unsubscribes when the SSE stream is dropped.
struct SubscriptionGuard {
    broker: Arc<EventBroker>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub repo_id: Option<String>,
}

fn to_sse(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_owned());
    SseEvent::default().event(event.event_type.as_str()).data(data)
}

/// `GET /events`: synthetic `init` snapshot, then the live feed,
/// optionally filtered to one repository.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let broker = Arc::clone(state.service.broker());
    // Subscribe before snapshotting so no event falls in the gap.
    let (sub_id, mut rx) = broker.subscribe();
    let guard = SubscriptionGuard {
        broker,
        id: sub_id,
    };

    let tasks = match &query.repo_id {
        Some(repo_id) => state.service.list_by_repo(repo_id).await?,
        None => state.service.list_tasks().await?,
    };
    let repo_filter = query.repo_id.clone();

    let stream = async_stream::stream! {
        let _guard = guard;

        let init = json!({ "tasks": tasks });
        yield Ok(SseEvent::default()
            .event("init")
            .data(init.to_string()));

        while let Some(event) = rx.recv().await {
            if let Some(repo_id) = &repo_filter {
                if event.repo_id != *repo_id {
                    continue;
                }
            }
            yield Ok(to_sse(&event));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /tasks/{id}/logs`: replay stored log batches, then tail live
/// appends for the task.
pub async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    // 404 before the stream starts if the task is unknown.
    let task = state.service.get_task(&id).await?;

    let broker = Arc::clone(state.service.broker());
    let (sub_id, mut rx) = broker.subscribe();
    let guard = SubscriptionGuard {
        broker,
        id: sub_id,
    };

    let history = state.service.list_logs(&id).await?;
    let repo_id = task.repo_id;

    let stream = async_stream::stream! {
        let _guard = guard;

        for batch in history {
            let event = Event::logs_appended(&repo_id, &id, batch.attempt, batch.lines);
            yield Ok(to_sse(&event));
        }

        while let Some(event) = rx.recv().await {
            if event.event_type != EventType::LogsAppended || event.task_id != id {
                continue;
            }
            yield Ok(to_sse(&event));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
