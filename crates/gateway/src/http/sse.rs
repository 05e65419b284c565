use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, Sse},
};
use chrono::Utc;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::{error::ApiError, state::AppState, store::GatewayEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
pub struct EventsQuery {
    since: Option<i64>,
}

/// `GET /api/threads/:id/events`: replay from the client cursor, then
/// live events, strictly `seq`-ordered with no duplicates. A heartbeat
/// record goes out every 15 s; it carries no `id` and is not part of the
/// event sequence. Dropping the connection drops the subscription.
pub async fn thread_events(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let since = query.since.unwrap_or(0);
    let (replay, mut live) = state.bus.subscribe(&thread_id, since).await?;

    let stream = async_stream::stream! {
        let mut last_seq = since;
        for event in replay {
            last_seq = event.seq;
            yield Ok(gateway_event(&event));
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                received = live.recv() => match received {
                    // The live channel attached before the replay read;
                    // anything at or below the replay tail is a dup.
                    Some(event) if event.seq > last_seq => {
                        last_seq = event.seq;
                        yield Ok(gateway_event(&event));
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let data = json!({ "ts": Utc::now().timestamp_millis() });
                    yield Ok(Event::default().event("heartbeat").data(data.to_string()));
                }
            }
        }
    };

    Ok(Sse::new(stream))
}

fn gateway_event(event: &GatewayEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event("gateway")
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}
