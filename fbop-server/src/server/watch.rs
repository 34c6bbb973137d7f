//! Server-sent event streams over live store queries. Every `snapshot`
//! event carries the full current result set as a [`ServerEvent`].

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use fbop_shared::api::ServerEvent;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::warn;

use super::{AppError, AppState, ChildPath, DevicePath, FamilyPath};
use crate::protocol::{AccessState, Observed};

type EventStream = BoxStream<'static, Result<Event, axum::Error>>;
type SnapshotSse = Sse<KeepAliveStream<EventStream>>;

fn into_sse<T, F>(state: &AppState, items: Observed<T>, to_event: F) -> SnapshotSse
where
    T: Send + 'static,
    F: Fn(T) -> ServerEvent + Send + 'static,
{
    let events = items
        .map(move |item| match item {
            Ok(v) => Event::default().event("snapshot").json_data(to_event(v)),
            Err(e) => {
                warn!(error = %e, "watch: subscription failed");
                Ok(Event::default().event("error").data("subscription failed"))
            }
        })
        .take_until(state.shutdown_token().cancelled_owned())
        .boxed();
    Sse::new(events).keep_alive(KeepAlive::default())
}

pub(super) async fn family(
    State(state): State<AppState>,
    Path(p): Path<FamilyPath>,
) -> Result<SnapshotSse, AppError> {
    let items = state.protocols.families.observe_family(&p.family_id)?;
    Ok(into_sse(&state, items, |family| ServerEvent::Family {
        family: family.map(Into::into),
    }))
}

pub(super) async fn transactions(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
) -> Result<SnapshotSse, AppError> {
    let items = state
        .protocols
        .ledger
        .observe_transactions(&p.family_id, &p.child_id)?;
    Ok(into_sse(&state, items, |txs| ServerEvent::Transactions {
        items: txs.into_iter().map(Into::into).collect(),
    }))
}

pub(super) async fn devices(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
) -> Result<SnapshotSse, AppError> {
    let items = state
        .protocols
        .devices
        .observe_devices(&p.family_id, &p.child_id)?;
    Ok(into_sse(&state, items, |devices| ServerEvent::Devices {
        items: devices.into_iter().map(Into::into).collect(),
    }))
}

/// A device watching its own grant; `device: null` means revoked.
pub(super) async fn device_access(
    State(state): State<AppState>,
    Path(p): Path<DevicePath>,
) -> Result<SnapshotSse, AppError> {
    let items = state
        .protocols
        .devices
        .watch_access(&p.family_id, &p.child_id, &p.principal_id)?;
    Ok(into_sse(&state, items, |access| ServerEvent::Access {
        device: match access {
            AccessState::Granted(d) => Some(d.into()),
            AccessState::Revoked => None,
        },
    }))
}
