use std::sync::Arc;

use session_log::ContextResolver;
use tracing::info;
use worker_rpc::WorkerBridge;

use crate::{
    approvals::ApprovalCoordinator,
    bus::EventBus,
    config::GatewayConfig,
    dispatch::{StderrTail, WorkerDispatcher},
    error::ApiError,
    interactions::InteractionCoordinator,
    store::Store,
    terminal::{TerminalMux, TerminalMuxConfig},
    turns::TurnController,
};

/// Shared application state handed to every handler.
pub struct Gateway {
    pub config: GatewayConfig,
    pub store: Store,
    pub bridge: Arc<WorkerBridge>,
    pub bus: EventBus,
    pub approvals: ApprovalCoordinator,
    pub interactions: InteractionCoordinator,
    pub turns: TurnController,
    pub resolver: Arc<ContextResolver>,
    pub terminals: TerminalMux,
    pub stderr_tail: StderrTail,
}

pub type AppState = Arc<Gateway>;

/// Wires the components together, reconciles stale pending rows, and
/// registers the single worker-message dispatcher. Must complete before
/// the HTTP listener binds.
pub async fn build_gateway(
    config: GatewayConfig,
    store: Store,
    bridge: Arc<WorkerBridge>,
) -> Result<AppState, ApiError> {
    let bus = EventBus::new(store.clone());
    let resolver = Arc::new(ContextResolver::with_default_dirs(
        config.sessions_dir.clone(),
    ));
    let approvals = ApprovalCoordinator::new(store.clone(), bus.clone(), bridge.clone());
    let interactions = InteractionCoordinator::new(store.clone(), bus.clone(), bridge.clone());
    let turns = TurnController::new(store.clone(), bridge.clone(), resolver.clone());
    let terminals = TerminalMux::new(TerminalMuxConfig::default());
    let stderr_tail = StderrTail::default();

    let stale_approvals = approvals.reconcile_on_startup().await?;
    let stale_interactions = interactions.reconcile_on_startup().await?;
    if stale_approvals + stale_interactions > 0 {
        info!(
            stale_approvals,
            stale_interactions, "cancelled pending rows from a prior gateway generation"
        );
    }

    let events = bridge.subscribe().await;
    WorkerDispatcher {
        store: store.clone(),
        bus: bus.clone(),
        turns: turns.clone(),
        approvals: approvals.clone(),
        interactions: interactions.clone(),
        stderr_tail: stderr_tail.clone(),
    }
    .spawn(events);
    terminals.spawn_sweeper();

    Ok(Arc::new(Gateway {
        config,
        store,
        bridge,
        bus,
        approvals,
        interactions,
        turns,
        resolver,
        terminals,
        stderr_tail,
    }))
}
