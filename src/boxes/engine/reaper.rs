//! Reaper loop and startup GC pass.
//!
//! The reaper detects containers that died or vanished behind the
//! box's back and reconciles the containers map, running the
//! supervisor's kill path for cleanup. The engine connection is
//! disposable: any unclassified fault drops it and the next pass
//! reconnects.

use super::EngineBox;
use crate::constants::REAPER_RECONNECT_PAUSE;
use crate::engine::{ContainerState, EngineConn, EngineError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(super) async fn run(bx: Arc<EngineBox>) {
    info!(name = %bx.name, "reaper started");
    let step = Duration::from_secs(bx.config.waitloopstepsec);

    let mut conn = match bx.engine.connect().await {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!(error = %e, "unable to connect to engine");
            None
        }
    };

    if bx.config.gc {
        match &conn {
            Some(conn) => gc_pass(&bx, conn.as_ref()).await,
            None => warn!("skipping gc pass, engine unavailable"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = bx.token.cancelled() => {
                info!(name = %bx.name, "reaper stopped");
                return;
            }
        }

        if conn.is_none() {
            match bx.engine.connect().await {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    warn!(error = %e, "unable to connect to engine");
                    tokio::select! {
                        _ = tokio::time::sleep(REAPER_RECONNECT_PAUSE) => continue,
                        _ = bx.token.cancelled() => return,
                    }
                }
            }
        }

        let tracked = bx.tracked_ids();
        debug!(tracked = tracked.len(), "reaper pass");

        for id in tracked {
            let Some(c) = &conn else { break };
            match c.get_property(&id, "state").await {
                Err(EngineError::ContainerDoesNotExist(_)) => {
                    warn!(id = %id, "tracked container vanished from engine");
                    reap(&bx, &id).await;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "engine fault, dropping connection");
                    conn = None;
                }
                Ok(state) => {
                    if state.parse() == Ok(ContainerState::Dead) {
                        info!(id = %id, "container is dead");
                        reap(&bx, &id).await;
                    }
                }
            }
        }
    }
}

/// Removes the container from tracking and runs its kill path; both
/// sides are idempotent, so racing a client kill is harmless.
async fn reap(bx: &EngineBox, id: &str) {
    if let Some(supervisor) = bx.take_container(id) {
        if let Err(e) = supervisor.kill().await {
            debug!(id, error = %e, "reaper kill");
        }
    }
}

/// One-time pass over engine state left behind by a previous run:
/// destroys terminal containers, frees allocations not backed by a
/// live container IP, and unlinks volumes labeled as app volumes.
async fn gc_pass(bx: &EngineBox, conn: &dyn EngineConn) {
    info!(name = %bx.name, "gc pass");

    let names = match conn.list_containers().await {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, "unable to list containers for gc");
            Vec::new()
        }
    };

    let mut live_ips = Vec::new();
    for name in &names {
        let Ok(state) = conn.get_property(name, "state").await else {
            continue;
        };
        match state.parse() {
            Ok(ContainerState::Dead) | Ok(ContainerState::Stopped) => {
                debug!(id = %name, state = %state, "destroying stale container");
                if let Err(e) = conn.destroy(name).await {
                    warn!(id = %name, error = %e, "gc destroy failed");
                }
            }
            Ok(ContainerState::Running) | Ok(ContainerState::Starting) => {
                if let Ok(ip) = conn.get_property(name, "ip").await {
                    if ip.len() > 2 {
                        live_ips.push(ip);
                    }
                }
            }
            _ => {}
        }
    }

    match bx.net.used_allocations(&bx.token).await {
        Ok((allocations, stat)) => {
            debug!(stat = %stat, "allocation statistics");
            for allocation in allocations {
                if allocation.box_name != bx.name {
                    continue;
                }
                if live_ips.contains(&allocation.ip) {
                    debug!(ip = %allocation.ip, "allocation backed by a live container");
                    continue;
                }
                debug!(id = %allocation.id, net_id = %allocation.net_id, "freeing leaked allocation");
                if let Err(e) = bx
                    .net
                    .unuse_alloc(&bx.token, &allocation.net_id, &allocation.id, "GC state")
                    .await
                {
                    warn!(id = %allocation.id, error = %e, "unable to free allocation");
                }
            }
        }
        Err(e) => warn!(error = %e, "unable to query used allocations"),
    }

    match conn.list_volumes().await {
        Ok(volumes) => {
            for volume in volumes {
                if volume.properties.get("private").map(String::as_str)
                    == Some(bx.config.cocaineappvolumelabel.as_str())
                {
                    debug!(volume = %volume.path.display(), "unlinking leaked app volume");
                    if let Err(e) = conn.unlink_volume(&volume.path, "***").await {
                        warn!(volume = %volume.path.display(), error = %e, "gc unlink failed");
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "unable to list volumes for gc"),
    }
}
