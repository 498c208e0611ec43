//! Peerstate demo
//!
//! Hosts a scoreboard, lets a few players join over the in-memory network,
//! and plays some rounds.

mod config;

use std::sync::Arc;

use anyhow::Result;
use peerstate_session::{
    driver, HostMultiSession, IdentityStore, JoinMultiSession, JsonFileStore, MemoryNetwork,
    MemoryStore, Session, SessionChange, SessionConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::DemoConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scoreboard {
    round: u32,
    leader: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Player {
    name: String,
    score: u32,
}

type Host = HostMultiSession<Scoreboard, Player>;
type Joiner = JoinMultiSession<Scoreboard, Player>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerstate_demo=info,peerstate_session=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let demo = DemoConfig::from_env()?;
    let session_config = SessionConfig::from_env()?
        .with_peer_sample(&Player {
            name: String::new(),
            score: 0,
        })?
        .with_host_sample(&Scoreboard {
            round: 0,
            leader: None,
        })?;
    info!(joiners = demo.joiners, rounds = demo.rounds, "Starting peerstate demo");

    let network = MemoryNetwork::new();
    let host_store: Arc<dyn IdentityStore> = match &demo.identity_file {
        Some(path) => {
            info!(path = %path.display(), "Host identity file");
            Arc::new(JsonFileStore::open(path))
        }
        None => Arc::new(MemoryStore::new()),
    };

    let mut host: Host = HostMultiSession::new(
        Arc::new(network.clone()),
        host_store,
        Scoreboard {
            round: 0,
            leader: None,
        },
        session_config.clone(),
    )?;
    host.subscribe(|change| {
        if let SessionChange::Error(Some(message)) = change {
            warn!(%message, "Host error");
        }
    });
    host.poll();
    let target = host.own_identity().clone();
    info!(identity = %target, "Hosting");

    // Joiners share one store, namespaced per player.
    let joiner_store: Arc<dyn IdentityStore> = Arc::new(MemoryStore::new());
    let mut joiners = Vec::with_capacity(demo.joiners);
    for i in 0..demo.joiners {
        let name = format!("player-{}", i + 1);
        let joiner: Joiner = JoinMultiSession::new(
            Arc::new(network.clone()),
            joiner_store.clone(),
            target.clone(),
            Player {
                name: name.clone(),
                score: 0,
            },
            session_config.clone().with_namespace(name),
        )?;
        joiners.push(joiner);
    }
    settle(&mut host, &mut joiners);
    info!(connections = host.connection_count(), "Players joined");

    for round in 1..=demo.rounds {
        for (i, joiner) in joiners.iter_mut().enumerate() {
            let mut state = joiner.local_state().clone();
            state.score += round * (i as u32 + 1);
            joiner.set_local_state(state);
        }
        settle(&mut host, &mut joiners);

        let leader = host
            .peers()
            .into_iter()
            .max_by_key(|p| p.data.score)
            .map(|p| p.data.name);
        let report = host.set_local_state(Scoreboard { round, leader });
        settle(&mut host, &mut joiners);

        for peer in host.peers() {
            info!(round, peer = %peer.id, name = %peer.data.name, score = peer.data.score, "Host view");
        }
        if let Some(first) = joiners.first() {
            info!(
                round,
                siblings = first.peers().len(),
                board = ?first.host_state(),
                "First player's view"
            );
        }
        if !report.is_complete() {
            warn!(failed = report.failed.len(), "Scoreboard did not reach everyone");
        }
    }

    for joiner in &mut joiners {
        joiner.destroy();
    }
    network.close_endpoint(&target);
    let handled = driver::run(&mut host).await;
    info!(handled, peers = host.peers().len(), "Host endpoint closed, demo finished");

    Ok(())
}

fn settle(host: &mut Host, joiners: &mut [Joiner]) -> usize {
    let mut sessions: Vec<&mut dyn Session> = Vec::with_capacity(joiners.len() + 1);
    sessions.push(host);
    for joiner in joiners.iter_mut() {
        sessions.push(joiner);
    }
    driver::settle(&mut sessions)
}
