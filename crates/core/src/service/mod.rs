/// Hidden service system
///
/// This module provides the infrastructure for hidden services:
/// - Swarms (per-service role and known introduction points)
/// - Introduction points (seeder publication, relay hosting, PEX)
/// - Discovery (DHT lookups and PEX for downloaders)
/// - Rendezvous (linking two circuits end to end)

mod discovery;
mod introduction;
mod rendezvous;
pub mod swarm;

pub use swarm::{
    IntroductionPoint, RendezvousAttempt, Swarm, SwarmCallback, SwarmRegistry, SwarmRole,
};
