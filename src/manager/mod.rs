pub mod choke_scheduler;
pub mod orchestrator;
pub mod peer_session;
