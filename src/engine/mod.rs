pub mod backend_tpu_client;
pub mod cluster_source;
pub mod leader_tpu_cache;
pub mod leader_tpu_service;
pub mod recent_leaders_slot;
pub mod slot_watcher;
