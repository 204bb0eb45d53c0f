pub mod affinity;
pub mod group;

pub use affinity::AffinityRegistry;
pub use group::GroupRegistry;
