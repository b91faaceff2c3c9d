pub mod bundle;
pub mod caps;
pub mod lane0;
pub mod lane_a;
pub mod lane_b;
pub mod report;
