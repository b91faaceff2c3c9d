pub mod novelty;
pub mod quality;
pub mod scoring;
