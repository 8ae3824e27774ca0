pub mod defs;
pub mod genomes;
pub mod plan;
