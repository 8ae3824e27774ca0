pub mod nanoseq;
