pub mod command;
pub mod completion;
pub mod discovery;
pub mod file;
pub mod samplesheet;
pub mod streams;
pub mod system;
