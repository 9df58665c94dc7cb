pub mod dead_letters;
pub mod progress;
pub mod rewind;
pub mod status;
