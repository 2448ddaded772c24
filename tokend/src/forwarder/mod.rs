pub mod cache;
pub mod kafka;
pub mod stdout;

pub use kafka::KafkaForwarder;
pub use stdout::StdoutForwarder;
