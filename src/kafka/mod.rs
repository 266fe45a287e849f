pub mod envelope;
pub mod producer;
pub mod publisher;
pub mod serializer;


pub use envelope::{Envelope, EnvelopeBuilder};
pub use producer::{KafkaProducer, MessageSink};
pub use publisher::{DeliveryOutcome, Publisher, RetryPolicy};
pub use serializer::JsonSerializer;
