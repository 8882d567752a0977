pub mod bus;
pub mod record;

pub use bus::{BusRoot, ConsumerBus, ProducerBus};
pub use record::Record;
