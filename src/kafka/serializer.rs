use crate::{kafka::Envelope, Result};

pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(envelope: &Envelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(Into::into)
    }
}
