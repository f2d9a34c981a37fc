mod decoder;
mod value;

pub use decoder::{decode, Decoder};
pub use value::Bencode;
